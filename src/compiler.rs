//! Compiler facade.
//!
//! A compiler is started fire-and-forget and reports completion later through
//! a broadcast to every subscriber. It has no notion of who asked for a build.

use crate::error::CompilerError;
use crate::protocol::{DiagnosticMessage, Severity};
use regex::{Captures, Regex};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Completion event broadcast once per accepted `start_build`
#[derive(Debug, Clone, Default)]
pub struct BuildFinished {
    pub diagnostics: Vec<DiagnosticMessage>,
}

pub trait CompilerFacade: Send + Sync + 'static {
    /// Ask the compiler to build. Returns as soon as the build is underway.
    fn start_build(&self) -> Result<(), CompilerError>;

    /// Register for completion events. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<BuildFinished>;
}

/// Fan-out list of completion listeners
#[derive(Debug, Default)]
pub struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<BuildFinished>>>,
}

impl Subscribers {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BuildFinished> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `finished` to every live subscriber, returning how many received it
    pub fn broadcast(&self, finished: BuildFinished) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| !tx.is_closed());
        let delivered = senders
            .iter()
            .filter(|tx| tx.send(finished.clone()).is_ok())
            .count();
        if delivered == 0 {
            debug!("build finished with nobody subscribed");
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<BuildFinished>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs a shell command per build and turns its output into diagnostics
pub struct CommandCompiler {
    command: String,
    dir: PathBuf,
    subscribers: Arc<Subscribers>,
    /// Set while a build command runs. Cleared under the same lock as the
    /// completion broadcast, so a start never overlaps an undelivered build.
    building: Arc<Mutex<bool>>,
}

impl CommandCompiler {
    pub fn new(command: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            dir: dir.into(),
            subscribers: Arc::new(Subscribers::default()),
            building: Arc::new(Mutex::new(false)),
        }
    }
}

impl CompilerFacade for CommandCompiler {
    fn start_build(&self) -> Result<(), CompilerError> {
        let mut building = lock_flag(&self.building);
        if *building {
            debug!("build already in progress");
            return Err(CompilerError::Busy);
        }

        let child = shell_command(&self.command)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(source) => {
                return Err(CompilerError::Spawn {
                    command: self.command.clone(),
                    source,
                });
            }
        };
        *building = true;
        info!(command = %self.command, dir = %self.dir.display(), "build started");

        let subscribers = Arc::clone(&self.subscribers);
        let flag = Arc::clone(&self.building);
        tokio::spawn(async move {
            let diagnostics = collect_diagnostics(child).await;
            info!(count = diagnostics.len(), "build finished");
            let mut building = lock_flag(&flag);
            subscribers.broadcast(BuildFinished { diagnostics });
            *building = false;
        });

        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BuildFinished> {
        self.subscribers.subscribe()
    }
}

fn lock_flag(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(PoisonError::into_inner)
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C");
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c");
        cmd
    };
    cmd.arg(command);
    cmd
}

async fn collect_diagnostics(mut child: Child) -> Vec<DiagnosticMessage> {
    let mut diagnostics = Vec::new();

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        diagnostics.push(DiagnosticMessage::new(
            Severity::Error,
            "build output was not captured",
        ));
        return diagnostics;
    };
    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    // Interleave both streams in arrival order
    while stdout_open || stderr_open {
        tokio::select! {
            line = stdout_reader.next_line(), if stdout_open => match line {
                Ok(Some(line)) => diagnostics.extend(parse_line(&line)),
                Ok(None) => stdout_open = false,
                Err(e) => {
                    warn!(error = %e, "error reading build stdout");
                    stdout_open = false;
                }
            },
            line = stderr_reader.next_line(), if stderr_open => match line {
                Ok(Some(line)) => diagnostics.extend(parse_line(&line)),
                Ok(None) => stderr_open = false,
                Err(e) => {
                    warn!(error = %e, "error reading build stderr");
                    stderr_open = false;
                }
            },
        }
    }

    match child.wait().await {
        Ok(status) if !status.success() => {
            let has_error = diagnostics.iter().any(|d| d.severity == Severity::Error);
            if !has_error {
                diagnostics.push(DiagnosticMessage::new(
                    Severity::Error,
                    format!(
                        "build command exited with code {}",
                        status.code().unwrap_or(-1)
                    ),
                ));
            }
        }
        Ok(_) => {}
        Err(e) => diagnostics.push(DiagnosticMessage::new(
            Severity::Error,
            format!("failed to wait for build command: {e}"),
        )),
    }

    diagnostics
}

// `File.cs(14,94): error CS1585: text [Project.csproj]`
static MSBUILD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<file>[^(]+?)\((?P<line>\d+)(?:,(?P<column>\d+))?(?:,\d+,\d+)?\)\s*:\s*(?P<severity>fatal error|error|warning|info|message|note)(?:\s+(?P<code>[A-Za-z]+\d+))?\s*:\s*(?P<text>.+?)(?:\s+\[[^\]]+\])?\s*$",
    )
    .expect("msbuild pattern is valid")
});

// `src/a.c:3:5: warning: text`
static GCC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>(?:[A-Za-z]:)?[^:]+):(?P<line>\d+)(?::(?P<column>\d+))?:\s*(?P<severity>fatal error|error|warning|info|note)(?:\[(?P<code>[^\]]+)\])?:\s*(?P<text>.+?)\s*$",
    )
    .expect("gcc pattern is valid")
});

// `error[E0308]: text`
static BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<severity>fatal error|error|warning|info|note)(?:\[(?P<code>[^\]]+)\])?:\s*(?P<text>.+?)\s*$",
    )
    .expect("bare pattern is valid")
});

/// Parse one line of compiler output, ignoring lines that are not diagnostics
pub fn parse_line(line: &str) -> Option<DiagnosticMessage> {
    let line = line.trim_end();
    if let Some(caps) = MSBUILD.captures(line).or_else(|| GCC.captures(line)) {
        let message = from_captures(&caps)?;
        return Some(message.at(
            caps["file"].trim(),
            number(&caps, "line"),
            number(&caps, "column"),
        ));
    }
    BARE.captures(line).and_then(|caps| from_captures(&caps))
}

fn from_captures(caps: &Captures<'_>) -> Option<DiagnosticMessage> {
    let severity = match &caps["severity"] {
        "error" | "fatal error" => Severity::Error,
        "warning" => Severity::Warning,
        "info" | "note" | "message" => Severity::Info,
        _ => return None,
    };
    let text = match caps.name("code") {
        Some(code) => format!("{} {}", code.as_str(), &caps["text"]),
        None => caps["text"].to_string(),
    };
    Some(DiagnosticMessage::new(severity, text))
}

fn number(caps: &Captures<'_>, name: &str) -> u32 {
    caps.name(name)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}
