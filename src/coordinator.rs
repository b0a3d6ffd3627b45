//! Job coordinator.
//!
//! A single actor task owns the build slot. Sessions talk to it through a
//! [`CoordinatorHandle`]; the compiler talks to it through the completion
//! channel it subscribed to at spawn time. Every state transition happens on
//! the actor's loop, so a completion can never race a new request.
//!
//! ```text
//! Session --RequestBuild--> JobCoordinator --start_build--> CompilerFacade
//!    ^                            |                               |
//!    +------ watch(JobState) -----+<------- BuildFinished --------+
//! ```

use crate::compiler::{BuildFinished, CompilerFacade};
use crate::error::JobError;
use crate::protocol::BuildResult;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    Shutdown,
    TimedOut(Duration),
    StartFailed,
    CompilerGone,
}

/// Observable state of one job
#[derive(Debug, Clone)]
pub enum JobState {
    Running,
    Completed(Arc<BuildResult>),
    Abandoned(AbandonReason),
}

impl JobState {
    fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// A waiter's view of a job. Any number of handles may share one job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(mut self) -> Result<Arc<BuildResult>, JobError> {
        // A dropped sender without a terminal state means the coordinator went away.
        let state = self
            .state
            .wait_for(JobState::is_terminal)
            .await
            .map_err(|_| JobError::Abandoned)?;
        match &*state {
            JobState::Completed(result) => Ok(Arc::clone(result)),
            JobState::Abandoned(AbandonReason::TimedOut(limit)) => Err(JobError::Timeout(*limit)),
            JobState::Abandoned(_) | JobState::Running => Err(JobError::Abandoned),
        }
    }
}

enum Command {
    RequestBuild { reply: oneshot::Sender<JobHandle> },
    CurrentJob { reply: oneshot::Sender<Option<JobId>> },
}

/// Cloneable entry point to the coordinator actor
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Join the running build, or start a new one if the slot is idle
    pub async fn request_build(&self) -> Result<JobHandle, JobError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RequestBuild { reply })
            .await
            .map_err(|_| JobError::Abandoned)?;
        rx.await.map_err(|_| JobError::Abandoned)
    }

    /// The job currently occupying the slot, if any
    pub async fn current_job(&self) -> Option<JobId> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::CurrentJob { reply }).await.ok()?;
        rx.await.ok().flatten()
    }
}

struct ActiveJob {
    id: JobId,
    started_at: Instant,
    deadline: Option<Instant>,
    state: watch::Sender<JobState>,
}

pub struct JobCoordinator {
    compiler: Arc<dyn CompilerFacade>,
    commands: mpsc::Receiver<Command>,
    completions: mpsc::UnboundedReceiver<BuildFinished>,
    shutdown: watch::Receiver<bool>,
    build_timeout: Option<Duration>,
    slot: Option<ActiveJob>,
    next_id: u64,
    /// Timed-out builds whose completion has not arrived yet
    stale_builds: usize,
    compiler_open: bool,
}

impl JobCoordinator {
    /// Subscribe to `compiler` and start the actor. The subscription lives as
    /// long as the returned task.
    pub fn spawn(
        compiler: Arc<dyn CompilerFacade>,
        build_timeout: Option<Duration>,
        shutdown: watch::Receiver<bool>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let completions = compiler.subscribe();
        let coordinator = Self {
            compiler,
            commands,
            completions,
            shutdown,
            build_timeout,
            slot: None,
            next_id: 1,
            stale_builds: 0,
            compiler_open: true,
        };
        let task = tokio::spawn(coordinator.run());
        (CoordinatorHandle { tx }, task)
    }

    async fn run(mut self) {
        loop {
            let deadline = self.slot.as_ref().and_then(|job| job.deadline);

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }

                finished = self.completions.recv(), if self.compiler_open => match finished {
                    Some(finished) => self.on_finished(finished),
                    None => {
                        self.compiler_open = false;
                        warn!("compiler closed its completion channel");
                        self.abandon(AbandonReason::CompilerGone);
                    }
                },

                () = sleep_until(deadline) => self.on_deadline(),

                command = self.commands.recv() => match command {
                    Some(command) => self.dispatch(command),
                    None => break,
                },
            }
        }

        self.abandon(AbandonReason::Shutdown);
        debug!("job coordinator stopped");
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::RequestBuild { reply } => {
                let handle = self.join_or_start();
                // The requester may have gone away; the job runs on regardless.
                let _ = reply.send(handle);
            }
            Command::CurrentJob { reply } => {
                let _ = reply.send(self.slot.as_ref().map(|job| job.id));
            }
        }
    }

    fn join_or_start(&mut self) -> JobHandle {
        if let Some(job) = &self.slot {
            debug!(job = %job.id, waiters = job.state.receiver_count(), "joining running build");
            return JobHandle {
                id: job.id,
                state: job.state.subscribe(),
            };
        }

        let id = JobId(self.next_id);
        self.next_id += 1;

        if !self.compiler_open {
            warn!(job = %id, "compiler is gone; not starting build");
            return abandoned(id, AbandonReason::CompilerGone);
        }

        if let Err(e) = self.compiler.start_build() {
            warn!(job = %id, error = %e, "compiler refused to start build");
            return abandoned(id, AbandonReason::StartFailed);
        }

        let started_at = Instant::now();
        let (tx, state) = watch::channel(JobState::Running);
        self.slot = Some(ActiveJob {
            id,
            started_at,
            deadline: self.build_timeout.map(|limit| started_at + limit),
            state: tx,
        });
        info!(job = %id, "build requested");

        JobHandle { id, state }
    }

    fn on_finished(&mut self, finished: BuildFinished) {
        // Completions arrive in start order, so the oldest timed-out builds report first.
        if self.stale_builds > 0 {
            self.stale_builds -= 1;
            warn!(
                diagnostics = finished.diagnostics.len(),
                remaining = self.stale_builds,
                "discarding late completion of a timed-out build"
            );
            return;
        }

        let Some(job) = self.slot.take() else {
            warn!(
                diagnostics = finished.diagnostics.len(),
                "discarding build completion with no running job"
            );
            return;
        };

        let waiters = job.state.receiver_count();
        info!(
            job = %job.id,
            diagnostics = finished.diagnostics.len(),
            elapsed_ms = job.started_at.elapsed().as_millis() as u64,
            waiters,
            "build completed"
        );
        if waiters == 0 {
            debug!(job = %job.id, "nobody waiting; result discarded");
        }
        job.state
            .send_replace(JobState::Completed(Arc::new(BuildResult::new(
                finished.diagnostics,
            ))));
    }

    fn on_deadline(&mut self) {
        if let Some(limit) = self.build_timeout {
            if self.abandon(AbandonReason::TimedOut(limit)) {
                self.stale_builds += 1;
            }
        }
    }

    /// Abandon the running job, returning whether there was one
    fn abandon(&mut self, reason: AbandonReason) -> bool {
        let Some(job) = self.slot.take() else {
            return false;
        };
        warn!(job = %job.id, ?reason, waiters = job.state.receiver_count(), "abandoning build");
        job.state.send_replace(JobState::Abandoned(reason));
        true
    }
}

fn abandoned(id: JobId, reason: AbandonReason) -> JobHandle {
    let (_, state) = watch::channel(JobState::Abandoned(reason));
    JobHandle { id, state }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
