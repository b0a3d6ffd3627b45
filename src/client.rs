use crate::protocol::{BuildResult, DiagnosticMessage, Severity};
use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Trigger one build and print its report. Returns the process exit code.
pub async fn run_build(host: IpAddr, port: u16, json: bool) -> Result<i32> {
    let mut stream = TcpStream::connect((host, port)).await.context(format!(
        "Failed to connect to build server on {}:{}. Is the server running?",
        host, port
    ))?;

    stream.write_all(b"build\n").await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        bail!("Server closed the connection before the build finished");
    }

    let result: BuildResult =
        serde_json::from_str(line.trim_end()).context("Malformed build report")?;

    if json {
        println!("{}", line.trim_end());
    } else {
        print_report(&result);
    }

    Ok(if result.error_count() > 0 { 1 } else { 0 })
}

fn print_report(result: &BuildResult) {
    for message in &result.messages {
        let line = format_message(message);
        match message.severity {
            Severity::Error | Severity::Warning => eprintln!("{}", line),
            Severity::Info => println!("{}", line),
        }
    }
    println!(
        "Build finished: {} error(s), {} warning(s)",
        result.error_count(),
        result.warning_count()
    );
}

fn format_message(message: &DiagnosticMessage) -> String {
    let severity = match message.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    };
    match (message.source_file.is_empty(), message.line) {
        (true, _) => format!("{}: {}", severity, message.text),
        (false, 0) => format!("{}: {}: {}", message.source_file, severity, message.text),
        (false, line) => format!(
            "{}:{}:{}: {}: {}",
            message.source_file, line, message.column, severity, message.text
        ),
    }
}

pub async fn check_status(host: IpAddr, port: u16) -> Result<()> {
    match TcpStream::connect((host, port)).await {
        Ok(_) => println!("Build server is running on {}:{}", host, port),
        Err(_) => println!("Build server is NOT running on {}:{}", host, port),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_located_message() {
        let message = DiagnosticMessage::new(Severity::Error, "CS1585 bad").at("A.cs", 14, 94);
        assert_eq!(format_message(&message), "A.cs:14:94: error: CS1585 bad");
    }

    #[test]
    fn formats_file_without_position() {
        let message = DiagnosticMessage::new(Severity::Warning, "deprecated").at("a.toml", 0, 0);
        assert_eq!(format_message(&message), "a.toml: warning: deprecated");
    }

    #[test]
    fn formats_unlocated_message() {
        let message = DiagnosticMessage::new(Severity::Info, "done");
        assert_eq!(format_message(&message), "info: done");
    }
}
