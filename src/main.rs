mod client;
mod compiler;
mod config;
mod coordinator;
mod error;
mod protocol;
mod server;
mod session;

use anyhow::Result;
use clap::{Parser, Subcommand};
use compiler::CommandCompiler;
use config::{ServerConfig, DEFAULT_PORT};
use server::BuildServer;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Parser)]
#[command(name = "build-relay")]
#[command(about = "Trigger a build over TCP and receive its diagnostics as JSON")]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the build server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Address to listen on
        #[arg(long, default_value_t = LOCALHOST)]
        host: IpAddr,

        /// Working directory for the build command
        #[arg(short = 'd', long, default_value = ".")]
        dir: PathBuf,

        /// Build command to run for each build
        #[arg(short, long)]
        command: String,

        /// Abandon a build that has not finished after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Seconds to wait for open connections when shutting down
        #[arg(long, default_value = "2")]
        grace: u64,
    },

    /// Ask the server for a build and print the diagnostics
    Build {
        /// Port to connect to
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Address to connect to
        #[arg(long, default_value_t = LOCALHOST)]
        host: IpAddr,

        /// Print the raw JSON report
        #[arg(long)]
        json: bool,
    },

    /// Check if the server is running
    Status {
        /// Port to check
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Address to check
        #[arg(long, default_value_t = LOCALHOST)]
        host: IpAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            dir,
            command,
            timeout,
            grace,
        } => {
            let config = ServerConfig {
                host,
                build_timeout: timeout.map(Duration::from_secs),
                shutdown_grace: Duration::from_secs(grace),
            };
            serve(config, port, CommandCompiler::new(command, dir)).await?;
        }
        Commands::Build { port, host, json } => {
            let code = client::run_build(host, port, json).await?;
            std::process::exit(code);
        }
        Commands::Status { port, host } => {
            client::check_status(host, port).await?;
        }
    }

    Ok(())
}

async fn serve(config: ServerConfig, port: u16, compiler: CommandCompiler) -> Result<()> {
    let server = BuildServer::new(config, Arc::new(compiler));
    let addr = server.start(port).await?;
    info!(%addr, "ready to accept build requests");

    shutdown_signal().await?;
    info!("shutdown requested");
    server.stop().await;
    info!(state = ?server.state().await, "exiting");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
