use crate::server::ServerState;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Failures that keep the server from entering `Listening`
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server cannot start while {0:?}")]
    AlreadyRunning(ServerState),
}

/// Why a waiter did not receive a build result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("build was abandoned before it finished")]
    Abandoned,
    #[error("build did not finish within {0:?}")]
    Timeout(Duration),
}

/// Failures local to one connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection I/O failed")]
    Io(#[from] std::io::Error),
    #[error("request frame longer than {limit} bytes")]
    FrameTooLong { limit: usize },
    #[error(transparent)]
    Job(#[from] JobError),
}

#[derive(Debug, Error)]
#[error("failed to encode build result: {0}")]
pub struct EncodingError(#[from] serde_json::Error);

/// The compiler refused to start a build
#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("failed to spawn build command `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("a build is already in progress")]
    Busy,
}
