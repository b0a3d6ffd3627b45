use crate::compiler::CompilerFacade;
use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorHandle, JobCoordinator};
use crate::error::{ConnectionError, JobError, ServerError};
use crate::session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

/// Pause after a failed accept so persistent errors (e.g. EMFILE) do not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Listening,
    Stopping,
    Stopped,
}

enum Lifecycle {
    NotStarted,
    Listening(Running),
    Stopping,
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> ServerState {
        match self {
            Lifecycle::NotStarted => ServerState::NotStarted,
            Lifecycle::Listening(_) => ServerState::Listening,
            Lifecycle::Stopping => ServerState::Stopping,
            Lifecycle::Stopped => ServerState::Stopped,
        }
    }
}

/// Everything that exists only while listening
struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    coordinator: CoordinatorHandle,
    coordinator_task: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

/// Owns the listener, the job coordinator and every session for one
/// listening lifetime. Can be started again after it has stopped.
pub struct BuildServer {
    config: ServerConfig,
    compiler: Arc<dyn CompilerFacade>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl BuildServer {
    pub fn new(config: ServerConfig, compiler: Arc<dyn CompilerFacade>) -> Self {
        Self {
            config,
            compiler,
            lifecycle: Arc::new(Mutex::new(Lifecycle::NotStarted)),
        }
    }

    pub async fn state(&self) -> ServerState {
        self.lifecycle.lock().await.state()
    }

    /// Bind `host:port` and start accepting connections
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::NotStarted | Lifecycle::Stopped => {}
            other => return Err(ServerError::AlreadyRunning(other.state())),
        }

        let addr = SocketAddr::new(self.config.host, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (coordinator, coordinator_task) = JobCoordinator::spawn(
            Arc::clone(&self.compiler),
            self.config.build_timeout,
            shutdown_rx.clone(),
        );
        let acceptor = tokio::spawn(
            accept_loop(
                listener,
                coordinator.clone(),
                shutdown_rx,
                self.config.shutdown_grace,
            )
            .instrument(info_span!("listener", addr = %local_addr)),
        );

        info!(addr = %local_addr, "build server listening");
        *lifecycle = Lifecycle::Listening(Running {
            local_addr,
            shutdown,
            coordinator,
            coordinator_task,
            acceptor,
        });
        Ok(local_addr)
    }

    /// Stop listening, abandon the running build and close every session.
    /// Does nothing unless the server is listening.
    pub async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle.lock().await;
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Listening(running) => running,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        // Teardown runs on its own task so it still reaches `Stopped` if this
        // future is dropped.
        let lifecycle = Arc::clone(&self.lifecycle);
        let teardown = tokio::spawn(async move {
            running.teardown().await;
            *lifecycle.lock().await = Lifecycle::Stopped;
            info!("build server stopped");
        });
        if let Err(e) = teardown.await {
            warn!(error = %e, "server teardown failed");
        }
    }
}

impl Running {
    async fn teardown(self) {
        if let Some(job) = self.coordinator.current_job().await {
            info!(job = %job, "stopping with a build in flight");
        }
        info!(addr = %self.local_addr, "build server stopping");
        // send only fails when every receiver is already gone
        let _ = self.shutdown.send(true);

        if let Err(e) = self.acceptor.await {
            warn!(error = %e, "listener task failed");
        }
        if let Err(e) = self.coordinator_task.await {
            warn!(error = %e, "job coordinator task failed");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    coordinator: CoordinatorHandle,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "connection accepted");
                    let coordinator = coordinator.clone();
                    let shutdown = shutdown.clone();
                    sessions.spawn(
                        async move {
                            match session::handle_connection(stream, coordinator, shutdown).await {
                                Ok(()) => debug!("connection closed"),
                                Err(ConnectionError::Job(JobError::Abandoned)) => {
                                    info!("build abandoned; closing connection");
                                }
                                Err(e) => warn!(error = %e, "closing connection"),
                            }
                        }
                        .instrument(info_span!("session", %peer)),
                    );
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(error = %e, "failed to accept connection");
                    if backoff(&mut shutdown).await {
                        break;
                    }
                }
            },

            // Reap finished sessions so the set does not grow unbounded
            Some(_) = sessions.join_next() => {}
        }
    }

    // Close the listening socket before waiting on sessions
    drop(listener);

    let open = sessions.len();
    if open > 0 {
        debug!(open, "waiting for sessions to close");
    }
    let drained = tokio::time::timeout(grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = sessions.len(), "aborting sessions after grace period");
        sessions.shutdown().await;
    }
}

/// Wait out `ACCEPT_BACKOFF`, returning `true` if shutdown was signalled first
async fn backoff(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(ACCEPT_BACKOFF) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::testing::ManualCompiler;
    use crate::protocol::{DiagnosticMessage, Severity};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn started() -> (BuildServer, Arc<ManualCompiler>, SocketAddr) {
        let compiler = Arc::new(ManualCompiler::default());
        let server = BuildServer::new(ServerConfig::default(), compiler.clone());
        let addr = server.start(0).await.unwrap();
        (server, compiler, addr)
    }

    async fn read_response(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        timeout(WAIT, reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line
    }

    #[tokio::test]
    async fn reports_diagnostics_end_to_end() {
        let (server, compiler, addr) = started().await;

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        client.get_mut().write_all(b"x\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();

        compiler.finish(vec![
            DiagnosticMessage::new(Severity::Error, "CS1585 ...").at("A.cs", 14, 94),
        ]);

        assert_eq!(
            read_response(&mut client).await,
            "{\"messages\":[{\"type\":\"Error\",\"message\":\"CS1585 ...\",\"file\":\"A.cs\",\"line\":14,\"column\":94}]}\n"
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn reports_empty_build_end_to_end() {
        let (server, compiler, addr) = started().await;

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        client.get_mut().write_all(b"\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();
        compiler.finish(Vec::new());

        assert_eq!(read_response(&mut client).await, "{\"messages\":[]}\n");
        server.stop().await;
    }

    #[tokio::test]
    async fn sequential_requests_run_fresh_builds() {
        let (server, compiler, addr) = started().await;
        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());

        client.get_mut().write_all(b"build\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();
        compiler.finish(vec![DiagnosticMessage::new(Severity::Warning, "first")]);
        assert!(read_response(&mut client).await.contains("first"));

        client.get_mut().write_all(b"build\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(2)).await.unwrap();
        compiler.finish(vec![DiagnosticMessage::new(Severity::Warning, "second")]);
        let second = read_response(&mut client).await;
        assert!(second.contains("second"));
        assert!(!second.contains("first"));

        assert_eq!(compiler.starts(), 2);
        server.stop().await;
    }

    #[tokio::test]
    async fn concurrent_clients_share_one_build() {
        let (server, compiler, addr) = started().await;

        let mut a = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let mut b = BufReader::new(TcpStream::connect(addr).await.unwrap());
        a.get_mut().write_all(b"a\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();
        b.get_mut().write_all(b"b\n").await.unwrap();

        // Give b's request time to reach the coordinator and join the build
        tokio::time::sleep(Duration::from_millis(200)).await;

        compiler.finish(vec![DiagnosticMessage::new(Severity::Info, "shared")]);
        let ra = read_response(&mut a).await;
        let rb = read_response(&mut b).await;
        assert_eq!(ra, rb);
        assert!(ra.contains("shared"));
        assert_eq!(compiler.starts(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn disconnect_mid_build_does_not_misdeliver() {
        let (server, compiler, addr) = started().await;

        let mut gone = TcpStream::connect(addr).await.unwrap();
        gone.write_all(b"x\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();
        drop(gone);
        compiler.finish(vec![DiagnosticMessage::new(Severity::Error, "for nobody")]);

        let mut next = BufReader::new(TcpStream::connect(addr).await.unwrap());
        next.get_mut().write_all(b"x\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(2)).await.unwrap();
        compiler.finish(vec![DiagnosticMessage::new(Severity::Error, "for next")]);

        let response = read_response(&mut next).await;
        assert!(response.contains("for next"));
        assert!(!response.contains("for nobody"));
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_waiting_session_and_listener() {
        let (server, compiler, addr) = started().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();

        timeout(WAIT, server.stop()).await.unwrap();
        assert_eq!(server.state().await, ServerState::Stopped);

        // The waiting session is closed without a response
        let mut buf = Vec::new();
        let n = timeout(WAIT, client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert!(TcpStream::connect(addr).await.is_err());
        // The abandoned build's completion has no subscriber left
        assert_eq!(compiler.finish(Vec::new()), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let compiler = Arc::new(ManualCompiler::default());
        let server = BuildServer::new(ServerConfig::default(), compiler);
        server.stop().await;
        assert_eq!(server.state().await, ServerState::NotStarted);

        server.start(0).await.unwrap();
        server.stop().await;
        server.stop().await;
        assert_eq!(server.state().await, ServerState::Stopped);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let (server, _compiler, _addr) = started().await;
        assert!(matches!(
            server.start(0).await,
            Err(ServerError::AlreadyRunning(ServerState::Listening))
        ));
        assert_eq!(server.state().await, ServerState::Listening);
        server.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_keeps_server_down() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let server = BuildServer::new(
            ServerConfig::default(),
            Arc::new(ManualCompiler::default()),
        );
        assert!(matches!(
            server.start(port).await,
            Err(ServerError::Bind { .. })
        ));
        assert_eq!(server.state().await, ServerState::NotStarted);
    }

    #[tokio::test]
    async fn restart_after_stop_serves_new_builds() {
        let (server, compiler, _) = started().await;
        server.stop().await;

        let addr = server.start(0).await.unwrap();
        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        client.get_mut().write_all(b"x\n").await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();
        compiler.finish(Vec::new());
        assert_eq!(read_response(&mut client).await, "{\"messages\":[]}\n");
        server.stop().await;
    }

    #[tokio::test]
    async fn unterminated_frame_before_eof_is_a_request() {
        let (server, compiler, addr) = started().await;

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        client.get_mut().write_all(b"x").await.unwrap();
        client.get_mut().shutdown().await.unwrap();
        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();
        compiler.finish(vec![DiagnosticMessage::new(Severity::Warning, "half-closed")]);

        assert!(read_response(&mut client).await.contains("half-closed"));
        // The server closes once the half-closed peer has its answer
        assert_eq!(read_response(&mut client).await, "");
        server.stop().await;
    }

    #[tokio::test]
    async fn pipelined_frames_get_one_build_each() {
        let (server, compiler, addr) = started().await;

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        client.get_mut().write_all(b"a\nb\n").await.unwrap();

        timeout(WAIT, compiler.wait_for_starts(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The second frame waits until the first response is written
        assert_eq!(compiler.starts(), 1);
        compiler.finish(vec![DiagnosticMessage::new(Severity::Info, "one")]);
        assert!(read_response(&mut client).await.contains("one"));

        timeout(WAIT, compiler.wait_for_starts(2)).await.unwrap();
        compiler.finish(vec![DiagnosticMessage::new(Severity::Info, "two")]);
        let second = read_response(&mut client).await;
        assert!(second.contains("two"));
        assert!(!second.contains("one"));
        server.stop().await;
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection_without_a_build() {
        let (server, compiler, addr) = started().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let flood = vec![b'x'; 2 * session::MAX_FRAME_LEN];
        // The server may reset the connection before all of it is written
        let _ = timeout(WAIT, client.write_all(&flood)).await.unwrap();

        let mut buf = Vec::new();
        let n = timeout(WAIT, client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(compiler.starts(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn cancelled_stop_still_reaches_stopped() {
        let (server, _compiler, _addr) = started().await;

        // Poll stop once, then drop it
        let _ = timeout(Duration::ZERO, server.stop()).await;

        timeout(WAIT, async {
            while server.state().await != ServerState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        server.start(0).await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn accept_backoff_waits_unless_shutting_down() {
        let (_tx, mut rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        assert!(!backoff(&mut rx).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let started = tokio::time::Instant::now();
        assert!(backoff(&mut rx).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }
}
