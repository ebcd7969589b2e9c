//! Connection Server
//!
//! Owns the listener, the shutdown signal and (in routing mode) the producer
//! side of the message channel. `start` hands the listener to an accept task,
//! which spawns one read task per connection and drains them on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::listener::{bind_tcp, AcceptAction, AcceptErrors, Acceptor};
use super::reader::{serve_connection, CloseReason, ConnectionContext};
use super::stats::{ConnectionGuard, ServerStats};
use super::ServerError;
use crate::config::{ServerConfig, ServerMode};
use crate::message::{self, MessageReceiver, MessageSender};
use crate::shutdown::ShutdownCoordinator;

/// A TCP server that reads raw bytes from every connection it accepts
pub struct Server {
    config: ServerConfig,
    bound: Option<BoundListener>,
    shutdown: ShutdownCoordinator,
    router: Option<MessageSender>,
    stats: Arc<ServerStats>,
}

struct BoundListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl BoundListener {
    async fn open(bind_addr: &str) -> Result<Self, ServerError> {
        let listener = bind_tcp(bind_addr).await?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;
        Ok(Self { listener, addr })
    }
}

impl Server {
    /// Create a server that logs every read and replies with nothing
    pub fn new(config: ServerConfig, shutdown: ShutdownCoordinator) -> Self {
        Self {
            config,
            bound: None,
            shutdown,
            router: None,
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Create a server that routes every read to the returned receiver and
    /// acknowledges it to the peer
    pub fn with_router(
        config: ServerConfig,
        shutdown: ShutdownCoordinator,
    ) -> (Self, MessageReceiver) {
        let (tx, rx) = message::channel();
        let mut server = Self::new(config, shutdown);
        server.router = Some(tx);
        (server, rx)
    }

    /// Create whichever variant `config.mode` asks for
    pub fn from_config(
        config: ServerConfig,
        shutdown: ShutdownCoordinator,
    ) -> (Self, Option<MessageReceiver>) {
        match config.mode {
            ServerMode::Route => {
                let (server, rx) = Self::with_router(config, shutdown);
                (server, Some(rx))
            }
            ServerMode::LogOnly => (Self::new(config, shutdown), None),
        }
    }

    /// Bind the listen address unless already bound, and return the local address
    pub async fn bind(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(bound) = &self.bound {
            return Ok(bound.addr);
        }

        let bound = BoundListener::open(&self.config.bind_addr).await?;
        let addr = bound.addr;
        self.bound = Some(bound);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.as_ref().map(|bound| bound.addr)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Bind, accept connections until shutdown, then drain and close.
    ///
    /// Returns early with [`ServerError::Bind`] before any task is spawned if
    /// the address cannot be bound.
    pub async fn start(mut self) -> Result<(), ServerError> {
        // `start` consumes the server, so this is the only place the listener
        // leaves `bound`: either an earlier `bind` opened it or it opens now.
        let bound = match self.bound.take() {
            Some(bound) => bound,
            None => BoundListener::open(&self.config.bind_addr).await?,
        };
        self.serve(bound.listener, bound.addr).await
    }

    async fn serve<A>(mut self, acceptor: A, addr: SocketAddr) -> Result<(), ServerError>
    where
        A: Acceptor + 'static,
    {
        let mut shutdown_rx = self.shutdown.subscribe();
        info!(mode = %self.config.mode, "server running on {}", addr);

        let accept = AcceptLoop {
            acceptor,
            ctx: Arc::new(ConnectionContext {
                buffer_size: self.config.buffer_size,
                router: self.router.clone(),
                stats: Arc::clone(&self.stats),
            }),
            shutdown: self.shutdown.clone(),
            backoff: self.config.accept_backoff,
            errors: AcceptErrors::new(self.config.max_accept_errors),
        };
        let mut accept_task = tokio::spawn(accept.run());

        let finished = tokio::select! {
            _ = shutdown_rx.recv() => None,
            joined = &mut accept_task => Some(joined),
        };
        let joined = match finished {
            Some(joined) => joined,
            None => {
                info!("Shutdown signal received, stopping server");
                accept_task.await
            }
        };

        // Every read task has been joined by now, so this drops the last sender.
        if let Some(router) = self.router.take() {
            router.close();
            info!("Message channel closed");
        }

        joined??;
        info!("Server stopped");
        Ok(())
    }
}

struct AcceptLoop<A> {
    acceptor: A,
    ctx: Arc<ConnectionContext>,
    shutdown: ShutdownCoordinator,
    backoff: Duration,
    errors: AcceptErrors,
}

impl<A: Acceptor> AcceptLoop<A> {
    async fn run(self) -> Result<(), ServerError> {
        let AcceptLoop {
            acceptor,
            ctx,
            shutdown,
            backoff,
            mut errors,
        } = self;

        info!("Starting connection acceptance loop");
        let mut shutdown_rx = shutdown.subscribe();
        let mut connections = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Stopping connection acceptance");
                    break Ok(());
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Read task failed: {}", e);
                    }
                }
                accepted = acceptor.accept() => match accepted {
                    Ok((stream, peer)) => {
                        errors.reset();

                        if shutdown.is_triggered() {
                            debug!(peer = %peer, "Rejecting connection due to shutdown");
                            continue;
                        }

                        let guard = ConnectionGuard::open(Arc::clone(&ctx.stats));
                        let ctx = Arc::clone(&ctx);
                        let mut conn_shutdown = shutdown.subscribe();

                        connections.spawn(async move {
                            let _guard = guard;
                            info!(peer = %peer, "Accepted connection");

                            let reason =
                                serve_connection(stream, peer, &ctx, &mut conn_shutdown).await;
                            match reason {
                                CloseReason::ReadFailed(_) | CloseReason::WriteFailed(_) => {
                                    warn!(peer = %peer, "Connection closed: {}", reason);
                                }
                                _ => info!(peer = %peer, "Connection closed: {}", reason),
                            }
                        });
                    }
                    Err(e) => {
                        ctx.stats.record_accept_error();

                        match errors.record(&e) {
                            AcceptAction::Continue => {
                                warn!("accept error: {}", e);
                            }
                            AcceptAction::GiveUp => {
                                let consecutive = errors.consecutive();
                                error!(
                                    "accept error: {} ({} in a row), stopping server",
                                    e, consecutive
                                );
                                shutdown.trigger();
                                break Err(ServerError::Accept {
                                    consecutive,
                                    source: e,
                                });
                            }
                            AcceptAction::Backoff => {
                                error!("accept error: {}, retrying in {:?}", e, backoff);
                                tokio::select! {
                                    _ = shutdown_rx.recv() => break Ok(()),
                                    _ = sleep(backoff) => {}
                                }
                            }
                        }
                    }
                },
            }
        };

        drop(acceptor);
        drain(connections, shutdown.timeout()).await;
        info!("Connection acceptance loop stopped");
        outcome
    }
}

/// Give read tasks `grace` to observe the shutdown, then abort the rest.
async fn drain(mut connections: JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }

    info!(active = connections.len(), "Waiting for read tasks to finish");
    let finished = timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(
            remaining = connections.len(),
            "Shutdown timeout reached after {:?}, aborting remaining read tasks", grace
        );
        connections.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use tokio::net::TcpStream;

    /// Fails every accept the way a closed listener does, except where the
    /// script says to take a real connection from `inner`.
    struct ScriptedListener {
        inner: TcpListener,
        script: Mutex<VecDeque<bool>>,
    }

    impl ScriptedListener {
        async fn new(script: &[bool]) -> Self {
            Self {
                inner: TcpListener::bind("127.0.0.1:0").await.unwrap(),
                script: Mutex::new(script.iter().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl Acceptor for ScriptedListener {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            let take_real = self.script.lock().unwrap().pop_front().unwrap_or(false);
            if take_real {
                self.inner.accept().await
            } else {
                Err(io::Error::new(io::ErrorKind::InvalidInput, "listener closed"))
            }
        }
    }

    fn failing_config(max_accept_errors: u32) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            accept_backoff: Duration::from_millis(1),
            shutdown_timeout: Duration::from_secs(1),
            max_accept_errors,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_broken_listener_stops_server() {
        let shutdown = ShutdownCoordinator::new(Duration::from_secs(1));
        let (server, mut rx) = Server::with_router(failing_config(3), shutdown.clone());
        let stats = server.stats();

        let acceptor = ScriptedListener::new(&[]).await;
        let addr = acceptor.inner.local_addr().unwrap();

        let result = timeout(Duration::from_secs(2), server.serve(acceptor, addr))
            .await
            .expect("accept loop must give up");

        assert!(matches!(result, Err(ServerError::Accept { consecutive: 3, .. })));
        assert!(shutdown.is_triggered());
        assert_eq!(stats.snapshot().accept_errors, 3);
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_successful_accept_resets_error_count() {
        let shutdown = ShutdownCoordinator::new(Duration::from_secs(1));
        let (server, _rx) = Server::with_router(failing_config(3), shutdown.clone());
        let stats = server.stats();

        // Two failures, one real connection, then failures until give-up.
        let acceptor = ScriptedListener::new(&[false, false, true]).await;
        let addr = acceptor.inner.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();

        let result = timeout(Duration::from_secs(2), server.serve(acceptor, addr))
            .await
            .expect("accept loop must give up");

        assert!(matches!(result, Err(ServerError::Accept { consecutive: 3, .. })));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.accept_errors, 5);
        assert_eq!(snapshot.active, 0);
    }
}
