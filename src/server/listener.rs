//! Chat server listener
//!
//! Handles the TCP accept loop, spawns connection handlers, and runs the
//! shutdown sequence.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bus::{Dispatcher, EventBus};
use crate::error::{Error, Result, Status};
use crate::protocol::{Frame, FrameCodec};
use crate::registry::SessionRegistry;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::service::ChatService;
use crate::stats::{ServerCounters, ServerStats};

/// Chat server
pub struct ChatServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    service: ChatService,
    dispatcher: Mutex<Option<Dispatcher>>,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    counters: Arc<ServerCounters>,
    connections: TaskTracker,
    cancel: CancellationToken,
}

impl ChatServer {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        let registry = Arc::new(SessionRegistry::with_config(config.registry.clone()));
        let (bus, dispatcher) = EventBus::new(config.event_bus_capacity);
        let service = ChatService::new(Arc::clone(&registry), bus, config.write_timeout)
            .max_frame_size(config.max_frame_size)
            .drain_timeout(drain_timeout(&config));

        Self {
            config,
            registry,
            service,
            dispatcher: Mutex::new(Some(dispatcher)),
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
            counters: Arc::new(ServerCounters::new()),
            connections: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the request handlers
    pub fn service(&self) -> &ChatService {
        &self.service
    }

    /// Connection and stream counters
    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        self.serve_until(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown`
    /// resolves
    ///
    /// On shutdown every open stream is sent a final shutdown notice, then
    /// connections are cancelled and given `shutdown_grace` to finish.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let dispatcher = self
            .dispatcher
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(Error::AlreadyStarted)?;

        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Chat server listening");

        let dispatcher = dispatcher.spawn(Arc::clone(&self.registry));

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
            }
            _ = self.accept_loop(&listener) => {}
        }

        self.shutdown(listener, dispatcher).await;
        Ok(())
    }

    async fn accept_loop(&self, listener: &TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    self.counters.connection_rejected();
                    self.connections
                        .spawn(reject(socket, self.config.write_timeout));
                    return;
                }
            }
        } else {
            None
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            connection_id = connection_id,
            peer = %peer_addr,
            "New connection"
        );

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let connection = Connection::new(
            connection_id,
            socket,
            Some(peer_addr),
            &self.config,
            self.service.clone(),
            Arc::clone(&self.counters),
        );
        let counters = Arc::clone(&self.counters);
        let cancel = self.cancel.child_token();
        let drain = drain_timeout(&self.config);

        counters.connection_opened();
        self.connections.spawn(async move {
            let _permit = permit;

            if let Err(e) = serve_connection(connection, cancel, drain).await {
                tracing::debug!(
                    connection_id = connection_id,
                    error = %e,
                    "Connection error"
                );
            }

            counters.connection_closed();
            tracing::debug!(connection_id = connection_id, "Connection closed");
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }

    async fn shutdown(&self, listener: TcpListener, dispatcher: tokio::task::JoinHandle<()>) {
        let grace = self.config.shutdown_grace;

        if self.service.announce_shutdown(grace).await {
            tracing::debug!("Shutdown notice delivered to open streams");
        }

        drop(listener);
        self.cancel.cancel();
        self.connections.close();

        if tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.connections.len(),
                "Connections still open after grace period"
            );
        }

        self.service.bus().close();
        if let Err(e) = dispatcher.await {
            tracing::warn!(error = %e, "Event dispatcher failed");
        }

        let stats = self.registry.stats().await;
        tracing::info!(
            sessions = stats.sessions,
            events_published = stats.events_published,
            events_dropped = stats.events_dropped,
            "Chat server stopped"
        );
    }
}

/// Time a connection may keep working after cancellation
///
/// Half the shutdown grace, so cancelled connections finish well before the
/// listener stops waiting for them.
fn drain_timeout(config: &ServerConfig) -> Duration {
    config.shutdown_grace / 2
}

/// Run a connection, dropping it if it is still busy `drain` after `cancel`
/// fires
async fn serve_connection<T>(
    connection: Connection<T>,
    cancel: CancellationToken,
    drain: Duration,
) -> Result<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let expired = async {
        cancel.cancelled().await;
        tokio::time::sleep(drain).await;
    };

    tokio::select! {
        result = connection.run(&cancel) => result,
        _ = expired => Err(Error::Timeout),
    }
}

/// Tell a client over the connection limit to go away
async fn reject(socket: TcpStream, write_timeout: Duration) {
    let mut framed = Framed::new(socket, FrameCodec::new());
    let status = Status::unavailable("connection limit reached");
    let _ = tokio::time::timeout(write_timeout, framed.send(Frame::Status(status))).await;
}
