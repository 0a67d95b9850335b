//! Chat request handlers
//!
//! `ChatService` validates requests, updates the session registry, and
//! publishes presence and message events on the bus. It knows nothing about
//! sockets: connections hand it decoded requests and transport halves.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, Stream};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::error::{Error, Result, Status};
use crate::protocol::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::protocol::{max_message_len, max_name_len, Event, Metadata};
use crate::registry::{RegistryError, SessionRegistry, Token};
use crate::session::{SessionContext, StreamSession, StreamSummary};

/// Request-handling surface of the chat server
#[derive(Clone)]
pub struct ChatService {
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    write_timeout: Duration,
    drain_timeout: Duration,
    max_frame_size: usize,
}

impl ChatService {
    pub fn new(registry: Arc<SessionRegistry>, bus: EventBus, write_timeout: Duration) -> Self {
        Self {
            registry,
            bus,
            write_timeout,
            drain_timeout: write_timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Largest frame a client connection accepts; names and messages are
    /// limited so their events fit in one
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// How long a cancelled stream may keep flushing queued events
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Log a client in and return its new token
    ///
    /// Announces the name only when this is its first active session.
    pub async fn login(&self, name: &str) -> std::result::Result<Token, Status> {
        if name.is_empty() {
            return Err(Status::invalid_argument("name is required"));
        }
        let limit = max_name_len(self.max_frame_size);
        if name.len() > limit {
            return Err(Status::invalid_argument(format!(
                "name exceeds {} bytes",
                limit
            )));
        }

        let token = Token::generate(name);
        let first = self
            .registry
            .register(name, token.clone())
            .await
            .map_err(|e| match e {
                RegistryError::DuplicateToken(_) => Status::internal("failed to allocate token"),
            })?;

        tracing::debug!(name = name, first_session = first, "Client logged in");

        if first {
            self.emit(Event::joined(name)).await;
        }

        Ok(token)
    }

    /// Log a session out
    ///
    /// Announces the name as gone only when this was its last active session.
    pub async fn logout(&self, token: &str) -> std::result::Result<(), Status> {
        if token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }

        let (name, last) = self
            .registry
            .unregister(token)
            .await
            .ok_or_else(|| Status::not_found("Token not found"))?;

        tracing::debug!(name = %name, last_session = last, "Client logged out");

        if last {
            self.emit(Event::left(name)).await;
        }

        Ok(())
    }

    /// Resolve the bearer token carried in stream metadata
    pub async fn authenticate(
        &self,
        metadata: &Metadata,
    ) -> std::result::Result<SessionContext, Status> {
        let token = match metadata.token() {
            Some(token) if !token.is_empty() => token,
            _ => return Err(Status::unauthenticated("Missing token header")),
        };

        let name = self
            .registry
            .resolve(token)
            .await
            .ok_or_else(|| Status::unauthenticated("Invalid token"))?;

        Ok(SessionContext::new(Token::new(token), name))
    }

    /// Create the stream session for an authenticated context
    pub fn open_stream(&self, context: SessionContext) -> StreamSession {
        let max_message_len = max_message_len(self.max_frame_size, &context.name);
        StreamSession::new(
            context,
            Arc::clone(&self.registry),
            self.bus.clone(),
            self.write_timeout,
        )
        .drain_timeout(self.drain_timeout)
        .max_message_len(max_message_len)
    }

    /// Authenticate and run a stream to completion
    pub async fn stream<S, K>(
        &self,
        metadata: &Metadata,
        source: S,
        sink: K,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary>
    where
        S: Stream<Item = Result<String>> + Unpin + Send,
        K: Sink<Event, Error = Error> + Unpin + Send + 'static,
    {
        let context = self.authenticate(metadata).await?;
        self.open_stream(context).run(source, sink, cancel).await
    }

    /// Publish the shutdown notice and wait, up to `grace`, for it to reach
    /// every open delivery queue
    ///
    /// Returns `false` if the notice could not be confirmed in time.
    pub async fn announce_shutdown(&self, grace: Duration) -> bool {
        let announce = async {
            self.bus.publish(Event::shutting_down()).await?;
            self.bus.flush().await
        };

        match tokio::time::timeout(grace, announce).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to announce shutdown");
                false
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Shutdown notice not propagated within grace period"
                );
                false
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.bus.publish(event).await {
            tracing::debug!(error = %e, "Event not published");
        }
    }
}
