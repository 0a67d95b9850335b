//! Stream session
//!
//! Pairs an authenticated token with its private delivery queue and runs the
//! two loops of an open stream:
//!
//! - inbound: client messages -> `Message` events on the bus
//! - outbound: delivery queue -> client, in arrival order
//!
//! The loops share a cancellation token; whichever ends first cancels the
//! other. The delivery queue is closed exactly once when the session leaves
//! the active phase, including when the session future is dropped.
//!
//! The shutdown notice is the last event a stream writes. After cancellation
//! the outbound loop gets `drain_timeout` to flush what is already queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::context::SessionContext;
use super::state::{CloseReason, StreamPhase, StreamState};
use crate::bus::EventBus;
use crate::error::{Error, Result, Status};
use crate::protocol::constants::MAX_STRING_LEN;
use crate::protocol::Event;
use crate::registry::{DeliveryQueue, SessionRegistry};

/// Summary of a finished stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub reason: CloseReason,
    pub messages_received: u64,
    pub events_sent: u64,
}

/// How the outbound loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundEnd {
    Cancelled,
    QueueClosed,
    PeerGone,
    ShutdownSent,
    /// Still writing when the drain deadline passed
    Expired,
}

/// Outcome of a single event write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Write {
    Sent,
    /// The event could not be encoded; the transport is untouched
    Skipped,
    PeerGone,
    Expired,
}

/// Per-connection stream state
pub struct StreamSession {
    context: SessionContext,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    state: StreamState,
    queue: Option<DeliveryQueue>,
    generation: Option<u64>,
    write_timeout: Duration,
    drain_timeout: Duration,
    max_message_len: usize,
}

impl StreamSession {
    /// Create a session for an authenticated token
    pub fn new(
        context: SessionContext,
        registry: Arc<SessionRegistry>,
        bus: EventBus,
        write_timeout: Duration,
    ) -> Self {
        Self {
            context,
            registry,
            bus,
            state: StreamState::new(),
            queue: None,
            generation: None,
            write_timeout,
            drain_timeout: write_timeout,
            max_message_len: MAX_STRING_LEN,
        }
    }

    /// Time the outbound loop gets after cancellation before it gives up
    /// on the peer
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Longest message text accepted from the client
    pub fn max_message_len(mut self, len: usize) -> Self {
        self.max_message_len = len;
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.phase
    }

    /// Subscribe to broadcasts without starting the loops
    ///
    /// Events published after this returns are queued for the stream. `run`
    /// subscribes on its own if this was not called.
    pub async fn open(&mut self) {
        if self.state.phase == StreamPhase::Init {
            let queue = self.subscribe().await;
            self.queue = Some(queue);
        }
    }

    async fn subscribe(&mut self) -> DeliveryQueue {
        let queue = self.registry.open_delivery(&self.context.token).await;
        self.generation = Some(queue.generation());
        self.state.activate();

        tracing::debug!(
            connection_id = self.context.connection_id,
            name = %self.context.name,
            generation = queue.generation(),
            "Stream opened"
        );
        queue
    }

    /// Run the stream until the peer closes, an error occurs, or `cancel`
    /// fires
    ///
    /// Transport disconnects are a normal end. Any other inbound error is
    /// returned after cleanup.
    pub async fn run<S, K>(
        mut self,
        source: S,
        sink: K,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary>
    where
        S: Stream<Item = Result<String>> + Unpin + Send,
        K: Sink<Event, Error = Error> + Unpin + Send + 'static,
    {
        let queue = match self.queue.take() {
            Some(queue) => queue,
            None => self.subscribe().await,
        };

        let session_cancel = cancel.child_token();
        // Stops the outbound task if this future is dropped mid-stream
        let _cancel_on_drop = session_cancel.clone().drop_guard();

        let outbound = tokio::spawn(outbound_loop(
            queue,
            sink,
            session_cancel.clone(),
            self.write_timeout,
            self.drain_timeout,
            self.context.connection_id,
        ));

        let inbound = self.inbound_loop(source, &session_cancel).await;
        session_cancel.cancel();

        let (outbound_end, events_sent) = match outbound.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    connection_id = self.context.connection_id,
                    error = %e,
                    "Outbound loop failed"
                );
                (OutboundEnd::PeerGone, 0)
            }
        };
        self.state.events_sent = events_sent;

        let reason = match (&inbound, outbound_end) {
            (Err(_), _) => CloseReason::Error,
            (Ok(CloseReason::Cancelled), OutboundEnd::QueueClosed) => CloseReason::DeliveryClosed,
            (Ok(CloseReason::Cancelled), OutboundEnd::PeerGone) => CloseReason::PeerClosed,
            (Ok(CloseReason::Cancelled), OutboundEnd::ShutdownSent) => CloseReason::ServerShutdown,
            (Ok(reason), _) => *reason,
        };
        self.close(reason).await;

        let summary = StreamSummary {
            reason,
            messages_received: self.state.messages_received,
            events_sent,
        };

        tracing::debug!(
            connection_id = self.context.connection_id,
            name = %self.context.name,
            reason = ?reason,
            messages = summary.messages_received,
            events = summary.events_sent,
            "Stream closed"
        );

        inbound.map(|_| summary)
    }

    /// Read client messages and publish them until the peer closes or the
    /// session is cancelled
    async fn inbound_loop<S>(
        &mut self,
        mut source: S,
        cancel: &CancellationToken,
    ) -> Result<CloseReason>
    where
        S: Stream<Item = Result<String>> + Unpin + Send,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(CloseReason::Cancelled),
                next = source.next() => next,
            };

            let text = match next {
                None => return Ok(CloseReason::PeerClosed),
                Some(Ok(text)) => text,
                Some(Err(e)) if e.is_disconnect() => {
                    tracing::debug!(
                        connection_id = self.context.connection_id,
                        error = %e,
                        "Client terminated connection"
                    );
                    return Ok(CloseReason::PeerClosed);
                }
                Some(Err(e)) => return Err(e),
            };

            self.state.messages_received += 1;

            // Anything longer would not fit in the broadcast event frame
            if text.len() > self.max_message_len {
                tracing::debug!(
                    connection_id = self.context.connection_id,
                    name = %self.context.name,
                    len = text.len(),
                    limit = self.max_message_len,
                    "Message too long"
                );
                return Err(Status::invalid_argument(format!(
                    "message exceeds {} bytes",
                    self.max_message_len
                ))
                .into());
            }

            tracing::debug!(
                connection_id = self.context.connection_id,
                name = %self.context.name,
                message = %text,
                "Client sent a message"
            );

            let event = Event::message(self.context.name.clone(), text);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(CloseReason::Cancelled),
                result = self.bus.publish(event) => {
                    if result.is_err() {
                        tracing::debug!(
                            connection_id = self.context.connection_id,
                            "Event bus closed, message not published"
                        );
                    }
                }
            }
        }
    }

    /// Leave the active phase and release the delivery queue
    async fn close(&mut self, reason: CloseReason) {
        if !self.state.close(reason) {
            return;
        }

        if let Some(generation) = self.generation {
            self.registry
                .close_delivery_generation(self.context.token.as_str(), generation)
                .await;
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.state.close(CloseReason::Cancelled) {
            return;
        }

        // Dropped while active: release the queue from a detached task
        let Some(generation) = self.generation else {
            return;
        };
        let registry = Arc::clone(&self.registry);
        let token = self.context.token.clone();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry
                    .close_delivery_generation(token.as_str(), generation)
                    .await;
            });
        }
    }
}

/// Write queued events to the client until cancelled, the queue closes, or
/// the peer goes away
///
/// Nothing is written after the shutdown notice. On cancellation, events
/// already queued at that moment are still written, but the drain and the
/// final close must finish within `drain_timeout`. Every write is also
/// bounded by `write_timeout`.
async fn outbound_loop<K>(
    mut queue: DeliveryQueue,
    mut sink: K,
    cancel: CancellationToken,
    write_timeout: Duration,
    drain_timeout: Duration,
    connection_id: u64,
) -> (OutboundEnd, u64)
where
    K: Sink<Event, Error = Error> + Unpin + Send + 'static,
{
    // Whatever ends this loop also ends the inbound loop
    let _cancel_inbound = cancel.clone().drop_guard();

    // Resolves `drain_timeout` after cancellation; must not be polled again
    // once it has fired
    let deadline = {
        let cancel = cancel.clone();
        async move {
            cancel.cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        }
    };
    tokio::pin!(deadline);

    let mut sent = 0u64;

    let mut end = loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break OutboundEnd::Cancelled,
            event = queue.recv() => match event {
                Some(event) => event,
                None => break OutboundEnd::QueueClosed,
            },
        };

        let shutdown = event.is_shutdown();
        match write_event(&mut sink, event, write_timeout, deadline.as_mut(), connection_id).await
        {
            Write::Sent if shutdown => {
                sent += 1;
                break OutboundEnd::ShutdownSent;
            }
            Write::Sent => sent += 1,
            Write::Skipped => {}
            Write::PeerGone => break OutboundEnd::PeerGone,
            Write::Expired => break OutboundEnd::Expired,
        }
    };

    if end == OutboundEnd::Cancelled {
        let pending = queue.len();
        for _ in 0..pending {
            let Some(event) = queue.try_recv() else {
                break;
            };

            let shutdown = event.is_shutdown();
            match write_event(&mut sink, event, write_timeout, deadline.as_mut(), connection_id)
                .await
            {
                Write::Sent => {
                    sent += 1;
                    if shutdown {
                        break;
                    }
                }
                Write::Skipped => {}
                Write::PeerGone => {
                    end = OutboundEnd::PeerGone;
                    break;
                }
                Write::Expired => {
                    end = OutboundEnd::Expired;
                    break;
                }
            }
        }
    }

    match end {
        OutboundEnd::PeerGone => {}
        OutboundEnd::Expired => {
            tracing::debug!(
                connection_id = connection_id,
                drain_ms = drain_timeout.as_millis() as u64,
                "Gave up flushing events after cancellation"
            );
        }
        _ => {
            tokio::select! {
                biased;
                _ = &mut deadline => {}
                _ = tokio::time::timeout(write_timeout, sink.close()) => {}
            }
        }
    }

    (end, sent)
}

/// Write one event, bounded by `write_timeout` and the drain deadline
async fn write_event<K, D>(
    sink: &mut K,
    event: Event,
    write_timeout: Duration,
    deadline: Pin<&mut D>,
    connection_id: u64,
) -> Write
where
    K: Sink<Event, Error = Error> + Unpin,
    D: Future<Output = ()>,
{
    let result = tokio::select! {
        biased;
        _ = deadline => return Write::Expired,
        result = tokio::time::timeout(write_timeout, sink.send(event)) => result,
    };

    match result {
        Ok(Ok(())) => Write::Sent,
        Ok(Err(Error::Protocol(e))) => {
            tracing::warn!(
                connection_id = connection_id,
                error = %e,
                "Dropping event that cannot be encoded"
            );
            Write::Skipped
        }
        Ok(Err(e)) if e.is_disconnect() => {
            tracing::debug!(connection_id = connection_id, "Client terminated connection");
            Write::PeerGone
        }
        Ok(Err(e)) => {
            tracing::debug!(
                connection_id = connection_id,
                error = %e,
                "Failed to send to client"
            );
            Write::PeerGone
        }
        Err(_) => {
            tracing::debug!(connection_id = connection_id, "Write to client timed out");
            Write::PeerGone
        }
    }
}
