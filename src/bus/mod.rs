//! Event bus
//!
//! A single bounded queue fed by every request handler and drained by one
//! dispatcher task, which hands each event to `SessionRegistry::publish`.
//!
//! ```text
//!   login ──┐
//!   logout ─┼──► [ bounded mpsc ] ──► Dispatcher ──► registry.publish()
//!   message ┘     (blocks when full)
//! ```
//!
//! Events reach the fan-out step in the order they were enqueued. Producers
//! wait when the shared queue is full; only the per-recipient fan-out drops.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::Event;
use crate::registry::SessionRegistry;

enum Envelope {
    Event(Event),
    /// Answered once everything queued before it has been fanned out
    Flush(oneshot::Sender<()>),
}

/// Producer handle for the shared event queue
///
/// Cheap to clone; every clone feeds the same dispatcher.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Envelope>,
    closed: CancellationToken,
}

impl EventBus {
    /// Create a bus with the given queue capacity
    ///
    /// The returned dispatcher must be run (usually via `Dispatcher::spawn`)
    /// for events to go anywhere.
    pub fn new(capacity: usize) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();

        let bus = Self {
            tx,
            closed: closed.clone(),
        };
        let dispatcher = Dispatcher { rx, closed };

        (bus, dispatcher)
    }

    /// Enqueue an event
    ///
    /// Waits while the queue is full. Fails only once the bus is closed.
    pub async fn publish(&self, event: Event) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::BusClosed);
        }

        self.tx
            .send(Envelope::Event(event))
            .await
            .map_err(|_| Error::BusClosed)
    }

    /// Wait until every event enqueued before this call has been fanned out
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Envelope::Flush(done_tx))
            .await
            .map_err(|_| Error::BusClosed)?;
        done_rx.await.map_err(|_| Error::BusClosed)
    }

    /// Stop accepting events
    ///
    /// The dispatcher fans out whatever is already queued, then exits.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Consumer side of the event bus
pub struct Dispatcher {
    rx: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
}

impl Dispatcher {
    /// Run the dispatch loop until the bus is closed or every producer is gone
    pub async fn run(mut self, registry: Arc<SessionRegistry>) {
        tracing::debug!("Event dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                envelope = self.rx.recv() => match envelope {
                    Some(envelope) => dispatch(&registry, envelope).await,
                    None => break,
                },
            }
        }

        // Refuse new events, then drain what made it in before the close
        self.rx.close();
        let mut drained = 0usize;
        while let Some(envelope) = self.rx.recv().await {
            dispatch(&registry, envelope).await;
            drained += 1;
        }

        tracing::debug!(drained = drained, "Event dispatcher stopped");
    }

    /// Spawn the dispatch loop onto the runtime
    pub fn spawn(self, registry: Arc<SessionRegistry>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(registry))
    }
}

async fn dispatch(registry: &SessionRegistry, envelope: Envelope) {
    match envelope {
        Envelope::Event(event) => {
            let outcome = registry.publish(&event).await;
            tracing::trace!(
                delivered = outcome.delivered,
                dropped = outcome.dropped,
                "Event dispatched"
            );
        }
        Envelope::Flush(done) => {
            let _ = done.send(());
        }
    }
}
