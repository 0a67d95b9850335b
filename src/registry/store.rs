//! Session registry implementation
//!
//! The single source of truth for who is connected. Three maps are kept, each
//! behind its own `RwLock`:
//!
//! - token -> name (login sessions)
//! - name -> set of tokens (presence)
//! - token -> delivery queue sender (open streams)
//!
//! No method ever holds more than one of these locks at a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use super::config::RegistryConfig;
use super::delivery::DeliveryQueue;
use super::error::RegistryError;
use super::token::Token;
use crate::protocol::Event;
use crate::stats::RegistryStats;

/// Sending half of an open delivery queue
struct Delivery {
    generation: u64,
    tx: mpsc::Sender<Event>,
}

/// Result of fanning one event out to every open delivery queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Queues that accepted the event
    pub delivered: usize,
    /// Queues that were full and dropped the event
    pub dropped: usize,
}

/// Thread-safe registry of login sessions and open delivery queues
pub struct SessionRegistry {
    /// Token to client name
    tokens: RwLock<HashMap<Token, String>>,

    /// Client name to its active tokens
    names: RwLock<HashMap<String, HashSet<Token>>>,

    /// Token to the delivery queue of its open stream
    deliveries: RwLock<HashMap<Token, Delivery>>,

    /// Next delivery queue generation
    next_generation: AtomicU64,

    /// Events fanned out by `publish`
    events_published: AtomicU64,

    /// Per-recipient drops caused by full delivery queues
    events_dropped: AtomicU64,

    /// Configuration
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a new registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            deliveries: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a login session
    ///
    /// Returns `true` if this is the name's first active session, i.e. the
    /// name just came online and a joined event should be announced.
    pub async fn register(&self, name: &str, token: Token) -> Result<bool, RegistryError> {
        {
            let mut tokens = self.tokens.write().await;
            if tokens.contains_key(&token) {
                return Err(RegistryError::DuplicateToken(token));
            }
            tokens.insert(token.clone(), name.to_string());
        }

        let mut names = self.names.write().await;
        let sessions = names.entry(name.to_string()).or_default();
        let first = sessions.is_empty();
        sessions.insert(token);

        tracing::debug!(
            name = name,
            sessions = sessions.len(),
            first_session = first,
            "Session registered"
        );

        Ok(first)
    }

    /// Unregister a login session
    ///
    /// Returns the session's name and whether it was the name's last active
    /// session, or `None` (without touching any state) if the token is
    /// unknown.
    pub async fn unregister(&self, token: &str) -> Option<(String, bool)> {
        let name = self.tokens.write().await.remove(token)?;

        let mut names = self.names.write().await;
        let last = match names.get_mut(&name) {
            Some(sessions) => {
                let removed = sessions.remove(token);
                let empty = sessions.is_empty();
                if empty {
                    names.remove(&name);
                }
                removed && empty
            }
            None => false,
        };

        tracing::debug!(name = %name, last_session = last, "Session unregistered");

        Some((name, last))
    }

    /// Look up the name a token belongs to
    pub async fn resolve(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }

    /// Check if a name has at least one active session
    pub async fn is_online(&self, name: &str) -> bool {
        self.names
            .read()
            .await
            .get(name)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    /// Number of active sessions under a name
    pub async fn session_count(&self, name: &str) -> usize {
        self.names.read().await.get(name).map_or(0, HashSet::len)
    }

    /// Open a delivery queue for a token
    ///
    /// Replaces any queue previously open for the token; the replaced queue
    /// is closed and its receiver drains then sees end of stream.
    pub async fn open_delivery(&self, token: &Token) -> DeliveryQueue {
        let (tx, rx) = mpsc::channel(self.config.delivery_capacity);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let replaced = self
            .deliveries
            .write()
            .await
            .insert(token.clone(), Delivery { generation, tx });

        if let Some(old) = replaced {
            tracing::debug!(
                old_generation = old.generation,
                generation = generation,
                "Replaced stale delivery queue"
            );
        }

        DeliveryQueue::new(token.clone(), generation, rx)
    }

    /// Close the delivery queue for a token, whichever stream opened it
    ///
    /// No-op if no queue is open.
    pub async fn close_delivery(&self, token: &str) {
        if self.deliveries.write().await.remove(token).is_some() {
            tracing::debug!("Delivery queue closed");
        }
    }

    /// Close the delivery queue for a token only if it is still the queue
    /// identified by `generation`
    ///
    /// Returns `true` if a queue was removed. A stream tearing down after a
    /// newer stream replaced its queue leaves the newer queue alone.
    pub async fn close_delivery_generation(&self, token: &str, generation: u64) -> bool {
        let mut deliveries = self.deliveries.write().await;
        match deliveries.get(token) {
            Some(delivery) if delivery.generation == generation => {
                deliveries.remove(token);
                tracing::debug!(generation = generation, "Delivery queue closed");
                true
            }
            _ => false,
        }
    }

    /// Fan an event out to every open delivery queue
    ///
    /// Never waits: a full queue drops the event for that recipient only.
    pub async fn publish(&self, event: &Event) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        {
            let deliveries = self.deliveries.read().await;
            for delivery in deliveries.values() {
                match delivery.tx.try_send(event.clone()) {
                    Ok(()) => outcome.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        outcome.dropped += 1;
                        tracing::debug!(
                            generation = delivery.generation,
                            "Delivery queue full, dropping event"
                        );
                    }
                    // Receiver already gone; its stream is tearing down
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        self.events_published.fetch_add(1, Ordering::Relaxed);
        if outcome.dropped > 0 {
            self.events_dropped
                .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        }

        outcome
    }

    /// Number of open delivery queues
    pub async fn delivery_count(&self) -> usize {
        self.deliveries.read().await.len()
    }

    /// Snapshot of registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.tokens.read().await.len();
        let online_names = self.names.read().await.len();
        let open_deliveries = self.deliveries.read().await.len();

        RegistryStats {
            sessions,
            online_names,
            open_deliveries,
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
