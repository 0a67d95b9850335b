//! Per-connection delivery queues
//!
//! The registry keeps the sending half of each queue and fans events into it
//! with `try_send`, so a full queue drops the event for that recipient only.
//! The receiving half is owned by the stream session for the token.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::protocol::Event;

use super::token::Token;

/// Receiving half of a delivery queue
#[derive(Debug)]
pub struct DeliveryQueue {
    token: Token,
    generation: u64,
    rx: mpsc::Receiver<Event>,
}

impl DeliveryQueue {
    pub(super) fn new(token: Token, generation: u64, rx: mpsc::Receiver<Event>) -> Self {
        Self {
            token,
            generation,
            rx,
        }
    }

    /// Token this queue delivers to
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Identifies this queue among all queues ever opened for the token
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the queue has been closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an already-queued event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Number of events waiting in the queue
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
