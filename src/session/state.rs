//! Stream session state machine
//!
//! ```text
//! Init --(authenticated, queue opened)--> Active --(peer closes / error / cancel)--> Closed
//! ```

use std::time::{Duration, Instant};

/// Stream lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Authenticated, delivery queue not yet open
    Init,
    /// Delivery queue open, both loops running
    Active,
    /// Delivery queue closed
    Closed,
}

/// Why a stream left the active phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client finished sending or the connection dropped
    PeerClosed,
    /// Connection or server cancellation
    Cancelled,
    /// The delivery queue was closed or replaced from outside
    DeliveryClosed,
    /// The server's shutdown notice was written
    ServerShutdown,
    /// Inbound transport error
    Error,
}

/// Stream session state
#[derive(Debug)]
pub struct StreamState {
    /// Current phase
    pub phase: StreamPhase,

    /// When the stream became active
    pub opened_at: Option<Instant>,

    /// Why the stream closed
    pub close_reason: Option<CloseReason>,

    /// Messages received from the client
    pub messages_received: u64,

    /// Events written to the client
    pub events_sent: u64,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::Init,
            opened_at: None,
            close_reason: None,
            messages_received: 0,
            events_sent: 0,
        }
    }

    /// Enter the active phase
    pub fn activate(&mut self) {
        if self.phase == StreamPhase::Init {
            self.phase = StreamPhase::Active;
            self.opened_at = Some(Instant::now());
        }
    }

    /// Leave the active phase
    ///
    /// Returns `true` only for the call that actually performed the
    /// transition, so cleanup keyed on it runs exactly once.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.phase == StreamPhase::Active {
            self.phase = StreamPhase::Closed;
            self.close_reason = Some(reason);
            true
        } else {
            false
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == StreamPhase::Active
    }

    /// How long the stream has been (or was) active
    pub fn duration(&self) -> Option<Duration> {
        self.opened_at.map(|t| t.elapsed())
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}
