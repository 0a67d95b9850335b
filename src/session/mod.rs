//! Stream session management
//!
//! A stream is the long-lived call on which a logged-in client sends chat
//! messages and receives broadcast events.

pub mod context;
pub mod state;
pub mod stream;

pub use context::SessionContext;
pub use state::{CloseReason, StreamPhase, StreamState};
pub use stream::{StreamSession, StreamSummary};
