//! Session registry
//!
//! Tracks login sessions and the delivery queues of open streams, and fans
//! events out to every open queue.
//!
//! # Architecture
//!
//! ```text
//!                         Arc<SessionRegistry>
//!              ┌──────────────────────────────────────┐
//!              │ tokens:     RwLock<Token -> name>     │
//!              │ names:      RwLock<name -> {Token}>   │
//!              │ deliveries: RwLock<Token -> Sender>   │
//!              └──────────────────┬───────────────────┘
//!                                 │ publish(): try_send, drop on full
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!   [DeliveryQueue]         [DeliveryQueue]         [DeliveryQueue]
//!    queue.recv()            queue.recv()            queue.recv()
//!         │                       │                       │
//!         └──► outbound loop ──► TCP
//! ```
//!
//! Login state is the only durable truth. Delivery queues hold transient,
//! best-effort data: losing a queued event never corrupts registry state.

pub mod config;
pub mod delivery;
pub mod error;
pub mod store;
pub mod token;

pub use config::RegistryConfig;
pub use delivery::DeliveryQueue;
pub use error::RegistryError;
pub use store::{PublishOutcome, SessionRegistry};
pub use token::Token;
