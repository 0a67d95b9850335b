//! Real-time chat server and client
//!
//! Clients log in with a name, receive an opaque token, and open a long-lived
//! bidirectional stream carrying that token. Messages sent on the stream are
//! broadcast to every connected client together with presence events
//! (joined / left) and a final shutdown notice.
//!
//! # Architecture
//!
//! ```text
//!   login / logout / message handlers
//!                 │
//!                 ▼
//!         EventBus (bounded, blocks producers when full)
//!                 │
//!                 ▼
//!           Dispatcher ──► SessionRegistry::publish()
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!   DeliveryQueue            DeliveryQueue            DeliveryQueue
//!   (drop on full)           (drop on full)           (drop on full)
//!         │                       │                       │
//!   outbound loop            outbound loop            outbound loop ──► TCP
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chat_rs::{ChatServer, ServerConfig};
//!
//! # async fn example() -> chat_rs::Result<()> {
//! let server = ChatServer::new(ServerConfig::default());
//! server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

pub use bus::{Dispatcher, EventBus};
pub use client::{ChatClient, ChatStream, ClientConfig};
pub use error::{Code, Error, Result, Status};
pub use protocol::{Event, EventKind, Frame, Metadata};
pub use registry::{RegistryConfig, SessionRegistry, Token};
pub use server::{ChatServer, ChatService, ServerConfig};
