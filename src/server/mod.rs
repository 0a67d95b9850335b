//! Chat server
//!
//! ```text
//! TcpListener ──► Connection (one call per connection)
//!                      │
//!                      ▼
//!                 ChatService ──► SessionRegistry
//!                      │
//!                      ▼
//!                  EventBus ──► Dispatcher ──► delivery queues
//! ```

pub mod config;
pub(crate) mod connection;
pub mod listener;
pub mod service;

pub use config::ServerConfig;
pub use listener::ChatServer;
pub use service::ChatService;
