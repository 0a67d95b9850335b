//! Chat client
//!
//! Every call opens its own connection: `login` and `logout` are single
//! request/reply exchanges, `stream` keeps the connection open as a
//! bidirectional message/event channel.

pub mod config;
pub mod connector;

pub use config::ClientConfig;
pub use connector::{ChatClient, ChatStream, EventReceiver, MessageSender};
