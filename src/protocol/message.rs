//! Protocol message types
//!
//! `Frame` is everything that travels over a connection. `Event` is what the
//! server broadcasts on every open stream.

use std::fmt;

use chrono::{DateTime, Utc};

use super::constants::TOKEN_HEADER;
use crate::error::Status;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A name went from zero to one active session
    Joined { name: String },
    /// A name went from one to zero active sessions
    Left { name: String },
    /// A client sent a chat message
    Message { name: String, text: String },
    /// The server is stopping; this is the last event on every stream
    ShuttingDown,
}

/// A broadcast event
///
/// Immutable once created. Cloning is cheap enough for per-recipient fan-out
/// since chat payloads are short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// When the event was created
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub kind: EventKind,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn joined(name: impl Into<String>) -> Self {
        Self::new(EventKind::Joined { name: name.into() })
    }

    pub fn left(name: impl Into<String>) -> Self {
        Self::new(EventKind::Left { name: name.into() })
    }

    pub fn message(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(EventKind::Message {
            name: name.into(),
            text: text.into(),
        })
    }

    pub fn shutting_down() -> Self {
        Self::new(EventKind::ShuttingDown)
    }

    /// Check if this is the server shutdown notice
    pub fn is_shutdown(&self) -> bool {
        matches!(self.kind, EventKind::ShuttingDown)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Joined { name } => write!(f, "{} is online", name),
            EventKind::Left { name } => write!(f, "{} is offline", name),
            EventKind::Message { name, text } => write!(f, "{}: {}", name, text),
            EventKind::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

/// Call metadata sent with a stream request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata carrying only the bearer token
    pub fn with_token(token: impl Into<String>) -> Self {
        let mut metadata = Self::new();
        metadata.insert(TOKEN_HEADER, token);
        metadata
    }

    /// Add an entry; keys are stored lowercase
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push((key.into().to_ascii_lowercase(), value.into()));
    }

    /// First value for a key (case-insensitive)
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The bearer token, if present
    pub fn token(&self) -> Option<&str> {
        self.get(TOKEN_HEADER)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    // Client -> server
    Login { name: String },
    Logout { token: String },
    Stream { metadata: Metadata },
    Message { text: String },

    // Server -> client
    LoginOk { token: String },
    LogoutOk,
    StreamAccepted,
    Event(Event),
    Status(Status),
}

impl Frame {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Login { .. } => "login",
            Frame::Logout { .. } => "logout",
            Frame::Stream { .. } => "stream",
            Frame::Message { .. } => "message",
            Frame::LoginOk { .. } => "login_ok",
            Frame::LogoutOk => "logout_ok",
            Frame::StreamAccepted => "stream_accepted",
            Frame::Event(_) => "event",
            Frame::Status(_) => "status",
        }
    }

    /// Whether a client may open a call with this frame
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Frame::Login { .. } | Frame::Logout { .. } | Frame::Stream { .. }
        )
    }
}

impl From<Event> for Frame {
    fn from(event: Event) -> Self {
        Frame::Event(event)
    }
}

impl From<Status> for Frame {
    fn from(status: Status) -> Self {
        Frame::Status(status)
    }
}
