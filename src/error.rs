//! Error types
//!
//! `Error` is the crate-wide error. `Status` is the failure a request handler
//! reports back to the calling client; it travels over the wire as a status
//! frame and surfaces on the client side as `Error::Status`.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::registry::RegistryError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Status(Status),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("event bus is closed")]
    BusClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("peer disconnected")]
    Disconnected,

    #[error("server is already running")]
    AlreadyStarted,
}

impl Error {
    /// Whether this error means the peer went away rather than something
    /// actually failing
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::NotConnected
            ),
            Error::Timeout | Error::Disconnected => true,
            _ => false,
        }
    }

    /// Status code carried by this error, if it is an RPC failure
    pub fn code(&self) -> Option<Code> {
        match self {
            Error::Status(status) => Some(status.code),
            _ => None,
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Status(status)
    }
}

/// Wire protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("unknown event kind {0}")]
    UnknownEventKind(u8),

    #[error("unknown status code {0}")]
    UnknownStatusCode(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("string of {0} bytes does not fit in a frame field")]
    StringTooLong(usize),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),
}

/// RPC status codes
///
/// Numbering follows the gRPC code table so the values are familiar to
/// anyone reading a packet capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl Code {
    /// Wire value
    pub fn as_u8(self) -> u8 {
        match self {
            Code::InvalidArgument => 3,
            Code::NotFound => 5,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::Unauthenticated => 16,
        }
    }

    /// Parse a wire value
    pub fn from_u8(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            3 => Ok(Code::InvalidArgument),
            5 => Ok(Code::NotFound),
            13 => Ok(Code::Internal),
            14 => Ok(Code::Unavailable),
            16 => Ok(Code::Unauthenticated),
            other => Err(ProtocolError::UnknownStatusCode(other)),
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::InvalidArgument => "invalid argument",
            Code::NotFound => "not found",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// Failure reported by a request handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
