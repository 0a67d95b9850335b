//! Protocol constants shared by client and server

/// Metadata key carrying the bearer token on a stream call
pub const TOKEN_HEADER: &str = "x-token";

/// Default server port
pub const DEFAULT_PORT: u16 = 8000;

/// Size of the big-endian frame length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum frame payload size (64KB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Longest string a frame field can carry (16-bit length prefix)
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Event payload bytes ahead of its strings: type, timestamp, kind
pub const EVENT_HEADER_SIZE: usize = 1 + 8 + 1;

/// Length prefix of one string field
pub const STRING_HEADER_SIZE: usize = 2;

/// Default capacity of the shared event queue
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1000;

/// Default capacity of each per-connection delivery queue
pub const DEFAULT_DELIVERY_CAPACITY: usize = 100;

// Client -> server frame types
pub const FRAME_LOGIN: u8 = 0x01;
pub const FRAME_LOGOUT: u8 = 0x02;
pub const FRAME_STREAM: u8 = 0x03;
pub const FRAME_MESSAGE: u8 = 0x04;

// Server -> client frame types
pub const FRAME_LOGIN_OK: u8 = 0x81;
pub const FRAME_LOGOUT_OK: u8 = 0x82;
pub const FRAME_STREAM_ACCEPTED: u8 = 0x83;
pub const FRAME_EVENT: u8 = 0x84;
pub const FRAME_STATUS: u8 = 0x8F;

// Event kinds
pub const EVENT_JOINED: u8 = 0;
pub const EVENT_LEFT: u8 = 1;
pub const EVENT_MESSAGE: u8 = 2;
pub const EVENT_SHUTTING_DOWN: u8 = 3;
