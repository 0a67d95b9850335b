//! Client configuration

use std::time::Duration;

use crate::protocol::constants::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};

/// Connection settings for a chat client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`
    pub addr: String,

    /// Bound on establishing the TCP connection
    pub connect_timeout: Duration,

    /// Bound on a login or logout round trip, and on stream acceptance
    pub request_timeout: Duration,

    /// Maximum frame payload size
    pub max_frame_size: usize,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(1),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
