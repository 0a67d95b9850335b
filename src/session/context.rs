//! Stream session context

use std::net::SocketAddr;

use crate::registry::Token;

/// Identity of an authenticated stream
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Connection ID assigned by the listener
    pub connection_id: u64,

    /// Remote peer address, when the transport has one
    pub peer_addr: Option<SocketAddr>,

    /// Bearer token the stream authenticated with
    pub token: Token,

    /// Client name the token belongs to
    pub name: String,
}

impl SessionContext {
    pub fn new(token: Token, name: impl Into<String>) -> Self {
        Self {
            connection_id: 0,
            peer_addr: None,
            token,
            name: name.into(),
        }
    }

    /// Attach the connection this stream arrived on
    pub fn with_connection(mut self, connection_id: u64, peer_addr: Option<SocketAddr>) -> Self {
        self.connection_id = connection_id;
        self.peer_addr = peer_addr;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_connection() {
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let context = SessionContext::new(Token::new("t1"), "Alice").with_connection(7, Some(addr));

        assert_eq!(context.connection_id, 7);
        assert_eq!(context.peer_addr, Some(addr));
        assert_eq!(context.name, "Alice");
    }
}
