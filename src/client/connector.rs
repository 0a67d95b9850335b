//! Client connections
//!
//! # Example
//! ```no_run
//! use chat_rs::client::{ChatClient, ClientConfig};
//!
//! # async fn example() -> chat_rs::Result<()> {
//! let client = ChatClient::new(ClientConfig::new("127.0.0.1:8000"));
//! let token = client.login("Alice").await?;
//!
//! let mut stream = client.stream(token.as_str()).await?;
//! stream.send("hello").await?;
//! while let Some(event) = stream.next_event().await? {
//!     println!("{}", event);
//!     if event.is_shutdown() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::config::ClientConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Event, Frame, FrameCodec, Metadata};
use crate::registry::Token;

type Transport = Framed<TcpStream, FrameCodec>;

/// Chat client
#[derive(Debug, Clone)]
pub struct ChatClient {
    config: ClientConfig,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Log in and return the session token
    pub async fn login(&self, name: &str) -> Result<Token> {
        let reply = self
            .call(Frame::Login {
                name: name.to_string(),
            })
            .await?;

        match reply {
            Frame::LoginOk { token } => Ok(Token::new(token)),
            other => Err(unexpected(&other)),
        }
    }

    /// End a login session
    pub async fn logout(&self, token: &str) -> Result<()> {
        let reply = self
            .call(Frame::Logout {
                token: token.to_string(),
            })
            .await?;

        match reply {
            Frame::LogoutOk => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Open the message/event stream for a token
    pub async fn stream(&self, token: &str) -> Result<ChatStream> {
        let mut transport = self.connect().await?;
        let open = async {
            transport
                .send(Frame::Stream {
                    metadata: Metadata::with_token(token),
                })
                .await?;
            read_reply(&mut transport).await
        };

        let reply = tokio::time::timeout(self.config.request_timeout, open)
            .await
            .map_err(|_| Error::Timeout)??;

        match reply {
            Frame::StreamAccepted => Ok(ChatStream { transport }),
            other => Err(unexpected(&other)),
        }
    }

    async fn connect(&self) -> Result<Transport> {
        let socket = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.addr),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        socket.set_nodelay(true)?;

        Ok(Framed::new(
            socket,
            FrameCodec::with_max_frame_size(self.config.max_frame_size),
        ))
    }

    /// One request/reply exchange on a fresh connection
    async fn call(&self, request: Frame) -> Result<Frame> {
        let mut transport = self.connect().await?;
        let exchange = async {
            transport.send(request).await?;
            read_reply(&mut transport).await
        };

        tokio::time::timeout(self.config.request_timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// Read one reply frame, turning a status frame into an error
async fn read_reply(transport: &mut Transport) -> Result<Frame> {
    match transport.next().await {
        Some(Ok(Frame::Status(status))) => Err(Error::Status(status)),
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(e),
        None => Err(Error::Disconnected),
    }
}

fn unexpected(frame: &Frame) -> Error {
    Error::Protocol(ProtocolError::UnexpectedFrame(frame.name()))
}

/// Convert an incoming stream frame into an event
fn into_event(frame: Option<Result<Frame>>) -> Result<Option<Event>> {
    match frame {
        None => Ok(None),
        Some(Ok(Frame::Event(event))) => Ok(Some(event)),
        Some(Ok(Frame::Status(status))) => Err(Error::Status(status)),
        Some(Ok(other)) => Err(unexpected(&other)),
        Some(Err(e)) => Err(e),
    }
}

/// An open stream
pub struct ChatStream {
    transport: Transport,
}

impl ChatStream {
    /// Send a chat message
    pub async fn send(&mut self, text: impl Into<String>) -> Result<()> {
        self.transport
            .send(Frame::Message { text: text.into() })
            .await
    }

    /// Wait for the next event; `None` once the server closes the stream
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        into_event(self.transport.next().await)
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (MessageSender, EventReceiver) {
        let (sink, stream) = self.transport.split::<Frame>();
        (MessageSender { sink }, EventReceiver { stream })
    }
}

/// Sending half of a split stream
pub struct MessageSender {
    sink: SplitSink<Transport, Frame>,
}

impl MessageSender {
    /// Send a chat message
    pub async fn send(&mut self, text: impl Into<String>) -> Result<()> {
        self.sink.send(Frame::Message { text: text.into() }).await
    }

    /// Half-close: the server sees the end of the message stream
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await
    }
}

/// Receiving half of a split stream
pub struct EventReceiver {
    stream: SplitStream<Transport>,
}

impl EventReceiver {
    /// Wait for the next event; `None` once the server closes the stream
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        into_event(self.stream.next().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Code, Status};

    #[test]
    fn test_into_event() {
        let event = Event::joined("Alice");
        assert_eq!(
            into_event(Some(Ok(Frame::Event(event.clone())))).unwrap(),
            Some(event)
        );
        assert_eq!(into_event(None).unwrap(), None);

        let err = into_event(Some(Ok(Frame::Status(Status::internal("boom"))))).unwrap_err();
        assert_eq!(err.code(), Some(Code::Internal));

        let err = into_event(Some(Ok(Frame::LogoutOk))).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedFrame("logout_ok"))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then release it
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let client = ChatClient::new(ClientConfig::new(addr.to_string()));
        let err = client.login("Alice").await.unwrap_err();
        assert!(matches!(err, Error::Io(_) | Error::Timeout));
    }

    #[tokio::test]
    async fn test_request_timeout_when_server_is_silent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            drop(socket);
        });

        let client = ChatClient::new(
            ClientConfig::new(addr.to_string())
                .request_timeout(std::time::Duration::from_millis(100)),
        );
        let err = client.logout("t1").await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        accept.abort();
    }
}
