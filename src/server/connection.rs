//! Per-connection handler
//!
//! A connection carries exactly one call. The first frame selects it:
//!
//! ```text
//! Login{name}       -> LoginOk{token} | Status
//! Logout{token}     -> LogoutOk       | Status
//! Stream{metadata}  -> StreamAccepted, then Message frames in and
//!                      Event frames out until either side stops
//!                   |  Status
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ProtocolError, Result, Status};
use crate::protocol::{Event, Frame, FrameCodec, Metadata};
use crate::server::config::ServerConfig;
use crate::server::service::ChatService;
use crate::stats::ServerCounters;

/// A single accepted connection
pub(crate) struct Connection<T> {
    id: u64,
    peer_addr: Option<SocketAddr>,
    framed: Framed<T, FrameCodec>,
    service: ChatService,
    counters: Arc<ServerCounters>,
    connection_timeout: Duration,
    write_timeout: Duration,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: u64,
        io: T,
        peer_addr: Option<SocketAddr>,
        config: &ServerConfig,
        service: ChatService,
        counters: Arc<ServerCounters>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            framed: Framed::new(io, FrameCodec::with_max_frame_size(config.max_frame_size)),
            service,
            counters,
            connection_timeout: config.connection_timeout,
            write_timeout: config.write_timeout,
        }
    }

    /// Serve the connection's call
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<()> {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            first = tokio::time::timeout(self.connection_timeout, self.framed.next()) => first,
        };

        let frame = match first {
            Err(_) => {
                tracing::debug!(connection_id = self.id, "No request before timeout");
                return Err(Error::Timeout);
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(Error::Protocol(e)))) => {
                self.reply(Status::invalid_argument(e.to_string()).into())
                    .await?;
                return Err(Error::Protocol(e));
            }
            Ok(Some(Err(e))) => return Err(e),
            Ok(Some(Ok(frame))) => frame,
        };

        tracing::debug!(connection_id = self.id, call = frame.name(), "Request received");

        match frame {
            Frame::Login { name } => {
                let reply = match self.service.login(&name).await {
                    Ok(token) => Frame::LoginOk {
                        token: token.into_string(),
                    },
                    Err(status) => status.into(),
                };
                self.reply(reply).await
            }
            Frame::Logout { token } => {
                let reply = match self.service.logout(&token).await {
                    Ok(()) => Frame::LogoutOk,
                    Err(status) => status.into(),
                };
                self.reply(reply).await
            }
            Frame::Stream { metadata } => self.stream(metadata, cancel).await,
            other => {
                let status =
                    Status::invalid_argument(format!("unexpected {} frame", other.name()));
                self.reply(status.into()).await
            }
        }
    }

    async fn stream(mut self, metadata: Metadata, cancel: &CancellationToken) -> Result<()> {
        let context = match self.service.authenticate(&metadata).await {
            Ok(context) => context,
            Err(status) => {
                tracing::debug!(
                    connection_id = self.id,
                    status = %status,
                    "Stream rejected"
                );
                return self.reply(status.into()).await;
            }
        };
        let context = context.with_connection(self.id, self.peer_addr);

        // Everything published after StreamAccepted must reach this stream
        let mut session = self.service.open_stream(context);
        session.open().await;
        self.reply(Frame::StreamAccepted).await?;

        let Connection {
            framed, counters, ..
        } = self;

        let (sink, source) = framed.split::<Frame>();
        let sink = sink.with(|event: Event| future::ready(Ok::<_, Error>(Frame::Event(event))));
        let source = source.map(|frame: Result<Frame>| match frame {
            Ok(Frame::Message { text }) => Ok(text),
            Ok(other) => Err(Error::Protocol(ProtocolError::UnexpectedFrame(other.name()))),
            Err(e) => Err(e),
        });

        counters.stream_opened();
        let result = session.run(source, sink, cancel).await;
        counters.stream_closed();

        result.map(|_| ())
    }

    async fn reply(&mut self, frame: Frame) -> Result<()> {
        tokio::time::timeout(self.write_timeout, self.framed.send(frame))
            .await
            .map_err(|_| Error::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Encoder;

    use super::*;
    use crate::bus::EventBus;
    use crate::error::Code;
    use crate::protocol::{max_message_len, EventKind};
    use crate::registry::SessionRegistry;

    fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf.to_vec()
    }

    struct Harness {
        service: ChatService,
        counters: Arc<ServerCounters>,
        config: ServerConfig,
        dispatcher: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn new() -> Self {
            let config = ServerConfig::default()
                .connection_timeout(Duration::from_millis(200))
                .write_timeout(Duration::from_secs(1));
            let registry = Arc::new(SessionRegistry::new());
            let (bus, dispatcher) = EventBus::new(64);
            let dispatcher = dispatcher.spawn(Arc::clone(&registry));
            Self {
                service: ChatService::new(registry, bus, config.write_timeout)
                    .max_frame_size(config.max_frame_size),
                counters: Arc::new(ServerCounters::new()),
                config,
                dispatcher,
            }
        }

        fn connection<T>(&self, io: T) -> Connection<T>
        where
            T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            Connection::new(
                1,
                io,
                None,
                &self.config,
                self.service.clone(),
                Arc::clone(&self.counters),
            )
        }

        /// Spawn a connection over an in-memory pipe and return the client end
        fn spawn(&self, cancel: &CancellationToken) -> (
            Framed<DuplexStream, FrameCodec>,
            tokio::task::JoinHandle<Result<()>>,
        ) {
            let (client, server) = tokio::io::duplex(4096);
            let connection = self.connection(server);
            let cancel = cancel.clone();
            let task = tokio::spawn(async move { connection.run(&cancel).await });
            (Framed::new(client, FrameCodec::new()), task)
        }

        /// Open a stream for `token` and wait for it to be accepted
        async fn stream(
            &self,
            cancel: &CancellationToken,
            token: &str,
        ) -> (
            Framed<DuplexStream, FrameCodec>,
            tokio::task::JoinHandle<Result<()>>,
        ) {
            let (mut client, task) = self.spawn(cancel);
            client
                .send(Frame::Stream {
                    metadata: Metadata::with_token(token),
                })
                .await
                .unwrap();
            assert_eq!(client.next().await.unwrap().unwrap(), Frame::StreamAccepted);
            (client, task)
        }

        async fn stop(self) {
            self.service.bus().close();
            self.dispatcher.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_logout_unknown_token_replies_not_found() {
        let harness = Harness::new();
        let mock = tokio_test::io::Builder::new()
            .read(&encode(Frame::Logout {
                token: "nope".into(),
            }))
            .write(&encode(Status::not_found("Token not found").into()))
            .build();

        harness
            .connection(mock)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_login_with_empty_name_replies_invalid_argument() {
        let harness = Harness::new();
        let mock = tokio_test::io::Builder::new()
            .read(&encode(Frame::Login { name: "".into() }))
            .write(&encode(Status::invalid_argument("name is required").into()))
            .build();

        harness
            .connection(mock)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_non_request_first_frame_is_rejected() {
        let harness = Harness::new();
        let mock = tokio_test::io::Builder::new()
            .read(&encode(Frame::Message { text: "hi".into() }))
            .write(&encode(
                Status::invalid_argument("unexpected message frame").into(),
            ))
            .build();

        harness
            .connection(mock)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_stream_without_token_replies_unauthenticated() {
        let harness = Harness::new();
        let mock = tokio_test::io::Builder::new()
            .read(&encode(Frame::Stream {
                metadata: Metadata::new(),
            }))
            .write(&encode(
                Status::unauthenticated("Missing token header").into(),
            ))
            .build();

        harness
            .connection(mock)
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(harness.counters.snapshot().active_streams, 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let harness = Harness::new();
        let cancel = CancellationToken::new();
        let (_client, task) = harness.spawn(&cancel);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Timeout)));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_login_then_stream_echoes_message() {
        let harness = Harness::new();
        let cancel = CancellationToken::new();

        let (mut client, task) = harness.spawn(&cancel);
        client
            .send(Frame::Login {
                name: "Alice".into(),
            })
            .await
            .unwrap();
        let token = match client.next().await.unwrap().unwrap() {
            Frame::LoginOk { token } => token,
            other => panic!("unexpected reply: {:?}", other),
        };
        task.await.unwrap().unwrap();

        let (mut client, task) = harness.spawn(&cancel);
        client
            .send(Frame::Stream {
                metadata: Metadata::with_token(token),
            })
            .await
            .unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::StreamAccepted);

        client
            .send(Frame::Message {
                text: "hello".into(),
            })
            .await
            .unwrap();

        // The login announcement may or may not reach this stream first
        let event = loop {
            match client.next().await.unwrap().unwrap() {
                Frame::Event(event) if matches!(event.kind, EventKind::Joined { .. }) => continue,
                Frame::Event(event) => break event,
                other => panic!("unexpected frame: {:?}", other),
            }
        };
        assert_eq!(
            event.kind,
            EventKind::Message {
                name: "Alice".into(),
                text: "hello".into()
            }
        );
        assert_eq!(harness.counters.snapshot().active_streams, 1);

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(harness.counters.snapshot().active_streams, 0);
        assert_eq!(harness.service.registry().delivery_count().await, 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_unexpected_frame_mid_stream_ends_stream() {
        let harness = Harness::new();
        let token = harness.service.login("Alice").await.unwrap();
        let cancel = CancellationToken::new();

        let (mut client, task) = harness.spawn(&cancel);
        client
            .send(Frame::Stream {
                metadata: Metadata::with_token(token.as_str()),
            })
            .await
            .unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::StreamAccepted);

        client
            .send(Frame::Login {
                name: "Bob".into(),
            })
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::UnexpectedFrame("login")))
        ));
        assert_eq!(harness.service.registry().delivery_count().await, 0);
        harness.stop().await;
    }

    /// Next message event on a client stream, skipping presence
    async fn next_message(client: &mut Framed<DuplexStream, FrameCodec>) -> (String, String) {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("event should arrive")
                .unwrap()
                .unwrap();
            match frame {
                Frame::Event(Event {
                    kind: EventKind::Message { name, text },
                    ..
                }) => return (name, text),
                Frame::Event(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_message_at_event_frame_limit() {
        let harness = Harness::new();
        let alice_token = harness.service.login("Alice").await.unwrap();
        let bob_token = harness.service.login("Bob").await.unwrap();
        let cancel = CancellationToken::new();

        let (mut alice, alice_task) = harness.stream(&cancel, alice_token.as_str()).await;
        let (mut bob, bob_task) = harness.stream(&cancel, bob_token.as_str()).await;
        assert_eq!(harness.service.registry().delivery_count().await, 2);

        // The largest message that still fits in an event frame is delivered
        let limit = max_message_len(harness.config.max_frame_size, "Alice");
        alice
            .send(Frame::Message {
                text: "x".repeat(limit),
            })
            .await
            .unwrap();
        let (name, text) = next_message(&mut bob).await;
        assert_eq!(name, "Alice");
        assert_eq!(text.len(), limit);
        let (_, text) = next_message(&mut alice).await;
        assert_eq!(text.len(), limit);

        // One byte more ends only the sender's stream
        alice
            .send(Frame::Message {
                text: "x".repeat(limit + 1),
            })
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), alice_task)
            .await
            .expect("sender stream should end")
            .unwrap();
        match result {
            Err(Error::Status(status)) => assert_eq!(status.code, Code::InvalidArgument),
            other => panic!("expected invalid argument, got {:?}", other),
        }
        assert_eq!(harness.service.registry().delivery_count().await, 1);

        bob.send(Frame::Message {
            text: "still here".into(),
        })
        .await
        .unwrap();
        assert_eq!(
            next_message(&mut bob).await,
            ("Bob".to_string(), "still here".to_string())
        );
        assert!(!bob_task.is_finished());

        drop(alice);
        drop(bob);
        bob_task.await.unwrap().unwrap();
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_before_first_frame() {
        let harness = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (_client, task) = harness.spawn(&cancel);
        task.await.unwrap().unwrap();
        harness.stop().await;
    }
}
