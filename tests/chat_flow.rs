//! End-to-end chat flows over loopback TCP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use chat_rs::client::{ChatClient, ChatStream, ClientConfig};
use chat_rs::error::ProtocolError;
use chat_rs::protocol::max_message_len;
use chat_rs::{ChatServer, Code, Error, Event, EventKind, ServerConfig};

struct TestServer {
    server: Arc<ChatServer>,
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<chat_rs::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(ChatServer::new(
            ServerConfig::with_addr(addr).shutdown_grace(Duration::from_secs(1)),
        ));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server
                    .serve_until(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        Self {
            server,
            addr,
            stop: Some(stop_tx),
            task,
        }
    }

    fn client(&self) -> ChatClient {
        ChatClient::new(ClientConfig::new(self.addr.to_string()))
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
    }
}

/// Next event that is not the stream owner's own login announcement
async fn next_event(stream: &mut ChatStream, own_name: &str) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), stream.next_event())
            .await
            .expect("event should arrive")
            .unwrap()
            .expect("stream should be open");

        match &event.kind {
            EventKind::Joined { name } if name == own_name => continue,
            _ => return event,
        }
    }
}

#[tokio::test]
async fn test_messages_and_presence_reach_every_stream() {
    let server = TestServer::start().await;
    let client = server.client();

    let alice_token = client.login("Alice").await.unwrap();
    let mut alice = client.stream(alice_token.as_str()).await.unwrap();

    let bob_token = client.login("Bob").await.unwrap();
    assert_eq!(
        next_event(&mut alice, "Alice").await.kind,
        EventKind::Joined { name: "Bob".into() }
    );

    let mut bob = client.stream(bob_token.as_str()).await.unwrap();
    bob.send("hi").await.unwrap();

    let expected = EventKind::Message {
        name: "Bob".into(),
        text: "hi".into(),
    };
    assert_eq!(next_event(&mut alice, "Alice").await.kind, expected);
    // Senders receive their own messages
    assert_eq!(next_event(&mut bob, "Bob").await.kind, expected);

    drop(bob);
    client.logout(bob_token.as_str()).await.unwrap();
    assert_eq!(
        next_event(&mut alice, "Alice").await.kind,
        EventKind::Left { name: "Bob".into() }
    );

    drop(alice);
    server.shutdown().await;
}

#[tokio::test]
async fn test_presence_tracks_first_and_last_session() {
    let server = TestServer::start().await;
    let client = server.client();

    let bob_token = client.login("Bob").await.unwrap();
    let mut bob = client.stream(bob_token.as_str()).await.unwrap();

    let first = client.login("Alice").await.unwrap();
    let second = client.login("Alice").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(
        next_event(&mut bob, "Bob").await.kind,
        EventKind::Joined {
            name: "Alice".into()
        }
    );

    client.logout(first.as_str()).await.unwrap();
    assert!(server.server.registry().is_online("Alice").await);

    // Nothing was announced for the second login or the first logout
    bob.send("marker").await.unwrap();
    assert_eq!(
        next_event(&mut bob, "Bob").await.kind,
        EventKind::Message {
            name: "Bob".into(),
            text: "marker".into()
        }
    );

    client.logout(second.as_str()).await.unwrap();
    assert_eq!(
        next_event(&mut bob, "Bob").await.kind,
        EventKind::Left {
            name: "Alice".into()
        }
    );
    assert!(!server.server.registry().is_online("Alice").await);

    drop(bob);
    server.shutdown().await;
}

#[tokio::test]
async fn test_request_validation() {
    let server = TestServer::start().await;
    let client = server.client();

    let err = client.login("").await.unwrap_err();
    assert_eq!(err.code(), Some(Code::InvalidArgument));

    let err = client.logout("not-a-token").await.unwrap_err();
    assert_eq!(err.code(), Some(Code::NotFound));

    let err = client.stream("not-a-token").await.err().unwrap();
    assert_eq!(err.code(), Some(Code::Unauthenticated));

    let token = client.login("Alice").await.unwrap();
    client.logout(token.as_str()).await.unwrap();
    let err = client.logout(token.as_str()).await.unwrap_err();
    assert_eq!(err.code(), Some(Code::NotFound));

    let err = client.stream(token.as_str()).await.err().unwrap();
    assert_eq!(err.code(), Some(Code::Unauthenticated));

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_notice_is_last_event() {
    let server = TestServer::start().await;
    let client = server.client();

    let token = client.login("Alice").await.unwrap();
    let mut alice = client.stream(token.as_str()).await.unwrap();

    let addr = server.addr;
    let registry = Arc::clone(server.server.registry());
    assert_eq!(registry.delivery_count().await, 1);

    let shutdown = tokio::spawn(server.shutdown());

    let mut shutdowns = 0;
    loop {
        let next = tokio::time::timeout(Duration::from_secs(3), alice.next_event())
            .await
            .expect("stream should end after shutdown");
        match next {
            Ok(Some(event)) if event.is_shutdown() => shutdowns += 1,
            Ok(Some(event)) => assert!(
                shutdowns == 0,
                "event after shutdown notice: {:?}",
                event
            ),
            Ok(None) | Err(_) => break,
        }
    }
    assert_eq!(shutdowns, 1);

    shutdown.await.unwrap();
    assert_eq!(registry.delivery_count().await, 0);

    // Nothing is listening any more
    let err = ChatClient::new(ClientConfig::new(addr.to_string()))
        .login("Bob")
        .await
        .unwrap_err();
    assert!(err.code().is_none());
}

#[tokio::test]
async fn test_split_stream_halves() {
    let server = TestServer::start().await;
    let client = server.client();

    let token = client.login("Alice").await.unwrap();
    let stream = client.stream(token.as_str()).await.unwrap();
    let (mut sender, mut receiver) = stream.split();

    sender.send("one").await.unwrap();
    sender.send("two").await.unwrap();

    let mut texts = Vec::new();
    while texts.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), receiver.next_event())
            .await
            .expect("event should arrive")
            .unwrap()
            .unwrap();
        if let EventKind::Message { text, .. } = event.kind {
            texts.push(text);
        }
    }
    assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);

    // Closing the send half ends the stream on the server
    sender.close().await.unwrap();
    let registry = Arc::clone(server.server.registry());
    for _ in 0..200 {
        if registry.delivery_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(registry.delivery_count().await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unsendable_message_keeps_stream_open() {
    let server = TestServer::start().await;
    let client = server.client();

    let token = client.login("Alice").await.unwrap();
    let (mut sender, mut receiver) = client.stream(token.as_str()).await.unwrap().split();

    // Longer than a string field can carry: fails locally, nothing is sent
    let err = sender.send("x".repeat(70_000)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::StringTooLong(70_000))
    ));

    let limit = max_message_len(client.config().max_frame_size, "Alice");
    sender.send("x".repeat(limit)).await.unwrap();
    sender.send("after").await.unwrap();

    let mut lens = Vec::new();
    while lens.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), receiver.next_event())
            .await
            .expect("event should arrive")
            .unwrap()
            .expect("stream should be open");
        if let EventKind::Message { text, .. } = event.kind {
            lens.push(text.len());
        }
    }
    assert_eq!(lens, vec![limit, 5]);

    drop(sender);
    drop(receiver);
    server.shutdown().await;
}
