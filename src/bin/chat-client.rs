//! Chat client binary
//!
//! Reads lines from stdin and sends them as messages; prints every event the
//! server broadcasts.
//!
//! Usage: chat-client -n <name> [-a localhost:8000] [-d]

use chrono::Local;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use chat_rs::client::{ChatClient, ClientConfig};
use chat_rs::protocol::max_message_len;
use chat_rs::{Error, Event, EventKind};

#[derive(Debug, Parser)]
#[command(name = "chat-client", version, about = "Real-time chat client")]
struct Args {
    /// Server address
    #[arg(short = 'a', long = "addr", default_value = "localhost:8000")]
    addr: String,

    /// Name shown to other clients
    #[arg(short = 'n', long = "name")]
    name: String,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("chat_rs={}", level).parse()?)
                .add_directive(format!("chat_client={}", level).parse()?),
        )
        .init();

    if args.name.is_empty() {
        return Err("name must not be empty".into());
    }

    let client = ChatClient::new(ClientConfig::new(args.addr));
    let limit = max_message_len(client.config().max_frame_size, &args.name);
    let token = client.login(&args.name).await?;
    tracing::debug!(name = %args.name, "Logged in");

    let stream = client.stream(token.as_str()).await?;
    tracing::debug!("Connected to stream");

    let (mut sender, mut receiver) = stream.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut shutdown = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::debug!("Interrupted");
                break;
            }
            event = receiver.next_event() => match event {
                Ok(Some(event)) => {
                    print_event(&event);
                    if event.is_shutdown() {
                        shutdown = true;
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("Stream closed by server");
                    break;
                }
                Err(e) => {
                    eprintln!("Stream error: {}", e);
                    break;
                }
            },
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) if line.len() > limit => {
                    eprintln!(
                        "Message not sent: {} bytes is over the {} byte limit",
                        line.len(),
                        limit
                    );
                }
                Ok(Some(line)) => match sender.send(line).await {
                    Ok(()) => {}
                    Err(Error::Protocol(e)) => eprintln!("Message not sent: {}", e),
                    Err(e) => {
                        tracing::debug!(error = %e, "Failed to send message");
                        break;
                    }
                },
                Ok(None) => {
                    tracing::debug!("Input closed");
                    input_open = false;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read input");
                    input_open = false;
                }
            },
        }
    }

    let _ = sender.close().await;

    // The server forgets everything on shutdown
    if !shutdown {
        match client.logout(token.as_str()).await {
            Ok(()) => tracing::debug!("Logged out"),
            Err(e) => tracing::debug!(error = %e, "Failed to log out"),
        }
    }

    Ok(())
}

fn print_event(event: &Event) {
    let time = event.timestamp.with_timezone(&Local).format("%H:%M:%S");
    match &event.kind {
        EventKind::Joined { .. } | EventKind::Left { .. } | EventKind::ShuttingDown => {
            println!("{} Server: {}", time, event);
        }
        EventKind::Message { .. } => println!("{} {}", time, event),
    }
}
