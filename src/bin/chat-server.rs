//! Chat server binary
//!
//! Usage: chat-server [-a 0.0.0.0:8000] [-d]

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use chat_rs::{ChatServer, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "chat-server", version, about = "Real-time chat server")]
struct Args {
    /// Address to listen on
    #[arg(short = 'a', long = "addr", default_value = "0.0.0.0:8000")]
    addr: SocketAddr,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_connections: usize,

    /// Milliseconds allowed for the shutdown notice and connection drain
    #[arg(long, default_value_t = 1000)]
    shutdown_grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("chat_rs={}", level).parse()?)
                .add_directive(format!("chat_server={}", level).parse()?),
        )
        .init();

    let config = ServerConfig::with_addr(args.addr)
        .max_connections(args.max_connections)
        .shutdown_grace(Duration::from_millis(args.shutdown_grace_ms));

    let server = ChatServer::new(config);
    server.run_until(shutdown_signal()).await?;

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
