use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use quicgate_server::{Server, ServerConfig};

/// quicgate egress server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TLS certificate chain file, PEM (required)
    #[arg(long)]
    cert: PathBuf,

    /// TLS private key file, PEM (required)
    #[arg(long)]
    key: PathBuf,

    /// Bearer token expected at the head of every stream (required)
    #[arg(long)]
    token: String,

    /// UDP listen address
    #[arg(long, default_value = "0.0.0.0:443")]
    listen: SocketAddr,
}

#[cfg(unix)]
async fn wait_for_signal() {
    use futures::StreamExt;
    if let Ok(mut signals) = signal_hook_tokio::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ]) {
        signals.next().await;
    }
}

#[cfg(windows)]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let server = Server::new(ServerConfig {
        cert: args.cert,
        key: args.key,
        token: args.token,
        listen: args.listen,
    })
    .context("server startup failed")?;
    let server = Arc::new(server);

    tracing::info!("quicgate server listening on {}", args.listen);

    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    wait_for_signal().await;
    tracing::info!("signal received, shutting down");

    server.shutdown();
    let _ = runner.await;
    Ok(())
}
