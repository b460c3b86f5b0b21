use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use quicgate_core::{ClientConfig, ClientHandle, LogLevel, Mode, RuleSource};

/// quicgate client: local SOCKS5 proxy over a QUIC tunnel
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tunnel server as host:port (required)
    #[arg(long)]
    server: String,

    /// Bearer token (required)
    #[arg(long)]
    token: String,

    /// Local SOCKS5 port on loopback
    #[arg(long, default_value_t = 1080)]
    port: u16,

    /// Routing mode: smart or global
    #[arg(long, default_value = "smart")]
    mode: String,

    /// Optional rule file, one domain per line; missing file means an
    /// empty rule set
    #[arg(long)]
    rules: Option<PathBuf>,

    /// SNI override; defaults to the server host
    #[arg(long)]
    server_name: Option<String>,

    /// Extra PEM trust anchors merged into the system roots
    #[arg(long)]
    ca_bundle: Option<PathBuf>,

    /// Skip server certificate verification (development only)
    #[arg(long)]
    skip_cert_verify: bool,

    /// Log level: silent, error, warning, info, debug
    #[arg(long, default_value = "info")]
    log_level: String,
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

    let mut config = ClientConfig::new(args.server, args.token);
    config.local_port = args.port;
    config.mode = args.mode.parse::<Mode>().context("bad --mode")?;
    config.server_name = args.server_name;
    config.ca_bundle = args.ca_bundle;
    config.skip_cert_verify = args.skip_cert_verify;
    config.rules = args.rules.map(RuleSource::File);
    config.log_level = args.log_level.parse::<LogLevel>().context("bad --log-level")?;

    let client = ClientHandle::start(config)
        .await
        .context("client startup failed")?;

    wait_for_signal().await;
    tracing::info!("signal received, shutting down");
    client.stop().await;
    Ok(())
}
