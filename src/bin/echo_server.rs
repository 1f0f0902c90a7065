//! Plain TCP echo server — a practice target for the proxy
//!
//! Run it as the upstream, point WireStorm at it, and every byte a
//! client sends comes back through both fault pipelines.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "echo-server", about = "TCP echo server for exercising WireStorm")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!("📡 echo server listening on {}", listener.local_addr()?);

    loop {
        let (mut stream, peer) = listener.accept().await.context("accepting")?;
        tokio::spawn(async move {
            debug!(%peer, "connected");
            let (mut rd, mut wr) = stream.split();
            match tokio::io::copy(&mut rd, &mut wr).await {
                Ok(bytes) => debug!(%peer, bytes, "closed"),
                Err(e) => warn!(%peer, error = %e, "echo failed"),
            }
        });
    }
}
