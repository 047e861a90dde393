use std::net::SocketAddr;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use minnow::server::Server;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let addr: SocketAddr = "0.0.0.0:1234".parse().expect("static address");
    let mut server = Server::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");
    server.run().context("event loop failed")?;
    Ok(())
}
