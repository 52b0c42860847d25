//! rxmppd - clustered XMPP stanza-routing daemon.

use rxmppd::cluster::kv::{KvStore, MemoryKv};
use rxmppd::config::Config;
use rxmppd::{http, metrics, server};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".into());
    let config = Config::load(&config_path)
        .map_err(|e| anyhow::anyhow!("loading {config_path}: {e}"))?;

    info!(
        hosts = ?config.server.hosts,
        listeners = config.listeners.len(),
        clustered = config.cluster.is_some(),
        "starting rxmppd"
    );

    // Port 0 turns the operational endpoint off (tests rely on this).
    match config.server.metrics_port.unwrap_or(9090) {
        0 => info!("metrics endpoint disabled"),
        port => {
            metrics::init();
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            tokio::spawn(http::serve(addr));
        }
    }

    // The process-local lease-aware store. A replicated deployment swaps
    // this handle for a client of the shared store; everything above the
    // trait is unchanged.
    let kv: Arc<dyn KvStore> = MemoryKv::new();

    let node = server::start_node(&config, kv).await?;
    for addr in node.listener_addrs() {
        info!(%addr, "listening");
    }
    if let Some(addr) = node.rpc_addr() {
        info!(%addr, "cluster rpc listening");
    }

    tokio::signal::ctrl_c().await?;
    info!("signal received, shutting down");
    node.shutdown().await;

    Ok(())
}
