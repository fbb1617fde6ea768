use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use webserv::config::{self, Config};
use webserv::server;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = config::resolve_path(std::env::args().nth(1));
    let cfg = Arc::new(Config::load(&path)?);
    tracing::info!(config = %path.display(), servers = cfg.servers.len(), "configuration loaded");

    tokio::select! {
        res = server::run(cfg) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
