use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{Config, ListenAddr};
use crate::handler::Dispatcher;
use crate::http::connection::{ConnInfo, Connection};
use crate::router::Router;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Binds every distinct listen address and serves until a listener fails.
///
/// Addresses that cannot be bound are logged and skipped; it is an error
/// only when none can be bound.
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let mut listeners = JoinSet::new();

    for (addr, servers) in config.listen_groups() {
        let listener = match bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %addr, error = %e, "failed to bind");
                continue;
            }
        };
        info!("Listening on {}", addr);
        let dispatcher = Arc::new(Dispatcher::new(Router::new(config.clone(), servers)));
        listeners.spawn(accept_loop(listener, dispatcher));
    }

    if listeners.is_empty() {
        anyhow::bail!("no listen address could be bound");
    }

    while let Some(result) = listeners.join_next().await {
        result??;
    }
    Ok(())
}

pub async fn bind(addr: &ListenAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind((addr.host.as_str(), addr.port)).await
}

/// Accepts connections forever, one task per connection.
pub async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        info!("Accepted connection from {}", peer);

        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping connection without local address");
                continue;
            }
        };
        let info = ConnInfo { peer, local };
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = Connection::new(socket, info, dispatcher).run().await {
                tracing::debug!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
