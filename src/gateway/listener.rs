use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::GatewayContext;

pub(super) async fn start_listener(ctx: GatewayContext) -> Result<()> {
    let bind_addr = ctx.settings.listen;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);
    info!(address = %local_addr, "gateway listener started");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
        }
        let connection_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = super::handle_connection(stream, connection_ctx).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }
}
