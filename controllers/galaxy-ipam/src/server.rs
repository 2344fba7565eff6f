//! HTTP server lifecycle

use std::net::SocketAddr;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ControllerError;

/// Serve `router` on `addr` until `cancel` fires, then drain open connections
pub async fn serve(name: &str, router: Router, addr: SocketAddr, cancel: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("{} listening on {}", name, addr);
    axum::serve(listener, router.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("{} stopped", name);
    Ok(())
}
