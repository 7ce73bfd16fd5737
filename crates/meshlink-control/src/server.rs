//! HTTP Server Assembly
//!
//! Merges the coordinator and relay routers behind request tracing and
//! serves them on one listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coordinator::Coordinator;
use crate::error::ControlResult;
use crate::relay::{self, Relay};
use crate::routes;

/// Build the full application router
pub fn app(coordinator: Arc<Coordinator>, relay: Arc<Relay>) -> Router {
    routes::router(coordinator)
        .merge(relay::router(relay))
        .layer(TraceLayer::new_for_http())
}

/// Serve `app` on `addr` until `shutdown` resolves
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> ControlResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
