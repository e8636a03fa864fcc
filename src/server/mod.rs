//! Network adapters: HTTP ingestion and the WebSocket consumer transport.
//!
//! Both share one listener. Neither holds state of its own; every request
//! becomes a registry call.

pub mod http;
pub mod ws;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Result;
use crate::registry::Registry;

/// Build the broker's router around a registry.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/enqueue", post(http::enqueue))
        .route("/config", post(http::configure))
        .route("/queues", get(http::list_queues))
        .route("/queues/{name}", get(http::queue_stats))
        .route("/ws", get(ws::upgrade))
        .fallback(http::not_found)
        .with_state(registry)
}

/// Bind a listener for the broker.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, registry: Arc<Registry>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "broker listening (http + websocket)");
    }
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
