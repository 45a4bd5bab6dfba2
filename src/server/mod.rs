//! HTTP server: dashboard page, WebSocket broadcast endpoint, query API,
//! health check and metrics.

mod routes;
mod ws;

pub use ws::WsSink;

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::service::MarketStream;

/// Build the application router
pub fn router(stream: Arc<MarketStream>) -> Router {
    Router::new()
        .route("/", get(routes::dashboard))
        .route("/ws", get(ws::websocket_handler))
        .route("/api/market-data", get(routes::market_data))
        .route("/api/market-data/:symbol", get(routes::symbol_data))
        .route("/api/symbols", get(routes::symbols))
        .route(
            "/api/subscriptions/:symbol",
            post(routes::subscribe).delete(routes::unsubscribe),
        )
        .route("/api/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(stream)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, stream: Arc<MarketStream>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "Starting HTTP server");

    axum::serve(
        listener,
        router(stream).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
