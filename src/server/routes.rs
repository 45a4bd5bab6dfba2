//! HTTP query and subscription handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::error::StreamError;
use crate::registry::UnsubscribeOutcome;
use crate::service::MarketStream;
use crate::tick::Symbol;

const DASHBOARD: &str = include_str!("dashboard.html");

/// Error response wrapper for `StreamError`
pub struct ApiError(StreamError);

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StreamError::InvalidSymbol(_) => StatusCode::BAD_REQUEST,
            e if e.is_feed_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD)
}

pub async fn market_data(State(stream): State<Arc<MarketStream>>) -> impl IntoResponse {
    Json(stream.snapshot())
}

pub async fn symbol_data(
    State(stream): State<Arc<MarketStream>>,
    Path(symbol): Path<String>,
) -> ApiResult<Response> {
    let symbol = Symbol::parse(&symbol)?;

    Ok(match stream.latest(symbol.as_str()) {
        Some(tick) => Json(tick).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no data yet", "symbol": symbol })),
        )
            .into_response(),
    })
}

pub async fn symbols(State(stream): State<Arc<MarketStream>>) -> impl IntoResponse {
    Json(stream.active_symbols())
}

pub async fn subscribe(
    State(stream): State<Arc<MarketStream>>,
    Path(symbol): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let symbol = Symbol::parse(&symbol)?;
    stream.subscribe(symbol.clone(), None)?;

    Ok(Json(json!({ "symbol": symbol, "subscribed": true })))
}

pub async fn unsubscribe(
    State(stream): State<Arc<MarketStream>>,
    Path(symbol): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let symbol = Symbol::parse(&symbol)?;

    let body = match stream.unsubscribe(&symbol)? {
        UnsubscribeOutcome::Removed { callbacks } => {
            json!({ "symbol": symbol, "removed": true, "callbacks": callbacks })
        }
        UnsubscribeOutcome::NotSubscribed => {
            json!({ "symbol": symbol, "removed": false, "callbacks": 0 })
        }
    };
    Ok(Json(body))
}

pub async fn health(State(stream): State<Arc<MarketStream>>) -> impl IntoResponse {
    let feed = stream.feed_status();
    let status = if feed.is_connected() { "healthy" } else { "degraded" };

    Json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "feed": feed,
        "connections": stream.connections().connection_count(),
        "symbols": stream.active_symbols().len(),
    }))
}

pub async fn metrics(State(stream): State<Arc<MarketStream>>) -> ApiResult<String> {
    stream.metrics().encode().map_err(|e| {
        warn!(error = %e, "Failed to encode metrics");
        ApiError(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::feed::MockFeedAdapter;
    use crate::metrics::Metrics;
    use crate::server::router;
    use crate::tick::Tick;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request},
    };
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    fn stream_with(feed: MockFeedAdapter) -> Arc<MarketStream> {
        Arc::new(MarketStream::new(
            &Config::default(),
            Arc::new(feed),
            Arc::new(Metrics::new().unwrap()),
        ))
    }

    fn accepting_feed() -> MockFeedAdapter {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed().returning(|_| Ok(()));
        feed.expect_stop_feed().returning(|_| Ok(()));
        feed
    }

    async fn call(
        stream: &Arc<MarketStream>,
        method: Method,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let response = router(stream.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_symbol_data_reports_no_data_yet() {
        let stream = stream_with(accepting_feed());
        stream.subscribe(Symbol::parse("AAPL").unwrap(), None).unwrap();

        let (status, body) = call(&stream, Method::GET, "/api/market-data/aapl").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no data yet");

        stream.dispatcher().on_tick(Tick {
            last: Some(dec!(150.25)),
            ..Tick::new(Symbol::parse("AAPL").unwrap())
        });

        let (status, body) = call(&stream, Method::GET, "/api/market-data/AAPL").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "AAPL");
        assert_eq!(body["last"], 150.25);
        assert!(body["bid"].is_null());

        let (status, body) = call(&stream, Method::GET, "/api/market-data").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["AAPL"]["last"], 150.25);
    }

    #[tokio::test]
    async fn test_subscription_routes() {
        let stream = stream_with(accepting_feed());

        let (status, body) = call(&stream, Method::POST, "/api/subscriptions/tsla").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "TSLA");

        let (_, body) = call(&stream, Method::GET, "/api/symbols").await;
        assert_eq!(body, json!(["TSLA"]));

        let (status, body) = call(&stream, Method::DELETE, "/api/subscriptions/TSLA").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], true);

        let (status, body) = call(&stream, Method::DELETE, "/api/subscriptions/TSLA").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], false);
    }

    #[tokio::test]
    async fn test_subscribe_errors_map_to_status() {
        let mut feed = MockFeedAdapter::new();
        feed.expect_start_feed()
            .returning(|_| Err(StreamError::FeedUnavailable("gateway down".to_string())));
        let stream = stream_with(feed);

        let (status, _) = call(&stream, Method::POST, "/api/subscriptions/AAPL").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = call(&stream, Method::POST, "/api/subscriptions/AA%20PL").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid symbol"));
    }

    #[tokio::test]
    async fn test_health_reports_feed_state() {
        let stream = stream_with(accepting_feed());
        stream.subscribe(Symbol::parse("AAPL").unwrap(), None).unwrap();

        let (status, body) = call(&stream, Method::GET, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["feed"]["state"], "connecting");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["symbols"], 1);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_dashboard_and_metrics() {
        let stream = stream_with(accepting_feed());

        let response = router(stream.clone())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&page).contains("/ws"));

        let response = router(stream.clone())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("market_stream_ticks_received_total"));
    }
}
