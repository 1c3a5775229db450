//! Status API: a small Axum server exposing the agent's live state.
//!
//! Read-only JSON apart from the manual circuit-breaker reset, which is
//! only mounted when a reset token is configured. Binds loopback unless
//! `status.bind` says otherwise; CORS allows cross-origin reads only.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::StatusConfig;
use routes::AppState;

/// Bind the configured address and serve in a background task.
pub async fn spawn_status_server(state: AppState, config: &StatusConfig) -> Result<()> {
    let ip: IpAddr = config
        .bind
        .parse()
        .with_context(|| format!("Invalid status.bind address: {}", config.bind))?;
    let addr = SocketAddr::new(ip, config.port);
    let reset_enabled = state.reset_token.is_some();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status API on {addr}"))?;
    info!(%addr, reset_enabled, "Status API listening on http://{addr}");
    if !ip.is_loopback() {
        warn!(%addr, "Status API is reachable from the network");
    }

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Status API server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    let mut router = Router::new()
        .route("/health", get(routes::health))
        .route("/api/status", get(routes::get_status))
        .route("/api/trades", get(routes::get_trades));
    if state.reset_token.is_some() {
        router = router.route(
            "/api/circuit-breaker/reset",
            post(routes::reset_circuit_breaker),
        );
    }
    router.layer(cors).with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use std::sync::Arc;
    use secrecy::SecretString;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    use crate::broker::paper::PaperBroker;
    use crate::config::{CacheConfig, RiskConfig};
    use crate::data::MarketDataCache;
    use crate::engine::state::BotState;
    use crate::engine::Handles;
    use crate::strategy::risk::RiskManager;
    use crate::types::{TradeOutcome, TradeRecord};

    const TOKEN: &str = "s3cret-reset";

    fn test_state() -> AppState {
        AppState {
            handles: test_handles(),
            reset_token: Some(SecretString::new(TOKEN.to_string())),
        }
    }

    fn test_handles() -> Handles {
        let broker = Arc::new(PaperBroker::new(1000.0, 1));
        Handles {
            agent_name: "TG-TEST".into(),
            dry_run: true,
            started_at: Utc::now(),
            state: Arc::new(BotState::new()),
            risk: Arc::new(RiskManager::new(RiskConfig::default()).unwrap()),
            cache: Arc::new(MarketDataCache::new(
                broker,
                Arc::new(Semaphore::new(2)),
                &CacheConfig::default(),
            )),
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let state = test_state();
        state
            .handles
            .state
            .record_settlement(&TradeOutcome { won: false, profit: -20.0 })
            .await;
        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["agent"], "TG-TEST");
        assert_eq!(json["cumulative"]["losses"], 1);
        assert_eq!(json["losing_streak"], 1);
        assert_eq!(json["risk"]["circuit_breaker"], false);
        assert_eq!(json["cache"]["entries"], 0);
    }

    #[tokio::test]
    async fn test_trades_endpoint_respects_limit() {
        let state = test_state();
        for i in 0..10 {
            state.handles.state.push_history(TradeRecord::new(i % 2 == 0)).await;
        }
        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/api/trades?limit=3").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 3);
    }

    fn tripped_state() -> AppState {
        let state = test_state();
        for _ in 0..5 {
            state.handles.risk.record_error();
        }
        assert!(state.handles.risk.is_tripped());
        state
    }

    fn reset_request(auth: Option<&str>, origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/circuit-breaker/reset");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_reset_with_token_clears_breaker() {
        let state = tripped_state();
        let app = build_router(state.clone());
        let resp = app
            .oneshot(reset_request(Some(&format!("Bearer {TOKEN}")), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["circuit_breaker"], false);
        assert!(!state.handles.risk.is_tripped());
    }

    #[tokio::test]
    async fn test_cross_origin_reset_without_token_is_refused() {
        let state = tripped_state();
        for auth in [None, Some("Bearer wrong"), Some(TOKEN)] {
            let app = build_router(state.clone());
            let resp = app
                .oneshot(reset_request(auth, Some("http://evil.example")))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "auth {auth:?}");
        }
        assert!(state.handles.risk.is_tripped());
    }

    #[tokio::test]
    async fn test_reset_unmounted_without_token() {
        let state = AppState {
            handles: test_handles(),
            reset_token: None,
        };
        for _ in 0..5 {
            state.handles.risk.record_error();
        }
        let app = build_router(state.clone());
        let resp = app
            .oneshot(reset_request(Some(&format!("Bearer {TOKEN}")), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(state.handles.risk.is_tripped());
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_get_only() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/status")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let methods = resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(methods.contains("GET"));
        assert!(!methods.contains("POST"));
    }

    #[tokio::test]
    async fn test_reset_requires_post() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/circuit-breaker/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
