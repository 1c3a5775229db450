//! Status API route handlers.
//!
//! All endpoints return JSON. State is the agent's shared `Handles`.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use secrecy::{ExposeSecret, SecretString};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::CacheStats;
use crate::engine::state::{CumulativeStats, DailyStats};
use crate::engine::Handles;
use crate::strategy::risk::RiskStatus;
use crate::types::TradeRecord;

/// Shared handler state: the agent's views plus the reset token.
#[derive(Clone)]
pub struct AppState {
    pub handles: Handles,
    pub reset_token: Option<SecretString>,
}

/// Default and maximum number of records `/api/trades` returns.
const DEFAULT_TRADES: usize = 50;
const MAX_TRADES: usize = 200;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub agent: String,
    pub dry_run: bool,
    pub uptime_secs: i64,
    pub cumulative: CumulativeStats,
    pub winrate: Option<f64>,
    pub daily: DailyStats,
    pub losing_streak: u32,
    pub initial_balance: Option<Decimal>,
    pub risk: RiskStatus,
    pub cache: CacheStats,
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let h = &state.handles;
    let cumulative = h.state.cumulative().await;
    Json(StatusResponse {
        agent: h.agent_name.clone(),
        dry_run: h.dry_run,
        uptime_secs: (Utc::now() - h.started_at).num_seconds(),
        cumulative,
        winrate: cumulative.winrate(),
        daily: h.state.daily().await,
        losing_streak: h.state.losing_streak().await,
        initial_balance: h.state.initial_balance(),
        risk: h.risk.status(),
        cache: h.cache.stats(),
    })
}

/// GET /api/trades?limit=N
pub async fn get_trades(
    State(state): State<AppState>,
    Query(query): Query<TradesQuery>,
) -> Json<Vec<TradeRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_TRADES).min(MAX_TRADES);
    Json(state.handles.state.recent_history(limit).await)
}

/// POST /api/circuit-breaker/reset with `Authorization: Bearer <token>`
pub async fn reset_circuit_breaker(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RiskStatus>, StatusCode> {
    let Some(expected) = state.reset_token.as_ref() else {
        return Err(StatusCode::NOT_FOUND);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(expected.expose_secret().as_str()) {
        warn!("Rejected circuit breaker reset with missing or wrong token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    warn!("Circuit breaker reset requested via status API");
    state.handles.risk.reset_circuit_breaker();
    Ok(Json(state.handles.risk.status()))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
