use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

use crate::error::EngineError;
use crate::execution::{Direction, EngineStats, LedgerOp, OperationKey, Trade, TradeOrder};
use crate::streams::IngestStatsSnapshot;
use crate::types::AppState;
use crate::ws::ws_handler;

/// Header the surrounding auth layer sets with the caller's user id
pub const USER_HEADER: &str = "x-user-id";

/// Routes for the websocket endpoint and the JSON API
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/stats", get(get_stats))
        .route("/api/trades", get(list_trades).post(place_trade))
        .route("/api/trades/{id}", delete(cancel_trade))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

pub fn caller_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .filter(|id| *id != 0)
}

/// Response for stats endpoint
#[derive(Serialize)]
pub struct StatsResponse {
    pub connected: usize,
    pub published: u64,
    pub evicted: u64,
    pub ingest: IngestStatsSnapshot,
    pub engine: EngineStats,
}

/// Body of POST /api/trades
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceTradeRequest {
    pub symbol: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub duration_sec: u32,
    #[serde(default)]
    pub is_demo: bool,
}

#[derive(Serialize)]
pub struct TradesResponse {
    pub trades: Vec<Trade>,
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidSymbol { .. }
        | EngineError::InvalidAmount { .. }
        | EngineError::InvalidDuration { .. } => StatusCode::BAD_REQUEST,
        EngineError::TradeNotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::NotOwner { .. } => StatusCode::FORBIDDEN,
        EngineError::DuplicateTrade { .. } | EngineError::TradeExpired { .. } => StatusCode::CONFLICT,
        EngineError::Unavailable { .. } | EngineError::Connect { .. } | EngineError::Store { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &EngineError) -> (StatusCode, Json<serde_json::Value>) {
    (status_for(err), Json(serde_json::json!({"error": err.to_string()})))
}

fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": format!("missing or invalid {USER_HEADER} header")})),
    )
}

/// GET /api/stats - Hub, ingest and engine counters
pub async fn get_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatsResponse {
        connected: state.hub.connected_count(),
        published: state.hub.published_count(),
        evicted: state.hub.evicted_count(),
        ingest: state.ingest_stats.snapshot(),
        engine: state.engine.stats(),
    })
}

/// POST /api/trades - Debit the stake and open a trade
pub async fn place_trade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PlaceTradeRequest>,
) -> impl IntoResponse {
    let Some(user_id) = caller_id(&headers) else {
        return unauthorized();
    };
    if req.amount <= Decimal::ZERO {
        return error_response(&EngineError::invalid_amount("amount must be positive"));
    }

    let order = TradeOrder {
        id: state.trade_ids.next_id(),
        user_id,
        symbol: req.symbol,
        direction: req.direction,
        amount: req.amount,
        payout_rate: state.payout_rate,
        duration_sec: req.duration_sec,
        is_demo: req.is_demo,
    };

    let debit_key = OperationKey::new(order.id, LedgerOp::Debit);
    if let Err(e) = state
        .ledger
        .debit(user_id, order.amount, order.is_demo, debit_key)
        .await
    {
        return error_response(&e);
    }

    let (trade_id, amount, is_demo) = (order.id, order.amount, order.is_demo);
    match state.engine.place_trade(order).await {
        Ok(trade) => (StatusCode::CREATED, Json(serde_json::json!(trade))),
        Err(e) => {
            warn!("Trade {} rejected for user {}: {}", trade_id, user_id, e);
            let refund_key = OperationKey::new(trade_id, LedgerOp::Refund);
            if let Err(refund_err) = state.ledger.credit(user_id, amount, is_demo, refund_key).await {
                error!(
                    "Failed to return stake of rejected trade {} to user {}: {}",
                    trade_id, user_id, refund_err
                );
            }
            error_response(&e)
        }
    }
}

/// DELETE /api/trades/{id} - Cancel an open trade
pub async fn cancel_trade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(trade_id): Path<u64>,
) -> impl IntoResponse {
    let Some(user_id) = caller_id(&headers) else {
        return unauthorized();
    };

    match state.engine.cancel_trade(trade_id, user_id).await {
        Ok(trade) => (StatusCode::OK, Json(serde_json::json!(trade))),
        Err(e) => error_response(&e),
    }
}

/// GET /api/trades - Open trades of the caller
pub async fn list_trades(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let Some(user_id) = caller_id(&headers) else {
        return unauthorized();
    };

    let trades = state.engine.active_trades_for_user(user_id);
    (StatusCode::OK, Json(serde_json::json!(TradesResponse { trades })))
}
