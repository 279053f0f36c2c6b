use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::{LedgerStore, SettlementEngine, TradeStatus};
use crate::hub::PriceHub;
use crate::shutdown::Shutdown;
use crate::streams::IngestStats;

/// Normalized price observation for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub event_time: DateTime<Utc>,
}

impl PriceTick {
    /// Build a tick, rejecting non-positive prices and negative volume
    pub fn new(
        symbol: impl Into<String>,
        price: Decimal,
        volume: Decimal,
        event_time: DateTime<Utc>,
    ) -> EngineResult<Self> {
        let symbol = symbol.into();
        if symbol.is_empty() {
            return Err(EngineError::InvalidSymbol { symbol });
        }
        if price <= Decimal::ZERO {
            return Err(EngineError::invalid_amount(format!("price {price} must be positive")));
        }
        if volume < Decimal::ZERO {
            return Err(EngineError::invalid_amount(format!("volume {volume} must not be negative")));
        }
        Ok(Self {
            symbol,
            price,
            volume,
            event_time,
        })
    }

    pub fn to_update(&self) -> PriceUpdate {
        PriceUpdate {
            symbol: self.symbol.clone(),
            price: self.price,
            ts: self.event_time.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: Decimal,
    pub ts: i64,
}

/// Terminal outcome pushed to a trade's owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    #[serde(rename = "tradeId")]
    pub trade_id: u64,
    pub status: TradeStatus,
    #[serde(rename = "exitPrice")]
    pub exit_price: Decimal,
    pub profit: Decimal,
}

/// Server -> client frame: `{type, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    PriceUpdate(PriceUpdate),
    TradeResult(TradeResult),
    Heartbeat { timestamp: i64 },
    Error { message: String },
}

/// Raw client -> server frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
}

impl ClientMessage {
    /// Validate the action and symbol into a command
    pub fn into_command(self) -> Result<ClientCommand, String> {
        let symbol = match self.symbol {
            Some(s) if !s.trim().is_empty() => s.trim().to_uppercase(),
            _ => return Err(format!("action '{}' requires a symbol", self.action)),
        };
        match self.action.as_str() {
            "subscribe" => Ok(ClientCommand::Subscribe(symbol)),
            "unsubscribe" => Ok(ClientCommand::Unsubscribe(symbol)),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Hands out trade ids for the HTTP layer
#[derive(Debug)]
pub struct TradeIdGenerator {
    next: AtomicU64,
}

impl TradeIdGenerator {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Seed from the wall clock so ids do not repeat across restarts
    pub fn from_clock() -> Self {
        let millis = Utc::now().timestamp_millis().max(1) as u64;
        Self::starting_at(millis.saturating_mul(1000))
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Shared application state
pub struct AppState {
    pub hub: Arc<PriceHub>,
    pub engine: Arc<SettlementEngine>,
    pub ledger: Arc<dyn LedgerStore>,
    pub ingest_stats: Arc<IngestStats>,
    pub session_config: SessionConfig,
    pub trade_ids: TradeIdGenerator,
    pub payout_rate: Decimal,
    pub shutdown: Shutdown,
}
