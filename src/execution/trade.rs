//! Trade record and its state machine

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::TradeResult;

/// Predicted price direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

/// Trade lifecycle: OPEN -> WON | LOST | CANCELED. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Won,
    Lost,
    Canceled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Won => write!(f, "WON"),
            Self::Lost => write!(f, "LOST"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Request to open a trade. The stake must already be debited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOrder {
    pub id: u64,
    pub user_id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub payout_rate: Decimal,
    pub duration_sec: u32,
    pub is_demo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub user_id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub payout_rate: Decimal,
    pub duration_sec: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_demo: bool,
    pub status: TradeStatus,
    pub exit_price: Option<Decimal>,
    pub profit: Decimal,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Open a trade priced at `entry_price`, created at `now` (floored to millis)
    pub fn open(order: TradeOrder, entry_price: Decimal, now: DateTime<Utc>) -> Self {
        let created_at = now.trunc_subsecs(3);
        let expires_at = created_at + Duration::seconds(i64::from(order.duration_sec));
        Self {
            id: order.id,
            user_id: order.user_id,
            symbol: order.symbol,
            direction: order.direction,
            amount: order.amount,
            entry_price,
            payout_rate: order.payout_rate,
            duration_sec: order.duration_sec,
            created_at,
            expires_at,
            is_demo: order.is_demo,
            status: TradeStatus::Open,
            exit_price: None,
            profit: Decimal::ZERO,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Settle at expiry as WON or LOST
    pub fn settle(&mut self, won: bool, exit_price: Decimal, now: DateTime<Utc>) -> EngineResult<()> {
        self.ensure_open()?;
        if won {
            self.status = TradeStatus::Won;
            self.profit = self.amount * self.payout_rate;
        } else {
            self.status = TradeStatus::Lost;
            self.profit = -self.amount;
        }
        self.exit_price = Some(exit_price);
        self.closed_at = Some(now);
        Ok(())
    }

    /// Cancel before expiry; only valid while `now < expires_at`
    pub fn cancel(&mut self, exit_price: Decimal, now: DateTime<Utc>) -> EngineResult<()> {
        self.ensure_open()?;
        if now >= self.expires_at {
            return Err(EngineError::TradeExpired { trade_id: self.id });
        }
        self.status = TradeStatus::Canceled;
        self.profit = Decimal::ZERO;
        self.exit_price = Some(exit_price);
        self.closed_at = Some(now);
        Ok(())
    }

    /// Amount returned to the wallet for the current status
    pub fn credit_amount(&self) -> Decimal {
        match self.status {
            TradeStatus::Won => self.amount + self.profit,
            TradeStatus::Canceled => self.amount,
            TradeStatus::Open | TradeStatus::Lost => Decimal::ZERO,
        }
    }

    pub fn result(&self) -> Option<TradeResult> {
        if !self.status.is_terminal() {
            return None;
        }
        Some(TradeResult {
            trade_id: self.id,
            status: self.status,
            exit_price: self.exit_price.unwrap_or(self.entry_price),
            profit: self.profit,
        })
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.status.is_terminal() {
            tracing::error!(
                "Trade {} already {}, refusing transition",
                self.id,
                self.status
            );
            return Err(EngineError::TradeNotFound { trade_id: self.id });
        }
        Ok(())
    }
}
