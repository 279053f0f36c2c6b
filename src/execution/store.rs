//! Persistence collaborators: trade records and wallet balances
//!
//! The engine only talks to these traits. The in-memory implementations back
//! the simulation server and the tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::trade::{Trade, TradeStatus};
use crate::error::{EngineError, EngineResult};

/// Kind of wallet movement tied to a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerOp {
    Debit,
    Settle,
    Refund,
}

impl std::fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debit => write!(f, "debit"),
            Self::Settle => write!(f, "settle"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

/// Idempotency key for ledger writes: (tradeId, operation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub trade_id: u64,
    pub op: LedgerOp,
}

impl OperationKey {
    pub fn new(trade_id: u64, op: LedgerOp) -> Self {
        Self { trade_id, op }
    }
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.trade_id, self.op)
    }
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn insert(&self, trade: &Trade) -> EngineResult<()>;

    async fn update(&self, trade: &Trade) -> EngineResult<()>;

    async fn find(&self, trade_id: u64) -> EngineResult<Option<Trade>>;

    /// OPEN trades of a user
    async fn find_active(&self, user_id: u64) -> EngineResult<Vec<Trade>>;

    /// Users with a WON trade closed within the last `window_hours`
    async fn recent_winners(&self, window_hours: u32) -> EngineResult<Vec<u64>>;
}

/// Wallet balances. Every write is idempotent per operation key.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn credit(&self, user_id: u64, amount: Decimal, is_demo: bool, key: OperationKey) -> EngineResult<()>;

    async fn debit(&self, user_id: u64, amount: Decimal, is_demo: bool, key: OperationKey) -> EngineResult<()>;

    async fn balance(&self, user_id: u64, is_demo: bool) -> EngineResult<Decimal>;
}

#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    trades: RwLock<HashMap<u64, Trade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trades.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.read().is_empty()
    }

    pub fn get(&self, trade_id: u64) -> Option<Trade> {
        self.trades.read().get(&trade_id).cloned()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn insert(&self, trade: &Trade) -> EngineResult<()> {
        let mut trades = self.trades.write();
        if trades.contains_key(&trade.id) {
            return Err(EngineError::DuplicateTrade { trade_id: trade.id });
        }
        trades.insert(trade.id, trade.clone());
        Ok(())
    }

    async fn update(&self, trade: &Trade) -> EngineResult<()> {
        let mut trades = self.trades.write();
        let stored = trades
            .get_mut(&trade.id)
            .ok_or(EngineError::TradeNotFound { trade_id: trade.id })?;

        if stored.status.is_terminal() {
            // Replays of the same terminal write are fine; anything else is not.
            if stored == trade {
                return Ok(());
            }
            return Err(EngineError::store(format!(
                "trade {} is already {}",
                trade.id, stored.status
            )));
        }
        *stored = trade.clone();
        Ok(())
    }

    async fn find(&self, trade_id: u64) -> EngineResult<Option<Trade>> {
        Ok(self.get(trade_id))
    }

    async fn find_active(&self, user_id: u64) -> EngineResult<Vec<Trade>> {
        let mut active: Vec<Trade> = self
            .trades
            .read()
            .values()
            .filter(|t| t.user_id == user_id && t.status == TradeStatus::Open)
            .cloned()
            .collect();
        active.sort_by_key(|t| t.id);
        Ok(active)
    }

    async fn recent_winners(&self, window_hours: u32) -> EngineResult<Vec<u64>> {
        let cutoff = Utc::now() - Duration::hours(i64::from(window_hours));
        let winners: HashSet<u64> = self
            .trades
            .read()
            .values()
            .filter(|t| t.status == TradeStatus::Won)
            .filter(|t| t.closed_at.map(|c| c >= cutoff).unwrap_or(false))
            .map(|t| t.user_id)
            .collect();
        Ok(winners.into_iter().collect())
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<(u64, bool), Decimal>,
    applied: HashSet<OperationKey>,
}

/// In-memory wallets with separate real and demo balances
#[derive(Debug)]
pub struct MemoryLedger {
    /// Balance a demo wallet starts with
    demo_balance: Decimal,
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new(demo_balance: Decimal) -> Self {
        Self {
            demo_balance,
            state: RwLock::new(LedgerState::default()),
        }
    }

    /// Top up a wallet outside any trade
    pub fn deposit(&self, user_id: u64, amount: Decimal, is_demo: bool) {
        let demo_balance = self.demo_balance;
        let mut state = self.state.write();
        let balance = state
            .balances
            .entry((user_id, is_demo))
            .or_insert_with(|| opening_balance(demo_balance, is_demo));
        *balance += amount;
    }

    pub fn is_applied(&self, key: OperationKey) -> bool {
        self.state.read().applied.contains(&key)
    }

    fn apply(&self, user_id: u64, delta: Decimal, is_demo: bool, key: OperationKey) -> EngineResult<()> {
        let demo_balance = self.demo_balance;
        let mut state = self.state.write();
        if state.applied.contains(&key) {
            return Ok(());
        }
        let balance = state
            .balances
            .entry((user_id, is_demo))
            .or_insert_with(|| opening_balance(demo_balance, is_demo));
        if *balance + delta < Decimal::ZERO {
            return Err(EngineError::invalid_amount(format!(
                "insufficient balance for user {user_id}"
            )));
        }
        *balance += delta;
        state.applied.insert(key);
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(Decimal::ZERO)
    }
}

fn opening_balance(demo_balance: Decimal, is_demo: bool) -> Decimal {
    if is_demo {
        demo_balance
    } else {
        Decimal::ZERO
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn credit(&self, user_id: u64, amount: Decimal, is_demo: bool, key: OperationKey) -> EngineResult<()> {
        if amount < Decimal::ZERO {
            return Err(EngineError::invalid_amount("credit must not be negative"));
        }
        self.apply(user_id, amount, is_demo, key)
    }

    async fn debit(&self, user_id: u64, amount: Decimal, is_demo: bool, key: OperationKey) -> EngineResult<()> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::invalid_amount("debit must be positive"));
        }
        self.apply(user_id, -amount, is_demo, key)
    }

    async fn balance(&self, user_id: u64, is_demo: bool) -> EngineResult<Decimal> {
        let state = self.state.read();
        Ok(state
            .balances
            .get(&(user_id, is_demo))
            .copied()
            .unwrap_or_else(|| opening_balance(self.demo_balance, is_demo)))
    }
}
