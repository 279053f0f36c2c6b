//! Retry queue for settlements whose persistence or ledger write failed
//!
//! Entries are never dropped: a settled trade stays queued until both writes
//! succeed. Each failure doubles the wait, up to a cap.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::trade::Trade;

/// Which write of a settlement still has to happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStage {
    /// `TradeStore::update` has not succeeded yet
    Persist,
    /// Trade is persisted; the ledger credit is outstanding
    Credit,
}

#[derive(Debug, Clone)]
pub struct PendingSettlement {
    pub trade: Trade,
    pub stage: SettlementStage,
    pub attempts: u32,
    pub last_error: String,
    pub next_attempt: Instant,
}

impl PendingSettlement {
    pub fn new(trade: Trade, stage: SettlementStage, error: String, first_delay: Duration) -> Self {
        Self {
            trade,
            stage,
            attempts: 1,
            last_error: error,
            next_attempt: Instant::now() + first_delay,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        now >= self.next_attempt
    }

    /// Record another failure and push the next attempt out: base * 2^attempts, capped
    pub fn prepare_for_retry(&mut self, stage: SettlementStage, error: String, base: Duration, cap: Duration) {
        self.stage = stage;
        self.last_error = error;
        let factor = 2u32.saturating_pow(self.attempts.min(16));
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt = Instant::now() + base.saturating_mul(factor).min(cap);
    }
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: Mutex<VecDeque<PendingSettlement>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: PendingSettlement) {
        self.entries.lock().push_back(entry);
    }

    /// Take every entry that is due, leaving the rest queued in order
    pub fn take_ready(&self, now: Instant) -> Vec<PendingSettlement> {
        let mut entries = self.entries.lock();
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
            entries.drain(..).partition(|e| e.is_ready(now));
        *entries = waiting;
        ready.into_iter().collect()
    }

    pub fn contains(&self, trade_id: u64) -> bool {
        self.entries.lock().iter().any(|e| e.trade.id == trade_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
