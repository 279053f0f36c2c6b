//! Expiry scheduler
//!
//! Holds one monotonic deadline per open trade. A ticker firing once per
//! batch window drains every deadline that is due, so wakes missed during a
//! stall land in the first batch after it.

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::shutdown::Shutdown;

/// Trades whose wake fired within one batch window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryBatch {
    /// Monotonic batch number
    pub seq: u64,
    pub trade_ids: Vec<u64>,
}

impl ExpiryBatch {
    pub fn is_empty(&self) -> bool {
        self.trade_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.trade_ids.len()
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    deadlines: BTreeSet<(Instant, u64)>,
    pending: HashMap<u64, Instant>,
}

#[derive(Debug)]
pub struct ExpiryScheduler {
    window: Duration,
    state: Mutex<SchedulerState>,
    next_seq: AtomicU64,
}

impl ExpiryScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(SchedulerState::default()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Schedule a wake at `expires_at` (floored to millis), mapped onto the monotonic clock
    pub fn register(&self, trade_id: u64, expires_at: DateTime<Utc>) -> EngineResult<()> {
        let remaining = (expires_at.trunc_subsecs(3) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.register_at(trade_id, Instant::now() + remaining)
    }

    pub fn register_at(&self, trade_id: u64, deadline: Instant) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.pending.contains_key(&trade_id) {
            return Err(EngineError::DuplicateTrade { trade_id });
        }
        state.pending.insert(trade_id, deadline);
        state.deadlines.insert((deadline, trade_id));
        Ok(())
    }

    /// Best-effort removal. Returns false once the trade was handed to a batch.
    pub fn cancel(&self, trade_id: u64) -> bool {
        let mut state = self.state.lock();
        match state.pending.remove(&trade_id) {
            Some(deadline) => {
                state.deadlines.remove(&(deadline, trade_id));
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, trade_id: u64) -> bool {
        self.state.lock().pending.contains_key(&trade_id)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Remove and return every trade due at `now`, earliest deadline first
    pub fn drain_due(&self, now: Instant) -> Vec<u64> {
        let mut state = self.state.lock();
        let mut due = Vec::new();
        while let Some(&(deadline, trade_id)) = state.deadlines.first() {
            if deadline > now {
                break;
            }
            state.deadlines.pop_first();
            state.pending.remove(&trade_id);
            due.push(trade_id);
        }
        due
    }

    /// Close the current window and start a fresh one
    pub fn next_batch(&self, now: Instant) -> ExpiryBatch {
        ExpiryBatch {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            trade_ids: self.drain_due(now),
        }
    }

    /// Emit one batch per window, empty or not, until shutdown
    pub async fn run(&self, batches: mpsc::Sender<ExpiryBatch>, shutdown: Shutdown) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Expiry scheduler started ({:?} window)", self.window);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let batch = self.next_batch(Instant::now());
            if !batch.is_empty() {
                debug!("Batch {} closed with {} trade(s)", batch.seq, batch.len());
            }
            if batches.send(batch).await.is_err() {
                anyhow::bail!("settlement processor is gone");
            }
        }

        info!("Expiry scheduler stopped, {} wake(s) pending", self.pending_count());
        Ok(())
    }
}
