//! Settlement engine - trade intake, cancellation and batch settlement

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::policy::{exit_price, sample_epsilon, select_winners, Candidate};
use super::retry::{PendingSettlement, RetryQueue, SettlementStage};
use super::scheduler::{ExpiryBatch, ExpiryScheduler};
use super::store::{LedgerOp, LedgerStore, OperationKey, TradeStore};
use super::trade::{Trade, TradeOrder, TradeStatus};
use super::winners::WinnerRecords;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::hub::PriceHub;
use crate::shutdown::Shutdown;
use crate::types::ServerMessage;

/// Counters exposed on the stats endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    pub active_trades: usize,
    pub pending_wakes: usize,
    pub pending_retries: usize,
    pub recent_winners: usize,
    pub batches: u64,
    pub settled: u64,
}

/// Owns the in-memory OPEN trades and turns expiry batches into terminal trades.
pub struct SettlementEngine {
    config: EngineConfig,
    hub: Arc<PriceHub>,
    trades: Arc<dyn TradeStore>,
    ledger: Arc<dyn LedgerStore>,
    scheduler: Arc<ExpiryScheduler>,
    active: RwLock<HashMap<u64, Trade>>,
    winners: Mutex<WinnerRecords>,
    rng: Mutex<StdRng>,
    retries: RetryQueue,
    batches: AtomicU64,
    settled: AtomicU64,
}

impl SettlementEngine {
    pub fn new(
        config: EngineConfig,
        hub: Arc<PriceHub>,
        trades: Arc<dyn TradeStore>,
        ledger: Arc<dyn LedgerStore>,
        scheduler: Arc<ExpiryScheduler>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            winners: Mutex::new(WinnerRecords::new(config.cooldown)),
            rng: Mutex::new(rng),
            config,
            hub,
            trades,
            ledger,
            scheduler,
            active: RwLock::new(HashMap::new()),
            retries: RetryQueue::new(),
            batches: AtomicU64::new(0),
            settled: AtomicU64::new(0),
        }
    }

    /// Seed the cooldown map from winners the store already knows about
    pub async fn warm_start(&self) -> EngineResult<usize> {
        let users = self
            .call("recent winners", self.trades.recent_winners(self.config.cooldown_hours()))
            .await?;
        let count = users.len();
        self.winners.lock().seed(users, Utc::now());
        info!("Cooldown warm start: {} recent winner(s)", count);
        Ok(count)
    }

    /// Open a trade. The caller must already have debited `order.amount`.
    pub async fn place_trade(&self, mut order: TradeOrder) -> EngineResult<Trade> {
        if order.amount <= Decimal::ZERO {
            return Err(EngineError::invalid_amount(format!(
                "amount {} must be positive",
                order.amount
            )));
        }
        if order.payout_rate < Decimal::ZERO {
            return Err(EngineError::invalid_amount(format!(
                "payout rate {} must not be negative",
                order.payout_rate
            )));
        }
        if !self.config.is_valid_duration(order.duration_sec) {
            return Err(EngineError::InvalidDuration {
                duration_sec: order.duration_sec,
                min: self.config.min_duration_sec,
                max: self.config.max_duration_sec,
            });
        }

        order.symbol = order.symbol.trim().to_uppercase();
        let entry = self
            .hub
            .snapshot(&order.symbol)
            .ok_or_else(|| EngineError::InvalidSymbol {
                symbol: order.symbol.clone(),
            })?;

        if self.active.read().contains_key(&order.id) {
            error!("Trade {} is already open, rejecting duplicate", order.id);
            return Err(EngineError::DuplicateTrade { trade_id: order.id });
        }

        let trade = Trade::open(order, entry.price, Utc::now());
        self.call("trade insert", self.trades.insert(&trade)).await?;

        self.active.write().insert(trade.id, trade.clone());
        if let Err(e) = self.scheduler.register(trade.id, trade.expires_at) {
            self.active.write().remove(&trade.id);
            error!("Failed to schedule expiry for trade {}: {}", trade.id, e);
            return Err(e);
        }

        info!(
            "Trade {} opened: user {} {} {} {} @ {} for {}s",
            trade.id,
            trade.user_id,
            trade.direction,
            trade.amount,
            trade.symbol,
            trade.entry_price,
            trade.duration_sec
        );
        Ok(trade)
    }

    /// Cancel an OPEN trade before expiry and refund the stake.
    ///
    /// Repeating the call for a trade that is already canceled succeeds and
    /// returns the trade as stored. A trade that left the active set for
    /// settlement can no longer be canceled.
    pub async fn cancel_trade(&self, trade_id: u64, user_id: u64) -> EngineResult<Trade> {
        let now = Utc::now();
        let taken = {
            let mut active = self.active.write();
            match active.get(&trade_id).map(|t| (t.user_id, t.expires_at)) {
                Some((owner, _)) if owner != user_id => {
                    return Err(EngineError::NotOwner { trade_id, user_id });
                }
                Some((_, expires_at)) if now >= expires_at => {
                    return Err(EngineError::TradeExpired { trade_id });
                }
                Some(_) => active.remove(&trade_id),
                None => None,
            }
        };

        let Some(mut trade) = taken else {
            let stored = self
                .call("trade lookup", self.trades.find(trade_id))
                .await?
                .ok_or(EngineError::TradeNotFound { trade_id })?;
            if stored.user_id != user_id {
                return Err(EngineError::NotOwner { trade_id, user_id });
            }
            return match stored.status {
                TradeStatus::Canceled => {
                    debug!("Cancel of trade {} is a no-op", trade_id);
                    Ok(stored)
                }
                TradeStatus::Won | TradeStatus::Lost => Err(EngineError::TradeExpired { trade_id }),
                // Settlement took it but the terminal write has not landed yet.
                TradeStatus::Open if now >= stored.expires_at => Err(EngineError::TradeExpired { trade_id }),
                TradeStatus::Open => Err(EngineError::unavailable(format!(
                    "trade {trade_id} is being settled"
                ))),
            };
        };

        let exit = self
            .hub
            .snapshot(&trade.symbol)
            .map(|tick| tick.price)
            .unwrap_or(trade.entry_price);
        trade.cancel(exit, now)?;

        if !self.scheduler.cancel(trade_id) {
            debug!("Trade {} already left the scheduler", trade_id);
        }
        info!("Trade {} canceled by user {}", trade_id, user_id);

        self.complete(trade.clone()).await;
        Ok(trade)
    }

    /// In-memory snapshot of a user's OPEN trades
    pub fn active_trades_for_user(&self, user_id: u64) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .active
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.id);
        trades
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_trades: self.active_count(),
            pending_wakes: self.scheduler.pending_count(),
            pending_retries: self.retries.len(),
            recent_winners: self.winners.lock().len(),
            batches: self.batches.load(Ordering::Relaxed),
            settled: self.settled.load(Ordering::Relaxed),
        }
    }

    /// Settle every trade of a batch that is still OPEN in memory.
    /// Returns the trades in their terminal state.
    pub async fn settle_batch(&self, trade_ids: &[u64]) -> Vec<Trade> {
        let trades: Vec<Trade> = {
            let mut active = self.active.write();
            trade_ids.iter().filter_map(|id| active.remove(id)).collect()
        };
        if trades.is_empty() {
            return Vec::new();
        }

        let now = Utc::now();
        let candidates: Vec<Candidate> = trades
            .iter()
            .map(|t| Candidate {
                trade_id: t.id,
                user_id: t.user_id,
                amount: t.amount,
            })
            .collect();

        let mut baselines: HashMap<String, Option<Decimal>> = HashMap::new();
        for trade in &trades {
            baselines
                .entry(trade.symbol.clone())
                .or_insert_with(|| self.hub.snapshot(&trade.symbol).map(|tick| tick.price));
        }

        let (selection, epsilons) = {
            let on_cooldown = self.winners.lock().recent(now);
            let mut rng = self.rng.lock();
            let selection = select_winners(&candidates, &on_cooldown, &self.config.policy, &mut *rng);
            let epsilons: Vec<Decimal> = trades
                .iter()
                .map(|_| sample_epsilon(&self.config.policy, &mut *rng))
                .collect();
            (selection, epsilons)
        };

        let mut settled = Vec::with_capacity(trades.len());
        for (mut trade, epsilon) in trades.into_iter().zip(epsilons) {
            let (won, exit) = match baselines.get(&trade.symbol).copied().flatten() {
                Some(baseline) => {
                    let won = selection.is_winner(trade.user_id);
                    (won, exit_price(baseline, trade.direction, won, epsilon))
                }
                None => {
                    warn!("No price for {}, trade {} resolves as lost", trade.symbol, trade.id);
                    (false, trade.entry_price)
                }
            };
            if let Err(e) = trade.settle(won, exit, now) {
                error!("Dropping trade {} from batch: {}", trade.id, e);
                continue;
            }
            settled.push(trade);
        }

        {
            let mut winners = self.winners.lock();
            for trade in settled.iter().filter(|t| t.status == TradeStatus::Won) {
                winners.record(trade.user_id, now);
            }
        }

        let won = settled.iter().filter(|t| t.status == TradeStatus::Won).count();
        info!(
            "Settling batch of {}: {} won, {} lost",
            settled.len(),
            won,
            settled.len() - won
        );

        join_all(settled.iter().cloned().map(|trade| self.complete(trade))).await;
        settled
    }

    /// Consume scheduler batches until every sender is dropped.
    ///
    /// The processor does not watch the shutdown token: the scheduler stops
    /// first and drops its sender, so the last batch it closed is still settled.
    pub async fn run_batches(&self, batches: &tokio::sync::Mutex<mpsc::Receiver<ExpiryBatch>>) -> anyhow::Result<()> {
        let mut rx = batches.lock().await;
        info!("Settlement processor started");

        while let Some(batch) = rx.recv().await {
            self.process(batch).await;
        }
        info!("Settlement processor stopped, batch channel closed");
        Ok(())
    }

    /// Retry failed settlement writes until shutdown
    pub async fn run_retries(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.drain_retries().await;
        }

        self.drain_retries().await;
        if !self.retries.is_empty() {
            warn!("{} settlement(s) still pending at shutdown", self.retries.len());
        }
        Ok(())
    }

    /// Hourly removal of winner records older than the cooldown
    pub async fn run_winner_sweep(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        let start = Instant::now() + self.config.winner_sweep_interval;
        let mut ticker = tokio::time::interval_at(start, self.config.winner_sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.sweep_winners();
        }
    }

    pub fn sweep_winners(&self) -> usize {
        let removed = self.winners.lock().sweep(Utc::now());
        if removed > 0 {
            debug!("Swept {} stale winner record(s)", removed);
        }
        removed
    }

    /// Retry every due settlement once. Returns how many completed.
    pub async fn drain_retries(&self) -> usize {
        let mut completed = 0;
        for mut entry in self.retries.take_ready(Instant::now()) {
            match self.apply(&entry.trade, entry.stage).await {
                Ok(()) => {
                    info!(
                        "Trade {} settlement completed after {} attempt(s), last error: {}",
                        entry.trade.id,
                        entry.attempts + 1,
                        entry.last_error
                    );
                    completed += 1;
                }
                Err((stage, e)) => {
                    if e.is_transient() {
                        warn!("Retry for trade {} failed: {}", entry.trade.id, e);
                    } else {
                        error!("Retry for trade {} hit a non-transient error: {}", entry.trade.id, e);
                    }
                    entry.prepare_for_retry(
                        stage,
                        e.to_string(),
                        self.config.retry_interval,
                        self.config.retry_backoff_cap,
                    );
                    self.retries.push(entry);
                }
            }
        }
        completed
    }

    async fn process(&self, batch: ExpiryBatch) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        if batch.is_empty() {
            return;
        }
        let settled = self.settle_batch(&batch.trade_ids).await;
        if settled.len() < batch.len() {
            debug!(
                "Batch {}: {} of {} trade(s) were no longer open",
                batch.seq,
                batch.len() - settled.len(),
                batch.len()
            );
        }
    }

    /// Persist, credit and notify a terminal trade; failures go to the retry queue
    async fn complete(&self, trade: Trade) {
        match self.apply(&trade, SettlementStage::Persist).await {
            Ok(()) => {
                self.settled.fetch_add(1, Ordering::Relaxed);
            }
            Err((stage, e)) => {
                if e.is_transient() {
                    warn!("Settlement of trade {} deferred ({:?}): {}", trade.id, stage, e);
                } else {
                    error!("Settlement of trade {} deferred on a non-transient error ({:?}): {}", trade.id, stage, e);
                }
                self.retries.push(PendingSettlement::new(
                    trade,
                    stage,
                    e.to_string(),
                    self.config.retry_interval,
                ));
            }
        }
    }

    /// Run the writes outstanding from `stage` on. The ledger is only touched
    /// after the trade is persisted.
    async fn apply(&self, trade: &Trade, stage: SettlementStage) -> Result<(), (SettlementStage, EngineError)> {
        if stage == SettlementStage::Persist {
            self.call("trade update", self.trades.update(trade))
                .await
                .map_err(|e| (SettlementStage::Persist, e))?;
            let credited = self.credit(trade).await;
            self.notify(trade);
            return credited.map_err(|e| (SettlementStage::Credit, e));
        }
        self.credit(trade)
            .await
            .map_err(|e| (SettlementStage::Credit, e))
    }

    async fn credit(&self, trade: &Trade) -> EngineResult<()> {
        let amount = trade.credit_amount();
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        let op = if trade.status == TradeStatus::Canceled {
            LedgerOp::Refund
        } else {
            LedgerOp::Settle
        };
        self.call(
            "ledger credit",
            self.ledger
                .credit(trade.user_id, amount, trade.is_demo, OperationKey::new(trade.id, op)),
        )
        .await
    }

    fn notify(&self, trade: &Trade) {
        if let Some(result) = trade.result() {
            self.hub
                .notify_user(trade.user_id, ServerMessage::TradeResult(result));
        }
    }

    /// Store call with the configured deadline
    async fn call<T, F>(&self, what: &str, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        match timeout(self.config.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::unavailable(format!(
                "{} timed out after {:?}",
                what, self.config.store_timeout
            ))),
        }
    }
}
