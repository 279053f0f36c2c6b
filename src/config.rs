//! Runtime configuration for ingestion, sessions and settlement

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Upstream tick feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Combined-stream base URL (e.g. "wss://stream.binance.com:9443")
    pub upstream_url: String,

    /// Symbols to request ticker streams for
    pub symbols: Vec<String>,

    /// Handshake must complete within this window
    pub connect_timeout: Duration,

    /// Read deadline per frame
    pub read_timeout: Duration,

    /// How long the ingestor waits for the hub to accept a tick
    pub publish_timeout: Duration,

    /// Capacity of the ingestor -> hub dispatcher slot
    pub publish_capacity: usize,

    /// Reconnect backoff base delay
    pub backoff_base: Duration,

    /// Reconnect backoff ceiling
    pub backoff_cap: Duration,

    /// Fractional jitter applied to every backoff delay (0.2 = ±20%)
    pub backoff_jitter: f64,

    /// Stable reception needed before the backoff resets
    pub backoff_reset_after: Duration,

    /// Log one invalid frame per this many occurrences
    pub invalid_log_every: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upstream_url: "wss://stream.binance.com:9443".to_string(),
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_millis(100),
            publish_capacity: 1024,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            backoff_jitter: 0.2,
            backoff_reset_after: Duration::from_secs(60),
            invalid_log_every: 100,
        }
    }
}

impl IngestConfig {
    /// Combined-stream URL for the configured symbols
    pub fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect();
        format!(
            "{}/stream?streams={}",
            self.upstream_url.trim_end_matches('/'),
            streams.join("/")
        )
    }
}

/// Client websocket session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Outbound queue capacity (messages)
    pub queue_capacity: usize,

    /// Ping + heartbeat frame interval
    pub ping_interval: Duration,

    /// Session is terminated when no pong arrives within this window
    pub pong_grace: Duration,

    /// Deadline per socket write
    pub write_timeout: Duration,

    /// Max time spent draining the queue on shutdown
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval: Duration::from_secs(30),
            pong_grace: Duration::from_secs(45),
            write_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Payout-selection policy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Share of a batch that wins
    pub winner_ratio: Decimal,

    /// Share of winners drawn from the lower half by amount
    pub small_winner_ratio: Decimal,

    /// Share of winners that may be repeat winners inside the cooldown
    pub repeat_winner_ratio: Decimal,

    /// Lower bound of the exit-price nudge
    pub epsilon_min: Decimal,

    /// Upper bound of the exit-price nudge
    pub epsilon_max: Decimal,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            winner_ratio: Decimal::new(20, 2),
            small_winner_ratio: Decimal::new(75, 2),
            repeat_winner_ratio: Decimal::new(2, 2),
            epsilon_min: Decimal::new(1, 4),
            epsilon_max: Decimal::new(11, 4),
        }
    }
}

/// Settlement engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Shortest allowed trade
    pub min_duration_sec: u32,

    /// Longest allowed trade
    pub max_duration_sec: u32,

    /// Trades expiring within one window settle together
    pub batch_window: Duration,

    /// Capacity of the scheduler -> settlement batch channel
    pub batch_capacity: usize,

    /// Deadline per TradeStore / LedgerStore call
    pub store_timeout: Duration,

    /// A user who won within this window is on cooldown
    pub cooldown: Duration,

    /// How often stale winner records are dropped
    pub winner_sweep_interval: Duration,

    /// How often the settlement retry queue is drained
    pub retry_interval: Duration,

    /// Retry backoff ceiling for a single pending settlement
    pub retry_backoff_cap: Duration,

    /// PRNG seed (random when unset)
    pub seed: Option<u64>,

    pub policy: PolicyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_duration_sec: 30,
            max_duration_sec: 3600,
            batch_window: Duration::from_secs(1),
            batch_capacity: 16,
            store_timeout: Duration::from_secs(5),
            cooldown: Duration::from_secs(24 * 3600),
            winner_sweep_interval: Duration::from_secs(3600),
            retry_interval: Duration::from_secs(1),
            retry_backoff_cap: Duration::from_secs(60),
            seed: None,
            policy: PolicyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Check if a duration is accepted for new trades
    pub fn is_valid_duration(&self, duration_sec: u32) -> bool {
        (self.min_duration_sec..=self.max_duration_sec).contains(&duration_sec)
    }

    /// Cooldown expressed in whole hours, as TradeStore expects
    pub fn cooldown_hours(&self) -> u32 {
        (self.cooldown.as_secs() / 3600) as u32
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub ingest: IngestConfig,
    pub session: SessionConfig,
    pub engine: EngineConfig,
}

impl Config {
    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> EngineResult<()> {
        if self.ingest.symbols.is_empty() {
            return Err(EngineError::config("upstream symbol list is empty"));
        }
        if self.ingest.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(EngineError::config("symbol list contains an empty entry"));
        }
        if self.session.queue_capacity == 0 {
            return Err(EngineError::config("session queue capacity must be positive"));
        }
        if self.engine.min_duration_sec > self.engine.max_duration_sec {
            return Err(EngineError::config("min trade duration exceeds max"));
        }
        if self.engine.batch_window.is_zero() {
            return Err(EngineError::config("batch window must be positive"));
        }
        let policy = &self.engine.policy;
        if policy.epsilon_min <= Decimal::ZERO || policy.epsilon_min > policy.epsilon_max {
            return Err(EngineError::config("epsilon range is invalid"));
        }
        Ok(())
    }
}
