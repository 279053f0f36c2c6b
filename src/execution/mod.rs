//! Trade execution: intake, expiry scheduling and batch settlement
//!
//! Trades enter through `SettlementEngine::place_trade`, get a wake in the
//! `ExpiryScheduler`, and are settled in batches by the payout policy.

mod engine;
mod policy;
mod retry;
mod scheduler;
mod store;
mod trade;
mod winners;

pub use engine::{EngineStats, SettlementEngine};
pub use policy::{exit_price, sample_epsilon, select_winners, Candidate, Selection, WinnerTargets};
pub use retry::{PendingSettlement, RetryQueue, SettlementStage};
pub use scheduler::{ExpiryBatch, ExpiryScheduler};
pub use store::{LedgerOp, LedgerStore, MemoryLedger, MemoryTradeStore, OperationKey, TradeStore};
pub use trade::{Direction, Trade, TradeOrder, TradeStatus};
pub use winners::WinnerRecords;
