//! Upstream market-data streams
//!
//! The ingestor keeps a single combined-stream connection to the exchange,
//! decodes ticker frames into `PriceTick`s and hands them to the hub
//! dispatcher through a bounded accept slot.

mod backoff;
mod binance;
mod ingestor;

pub use backoff::Backoff;
pub use binance::{decode_frame, Decoded, TICKER_EVENT};
pub use ingestor::{spawn_dispatcher, IngestStats, IngestStatsSnapshot, TickIngestor};
