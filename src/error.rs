//! Error taxonomy for the engine and hub API

use thiserror::Error;

/// Errors surfaced to callers of the engine and hub.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("no price available for symbol {symbol}")]
    InvalidSymbol { symbol: String },

    #[error("invalid amount: {message}")]
    InvalidAmount { message: String },

    #[error("duration {duration_sec}s outside {min}..={max}")]
    InvalidDuration { duration_sec: u32, min: u32, max: u32 },

    #[error("trade {trade_id} not found")]
    TradeNotFound { trade_id: u64 },

    #[error("trade {trade_id} does not belong to user {user_id}")]
    NotOwner { trade_id: u64, user_id: u64 },

    #[error("service unavailable: {message}")]
    Unavailable { message: String },

    #[error("trade {trade_id} already registered")]
    DuplicateTrade { trade_id: u64 },

    #[error("trade {trade_id} has already expired")]
    TradeExpired { trade_id: u64 },

    #[error("connection failed: {message}")]
    Connect { message: String },

    #[error("store error: {message}")]
    Store { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl EngineError {
    pub fn invalid_amount<S: Into<String>>(message: S) -> Self {
        Self::InvalidAmount {
            message: message.into(),
        }
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Transient failures are retried; everything else is final for the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Connect { .. } | Self::Store { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
