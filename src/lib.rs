// Library crate - exports the trading core and its service plumbing

pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod hub;
pub mod shutdown;
pub mod streams;
pub mod supervisor;
pub mod types;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use types::*;
