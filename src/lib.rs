//! Smart-money liquidity analysis core.
//!
//! Pure analysis over candle series (structure, zones, liquidity, sweeps,
//! multi-timeframe setups, scoring and sizing) plus the small amount of state
//! needed to manage an open position across runs.

pub mod candles;
pub mod config;
pub mod error;
pub mod indicators;
pub mod liquidity;
pub mod mtf;
pub mod position_manager;
pub mod range_breakout;
pub mod scan;
pub mod signal;
pub mod sizing;
pub mod state_store;
pub mod structure;
pub mod tools;
pub mod types;
pub mod zones;

pub use candles::{CandleSource, MemoryCandleSource};
pub use config::StrategyConfig;
pub use error::{AnalysisError, ErrorKind, ErrorReport};
pub use position_manager::PositionTracker;
pub use state_store::{JsonFileStore, MemoryStore, StateStore};
pub use types::{Candle, Direction, Interval};
