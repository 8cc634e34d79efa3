//! Entry sizing and exit selection
//!
//! - `sizing` - position size from market cap and volatility
//! - `exit_manager` - layered exit rules, evaluated in priority order

pub mod exit_manager;
pub mod sizing;
pub mod types;

pub use exit_manager::ExitEngine;
pub use sizing::PositionSizer;
pub use types::*;
