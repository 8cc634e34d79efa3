//! Pump.fun Recovery Trader Library
//!
//! Tracks freshly minted bonding-curve tokens through their first pump,
//! screens the recovery after the first drawdown and manages one simulated
//! position with layered exits.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod position;
pub mod price;
pub mod safety;
pub mod stats;
pub mod strategy;
pub mod stream;
pub mod token;
pub mod trading;
pub mod wallet;

// Re-export commonly used types
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
