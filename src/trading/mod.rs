//! Trading module - simulated execution
//!
//! Nothing is submitted on-chain; fills are priced by the transaction
//! simulator with randomized latency and slippage.

pub mod simulation;

pub use simulation::{Execution, TxSimulator};
