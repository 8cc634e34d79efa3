//! Simulated wallet

pub mod manager;

pub use manager::{Wallet, WalletState};
