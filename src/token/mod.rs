//! Token tracking: per-mint aggregate, metrics, holders and lifecycle

pub mod holders;
pub mod metrics;
pub mod registry;
pub mod state;
#[allow(clippy::module_inception)]
pub mod token;

pub use registry::{SharedToken, TokenRegistry};
pub use state::{StateTransition, TokenState};
pub use token::{Token, TokenSignal, TokenSnapshot, TradeContext};
