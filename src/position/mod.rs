//! Position management module

pub mod manager;
#[allow(clippy::module_inception)]
pub mod position;

pub use manager::{ExitOutcome, OpenRequest, PositionManager};
pub use position::{PartialExit, Position, PositionState};
