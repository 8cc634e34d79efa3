//! Admission control for entries and tracking of what it turned away

pub mod checker;
pub mod missed;

pub use checker::{CheckPhase, FailedCheck, SafetyChecker, SafetyOutcome};
pub use missed::{MissedOpportunity, MissedOpportunityTracker};
