//! Analytics, snapshots and log files

pub mod analytics;
pub mod log_rotation;
pub mod persistence;

pub use analytics::{Analytics, AnalyticsSnapshot, Counter, Latency};
pub use persistence::{PositionsSnapshot, Snapshot, SnapshotHandle, SnapshotStore, SnapshotWriter};
