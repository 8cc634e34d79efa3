//! Error types for the trader

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the trader
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Feed errors
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Unknown mint: {0}")]
    UnknownMint(String),

    #[error("Duplicate event for {mint} at {timestamp}")]
    DuplicateEvent { mint: String, timestamp: i64 },

    #[error("Feed connection failed: {0}")]
    FeedConnection(String),

    #[error("Feed disconnected")]
    FeedDisconnected,

    // Token lifecycle errors
    #[error("Illegal token transition for {mint}: {from} -> {to}")]
    IllegalTokenTransition {
        mint: String,
        from: String,
        to: String,
    },

    // Safety errors
    #[error("Safety check failed internally: {0}")]
    SafetyCheck(String),

    // Position management errors
    #[error("Illegal position state: {0}")]
    IllegalPositionState(String),

    #[error("Insufficient balance: {available}SOL available, {required}SOL required")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("Simulated transaction cancelled")]
    SimulatorCancelled,

    // Persistence errors
    #[error("Snapshot persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupt(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Stable kind string used in outbound `error` events
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "Config",
            Error::MalformedEvent(_) => "MalformedEvent",
            Error::UnknownMint(_) => "UnknownMint",
            Error::DuplicateEvent { .. } => "DuplicateEvent",
            Error::FeedConnection(_) | Error::FeedDisconnected => "FeedConnection",
            Error::IllegalTokenTransition { .. } => "IllegalTokenTransition",
            Error::SafetyCheck(_) => "SafetyCheckError",
            Error::IllegalPositionState(_) => "IllegalPositionState",
            Error::InsufficientBalance { .. } => "InsufficientBalance",
            Error::SimulatorCancelled => "SimulatorCancelled",
            Error::PersistenceFailure(_) => "PersistenceFailure",
            Error::SnapshotCorrupt(_) => "SnapshotCorrupt",
            Error::Serialization(_) | Error::Deserialization(_) => "Serialization",
            Error::Io(_) => "Io",
            Error::Internal(_) | Error::Anyhow(_) => "Internal",
        }
    }

    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::FeedConnection(_)
                | Error::FeedDisconnected
                | Error::PersistenceFailure(_)
                | Error::Io(_)
        )
    }

    /// Check if this error must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SnapshotCorrupt(_) | Error::Config(_))
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from bincode errors
impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(Error::SimulatorCancelled.kind(), "SimulatorCancelled");
        assert_eq!(
            Error::InsufficientBalance {
                available: 0.1,
                required: 0.5
            }
            .kind(),
            "InsufficientBalance"
        );
        assert_eq!(Error::SafetyCheck("nan".into()).kind(), "SafetyCheckError");
    }

    #[test]
    fn test_classification() {
        assert!(Error::SnapshotCorrupt("bad magic".into()).is_fatal());
        assert!(!Error::SimulatorCancelled.is_fatal());
        assert!(Error::PersistenceFailure("disk full".into()).is_retryable());
        assert!(!Error::MalformedEvent("missing mint".into()).is_retryable());
    }
}
