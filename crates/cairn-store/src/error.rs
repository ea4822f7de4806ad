//! Error types for leaf storage operations.

use cairn_types::LogId;

/// Errors that can occur during leaf storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The log has not been created.
    #[error("log not found: {0}")]
    LogNotFound(LogId),

    /// The log already has state.
    #[error("log already exists: {0}")]
    LogExists(LogId),

    /// A compare-and-swap on the tree revision failed, or a batch refers to
    /// queue entries that were already consumed.
    #[error("conflict on log {log_id}: {reason}")]
    Conflict {
        /// The log being written.
        log_id: LogId,
        /// What did not match.
        reason: String,
    },

    /// A write was rejected because it is internally inconsistent.
    #[error("invalid write to log {log_id}: {reason}")]
    InvalidWrite {
        /// The log being written.
        log_id: LogId,
        /// What was wrong with it.
        reason: String,
    },

    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),

    /// Stored bytes could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Failure injected by [`FaultyStore`](crate::FaultyStore).
    #[error("injected fault: {0}")]
    Injected(&'static str),
}

impl StoreError {
    /// Whether retrying the operation after re-reading state can succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
