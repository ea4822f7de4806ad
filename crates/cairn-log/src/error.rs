//! Error types for log operations.

use cairn_merkle::MerkleError;
use cairn_store::StoreError;

/// Coarse classification of a [`LogError`], as reported to callers.
///
/// A repeated identity is not an error: it is reported per leaf as
/// [`QueueStatus::AlreadyExists`](cairn_types::QueueStatus::AlreadyExists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request is malformed: negative or misordered sizes, bad hashes.
    InvalidArgument,
    /// The log or the requested item does not exist.
    NotFound,
    /// The request cannot be served in the log's current state.
    FailedPrecondition,
    /// Storage or signing failure.
    Internal,
}

/// Errors that can occur during log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing log or item.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request not valid for the log's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Leaf storage error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Merkle tree error.
    #[error("merkle error: {0}")]
    Merkle(#[from] MerkleError),

    /// Signing or signature verification failed.
    #[error("signing error: {0}")]
    Signing(String),

    /// An internal invariant does not hold.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LogError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Self::Store(StoreError::LogNotFound(_)) => ErrorKind::NotFound,
            Self::Store(StoreError::LogExists(_)) => ErrorKind::FailedPrecondition,
            Self::Merkle(MerkleError::SizeOutOfRange { .. }) => ErrorKind::FailedPrecondition,
            Self::Merkle(
                MerkleError::IndexOutOfRange { .. } | MerkleError::SizesNotOrdered { .. },
            ) => ErrorKind::InvalidArgument,
            Self::Store(_) | Self::Merkle(_) | Self::Signing(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}
