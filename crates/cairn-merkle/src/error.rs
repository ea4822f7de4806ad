//! Error types for the Merkle crate.

use crate::node::NodeId;

/// Errors that can occur while building or checking tree state.
#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    /// A requested size lies beyond the tree.
    #[error("tree size {requested} exceeds current size {current}")]
    SizeOutOfRange {
        /// Size asked for.
        requested: u64,
        /// Size of the tree.
        current: u64,
    },

    /// A leaf index is not below the tree size.
    #[error("leaf index {index} out of range for tree size {size}")]
    IndexOutOfRange {
        /// The leaf index.
        index: u64,
        /// The tree size.
        size: u64,
    },

    /// Consistency between sizes that are not ordered.
    #[error("first size {first} is greater than second size {second}")]
    SizesNotOrdered {
        /// The earlier tree size.
        first: u64,
        /// The later tree size.
        second: u64,
    },

    /// A perfect subtree that should exist was not found.
    #[error("missing tree node {0}")]
    MissingNode(NodeId),

    /// A proof failed verification.
    #[error("proof verification failed: {0}")]
    Verification(&'static str),

    /// Node storage backend error.
    #[error("node storage error: {0}")]
    Storage(String),
}
