//! Append-only Merkle tree over a log's leaves.
//!
//! The tree stores only *perfect* subtree hashes, addressed by
//! [`NodeId`] `(level, index)`. A node is written exactly once, when the
//! last leaf under it is appended, and never changes afterwards. Roots and
//! proofs for any historical size are assembled from these immutable nodes,
//! so old leaves are never rehashed.
//!
//! - [`MerkleTree`]: the right-edge frontier used by the single writer to
//!   append leaves and collect newly completed nodes.
//! - [`ProofBuilder`]: historical roots, inclusion proofs and consistency
//!   proofs over any [`NodeReader`].
//! - [`verify`]: RFC 9162 proof verification for clients.
//!
//! Hashing is pluggable through [`LogHasher`]; [`Rfc6962Hasher`] is the
//! SHA-256 hasher with `0x00` / `0x01` leaf / node domain separation.

mod error;
mod hasher;
mod node;
mod proof;
mod tree;
pub mod verify;

#[cfg(test)]
mod tests;

pub use error::MerkleError;
pub use cairn_types::HasherKind;
pub use hasher::{
    Blake3Hasher, LEAF_PREFIX, LogHasher, NODE_PREFIX, Rfc6962Hasher, hasher_for,
};
pub use node::{NodeId, compact_range};
pub use proof::ProofBuilder;
pub use tree::{MemoryNodes, MerkleTree, NodeReader};
