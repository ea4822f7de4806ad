//! Domain-separated leaf and node hashing.

use std::sync::Arc;

use cairn_types::{HasherKind, NodeHash};
use sha2::{Digest, Sha256};

/// Prefix byte for leaf hashes.
pub const LEAF_PREFIX: u8 = 0x00;

/// Prefix byte for interior node hashes.
pub const NODE_PREFIX: u8 = 0x01;

/// Hash functions used to build a log's tree.
///
/// Leaf and node hashes must be domain-separated so that a leaf can never be
/// confused with an interior node.
pub trait LogHasher: Send + Sync {
    /// Root of the empty tree.
    fn empty_root(&self) -> NodeHash;

    /// Hash of a leaf's payload.
    fn hash_leaf(&self, data: &[u8]) -> NodeHash;

    /// Hash of an interior node from its two children.
    fn hash_children(&self, left: &NodeHash, right: &NodeHash) -> NodeHash;
}

/// RFC 6962 hasher: SHA-256 with `0x00` / `0x01` prefixes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc6962Hasher;

impl LogHasher for Rfc6962Hasher {
    fn empty_root(&self) -> NodeHash {
        let digest: [u8; 32] = Sha256::digest(b"").into();
        NodeHash::from(digest)
    }

    fn hash_leaf(&self, data: &[u8]) -> NodeHash {
        let mut hasher = Sha256::new();
        hasher.update([LEAF_PREFIX]);
        hasher.update(data);
        let digest: [u8; 32] = hasher.finalize().into();
        NodeHash::from(digest)
    }

    fn hash_children(&self, left: &NodeHash, right: &NodeHash) -> NodeHash {
        let mut hasher = Sha256::new();
        hasher.update([NODE_PREFIX]);
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        NodeHash::from(digest)
    }
}

/// BLAKE3 with the same prefix scheme as [`Rfc6962Hasher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl LogHasher for Blake3Hasher {
    fn empty_root(&self) -> NodeHash {
        NodeHash::from(*blake3::hash(b"").as_bytes())
    }

    fn hash_leaf(&self, data: &[u8]) -> NodeHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[LEAF_PREFIX]);
        hasher.update(data);
        let digest: [u8; 32] = hasher.finalize().into();
        NodeHash::from(digest)
    }

    fn hash_children(&self, left: &NodeHash, right: &NodeHash) -> NodeHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[NODE_PREFIX]);
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        NodeHash::from(digest)
    }
}

/// Instantiate the hasher a log was initialized with.
pub fn hasher_for(kind: HasherKind) -> Arc<dyn LogHasher> {
    match kind {
        HasherKind::Rfc6962 => Arc::new(Rfc6962Hasher),
        HasherKind::Blake3 => Arc::new(Blake3Hasher),
    }
}
