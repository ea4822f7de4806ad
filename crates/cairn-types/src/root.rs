//! Log roots and their canonical signed encoding.

use serde::{Deserialize, Serialize};

use crate::{HASH_SIZE, LogId, NodeHash, TreeHead};

/// Version tag of the [`LogRoot`] encoding.
pub const LOG_ROOT_V1: u16 = 1;

/// Length of a V1 encoding: version, size, hash length + hash, timestamp, revision.
const LOG_ROOT_V1_LEN: usize = 2 + 8 + 1 + HASH_SIZE + 8 + 8;

/// Errors decoding a [`LogRoot`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RootEncodingError {
    /// Input is not the length of a V1 root.
    #[error("log root encoding has length {0}, expected 59")]
    Length(usize),

    /// Unknown version tag.
    #[error("unsupported log root version {0}")]
    Version(u16),

    /// The embedded hash length is not [`HASH_SIZE`].
    #[error("log root hash length {0} is not 32")]
    HashLength(u8),
}

/// The payload covered by a root signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRoot {
    /// Number of leaves committed to.
    pub tree_size: u64,
    /// Root hash at `tree_size`.
    pub root_hash: NodeHash,
    /// Unix timestamp (nanoseconds) when the root was signed.
    pub timestamp_nanos: u64,
    /// Tree revision the root was produced at.
    pub revision: u64,
}

impl LogRoot {
    /// A root for the given tree head, stamped with `timestamp_nanos`.
    pub fn from_head(head: &TreeHead, timestamp_nanos: u64) -> Self {
        Self {
            tree_size: head.size,
            root_hash: head.root_hash,
            timestamp_nanos,
            revision: head.revision,
        }
    }

    /// Canonical big-endian encoding:
    /// `version u16 | tree_size u64 | hash_len u8 | hash | timestamp u64 | revision u64`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOG_ROOT_V1_LEN);
        out.extend_from_slice(&LOG_ROOT_V1.to_be_bytes());
        out.extend_from_slice(&self.tree_size.to_be_bytes());
        out.push(HASH_SIZE as u8);
        out.extend_from_slice(self.root_hash.as_bytes());
        out.extend_from_slice(&self.timestamp_nanos.to_be_bytes());
        out.extend_from_slice(&self.revision.to_be_bytes());
        out
    }

    /// Decode a canonical V1 encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, RootEncodingError> {
        if bytes.len() != LOG_ROOT_V1_LEN {
            return Err(RootEncodingError::Length(bytes.len()));
        }

        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if version != LOG_ROOT_V1 {
            return Err(RootEncodingError::Version(version));
        }

        let tree_size = read_u64(&bytes[2..10]);
        let hash_len = bytes[10];
        if hash_len as usize != HASH_SIZE {
            return Err(RootEncodingError::HashLength(hash_len));
        }

        let hash_end = 11 + HASH_SIZE;
        let root_hash = NodeHash::from_slice(&bytes[11..hash_end])
            .ok_or(RootEncodingError::HashLength(hash_len))?;
        let timestamp_nanos = read_u64(&bytes[hash_end..hash_end + 8]);
        let revision = read_u64(&bytes[hash_end + 8..]);

        Ok(Self {
            tree_size,
            root_hash,
            timestamp_nanos,
            revision,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    u64::from_be_bytes(arr)
}

/// A signed, timestamped commitment to a tree size and root hash.
///
/// Signed roots are never overwritten: later roots supersede earlier ones and
/// every published root stays retrievable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLogRoot {
    /// The log this root belongs to.
    pub log_id: LogId,
    /// Number of leaves committed to.
    pub tree_size: u64,
    /// Root hash at `tree_size`.
    pub root_hash: NodeHash,
    /// Unix timestamp (nanoseconds) when the root was signed.
    pub timestamp_nanos: u64,
    /// Tree revision the root was produced at.
    pub revision: u64,
    /// Signature over [`LogRoot::encode`].
    pub signature: Vec<u8>,
}

impl SignedLogRoot {
    /// Attach a signature to a root.
    pub fn new(log_id: LogId, root: LogRoot, signature: Vec<u8>) -> Self {
        Self {
            log_id,
            tree_size: root.tree_size,
            root_hash: root.root_hash,
            timestamp_nanos: root.timestamp_nanos,
            revision: root.revision,
            signature,
        }
    }

    /// The unsigned payload.
    pub fn log_root(&self) -> LogRoot {
        LogRoot {
            tree_size: self.tree_size,
            root_hash: self.root_hash,
            timestamp_nanos: self.timestamp_nanos,
            revision: self.revision,
        }
    }
}
