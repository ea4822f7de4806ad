//! Shared types and identifiers for Cairn.
//!
//! This crate defines the core types used across the Cairn workspace:
//! identifiers ([`LogId`], [`NodeHash`]), leaf records ([`Leaf`],
//! [`LeafInput`], [`QueueOutcome`]), tree state ([`TreeHead`], [`Proof`]),
//! signed commitments ([`LogRoot`], [`SignedLogRoot`]), per-log
//! configuration ([`LogSettings`], [`HasherKind`]) and time sources ([`TimeSource`]).

mod clock;
mod root;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use clock::{FakeTimeSource, SystemTimeSource, TimeSource};
pub use root::{LOG_ROOT_V1, LogRoot, RootEncodingError, SignedLogRoot};

/// Size in bytes of every hash produced by a log hasher.
pub const HASH_SIZE: usize = 32;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Identifier scoping every operation to one log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LogId(i64);

impl LogId {
    /// Create a log identifier.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Return the raw identifier.
    pub const fn get(&self) -> i64 {
        self.0
    }

    /// Key prefix used by ordered stores: big-endian with the sign bit
    /// flipped, so byte order matches numeric order.
    pub fn to_key(&self) -> [u8; 8] {
        ((self.0 as u64) ^ (1 << 63)).to_be_bytes()
    }

    /// Inverse of [`to_key`](Self::to_key).
    pub fn from_key(key: [u8; 8]) -> Self {
        Self((u64::from_be_bytes(key) ^ (1 << 63)) as i64)
    }
}

impl From<i64> for LogId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", self.0)
    }
}

/// A 32-byte Merkle hash: leaf hash, interior node hash, root or identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeHash([u8; HASH_SIZE]);

impl NodeHash {
    /// Parse a hash from a byte slice. Returns `None` on a length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Copy the hash into an owned byte vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; HASH_SIZE]> for NodeHash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({self})")
    }
}

// ---------------------------------------------------------------------------
// Leaves
// ---------------------------------------------------------------------------

/// One entry submitted to a log.
///
/// A leaf is created when it is queued and becomes immutable once the
/// sequencer assigns its `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Domain-separated leaf hash of `value`; this is what enters the tree.
    pub merkle_hash: NodeHash,
    /// The leaf payload.
    pub value: Vec<u8>,
    /// Opaque data stored alongside the leaf but not hashed into the tree.
    pub extra: Vec<u8>,
    /// Deduplication key. Defaults to `merkle_hash`.
    pub identity_hash: NodeHash,
    /// Position in the log, set by the sequencer.
    pub index: Option<u64>,
    /// Unix timestamp (nanoseconds) when the leaf was queued.
    pub queued_at: u64,
    /// Unix timestamp (nanoseconds) when the leaf was integrated.
    pub integrated_at: Option<u64>,
}

impl Leaf {
    /// Whether the sequencer has assigned this leaf an index.
    pub fn is_sequenced(&self) -> bool {
        self.index.is_some()
    }
}

/// A leaf as submitted by a client, before hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafInput {
    /// The leaf payload.
    pub value: Vec<u8>,
    /// Opaque extra data.
    pub extra: Vec<u8>,
    /// Optional caller-chosen identity. Must be [`HASH_SIZE`] bytes if set.
    pub identity_hash: Option<Vec<u8>>,
}

impl LeafInput {
    /// A leaf with the given payload, no extra data and the default identity.
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// Attach extra data.
    pub fn with_extra(mut self, extra: impl Into<Vec<u8>>) -> Self {
        self.extra = extra.into();
        self
    }

    /// Override the identity hash used for deduplication.
    pub fn with_identity(mut self, identity_hash: impl Into<Vec<u8>>) -> Self {
        self.identity_hash = Some(identity_hash.into());
        self
    }
}

/// Whether a queue request created a new leaf or matched an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// The leaf was accepted and is waiting to be sequenced.
    Queued,
    /// A leaf with the same identity already exists; the canonical one is returned.
    AlreadyExists,
}

/// Result of queueing one leaf: the canonical leaf plus its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOutcome {
    /// The newly queued leaf, or the existing leaf with the same identity.
    pub leaf: Leaf,
    /// Whether `leaf` is new.
    pub status: QueueStatus,
}

impl QueueOutcome {
    /// Whether this request created the leaf.
    pub fn is_new(&self) -> bool {
        self.status == QueueStatus::Queued
    }
}

// ---------------------------------------------------------------------------
// Tree state and proofs
// ---------------------------------------------------------------------------

/// The committed state of a log's tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeHead {
    /// Number of integrated leaves.
    pub size: u64,
    /// Root hash over the first `size` leaves.
    pub root_hash: NodeHash,
    /// Incremented on every commit (batch integration or root re-signing).
    pub revision: u64,
}

/// An inclusion audit path or a consistency path.
///
/// Hashes are ordered from the bottom of the tree towards the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// The leaf the proof is for. Zero for consistency proofs.
    pub leaf_index: u64,
    /// Sibling or subtree hashes.
    pub hashes: Vec<NodeHash>,
}

/// Tree hash function, as named in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HasherKind {
    /// SHA-256 with RFC 6962 domain separation.
    #[default]
    Rfc6962,
    /// BLAKE3 with the RFC 6962 prefix scheme.
    Blake3,
}

impl fmt::Display for HasherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rfc6962 => f.write_str("rfc6962"),
            Self::Blake3 => f.write_str("blake3"),
        }
    }
}

/// Per-log configuration fixed at initialization.
///
/// The hasher is part of the log: every leaf hash, node and signed root of
/// the log is computed with it, whatever the process that serves it later
/// is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// Accept every submission as new, even with a repeated identity hash.
    pub allow_duplicates: bool,
    /// Leaf and node hash function of the log.
    pub hasher: HasherKind,
}
