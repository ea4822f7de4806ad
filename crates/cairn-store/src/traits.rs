//! Core trait and types for leaf storage.

use cairn_merkle::{MerkleError, NodeId, NodeReader};
use cairn_types::{Leaf, LogId, LogSettings, NodeHash, SignedLogRoot, TreeHead};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A leaf waiting in a log's sequencing queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEntry {
    /// Position in the queue. Lower sequences are integrated first.
    pub queue_seq: u64,
    /// The queued leaf, with no index assigned yet.
    pub leaf: Leaf,
}

/// Everything written by one sequencing pass.
///
/// Applied as a single all-or-nothing write. The store rejects the batch with
/// [`StoreError::Conflict`] if the log's revision is no longer
/// `expected_revision` or any of the queue entries is gone.
#[derive(Debug, Clone)]
pub struct IntegrationBatch {
    /// Revision the batch was built against.
    pub expected_revision: u64,
    /// The tree head after the batch.
    pub head: TreeHead,
    /// Consumed queue entries with their leaves, now carrying an index and an
    /// integration time. Ordered by index.
    pub sequenced: Vec<(u64, Leaf)>,
    /// Perfect subtree nodes completed by the batch.
    pub nodes: Vec<(NodeId, NodeHash)>,
    /// Signed root over `head`.
    pub root: SignedLogRoot,
}

impl IntegrationBatch {
    /// Check the batch against the committed head it is meant to extend.
    pub fn validate(&self, log_id: LogId, current: &TreeHead) -> Result<(), StoreError> {
        if current.revision != self.expected_revision {
            return Err(StoreError::Conflict {
                log_id,
                reason: format!(
                    "expected revision {}, found {}",
                    self.expected_revision, current.revision
                ),
            });
        }

        let invalid = |reason: String| StoreError::InvalidWrite { log_id, reason };
        if self.head.revision != self.expected_revision + 1 {
            return Err(invalid(format!(
                "new revision {} does not follow {}",
                self.head.revision, self.expected_revision
            )));
        }
        if self.head.size != current.size + self.sequenced.len() as u64 {
            return Err(invalid(format!(
                "size {} after {} leaves on top of {}",
                self.head.size,
                self.sequenced.len(),
                current.size
            )));
        }
        for (offset, (_, leaf)) in self.sequenced.iter().enumerate() {
            let expected = current.size + offset as u64;
            if leaf.index != Some(expected) {
                return Err(invalid(format!(
                    "leaf at offset {offset} has index {:?}, expected {expected}",
                    leaf.index
                )));
            }
        }
        // A node is completed by the batch that reaches its right boundary.
        if let Some((id, _)) = self
            .nodes
            .iter()
            .find(|(id, _)| id.end() <= current.size || id.end() > self.head.size)
        {
            return Err(invalid(format!(
                "node {id} is not completed between sizes {} and {}",
                current.size, self.head.size
            )));
        }
        check_root_matches(log_id, &self.head, &self.root)
    }
}

/// Check a re-signed root against the committed head it replaces.
pub(crate) fn validate_resign(
    log_id: LogId,
    current: &TreeHead,
    expected_revision: u64,
    root: &SignedLogRoot,
) -> Result<TreeHead, StoreError> {
    if current.revision != expected_revision {
        return Err(StoreError::Conflict {
            log_id,
            reason: format!(
                "expected revision {expected_revision}, found {}",
                current.revision
            ),
        });
    }

    let head = TreeHead {
        size: current.size,
        root_hash: current.root_hash,
        revision: expected_revision + 1,
    };
    check_root_matches(log_id, &head, root)?;
    Ok(head)
}

fn check_root_matches(
    log_id: LogId,
    head: &TreeHead,
    root: &SignedLogRoot,
) -> Result<(), StoreError> {
    if root.log_id != log_id
        || root.tree_size != head.size
        || root.root_hash != head.root_hash
        || root.revision != head.revision
    {
        return Err(StoreError::InvalidWrite {
            log_id,
            reason: format!(
                "signed root (size {}, revision {}) does not describe head (size {}, revision {})",
                root.tree_size, root.revision, head.size, head.revision
            ),
        });
    }
    Ok(())
}

/// Holder of a log's sequencing lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Who holds the lease.
    pub holder: String,
    /// Unix time (nanoseconds) after which the lease may be taken over.
    pub expires_at: u64,
}

impl Lease {
    /// Whether `holder` may take this lease at `now`.
    pub fn available_to(&self, holder: &str, now: u64) -> bool {
        self.holder == holder || self.expires_at <= now
    }
}

/// Durable keyed storage for a set of logs.
///
/// Holds queued and sequenced leaves, Merkle nodes, tree heads, signed roots
/// and sequencing leases. It has no tree logic of its own.
///
/// All implementations must be `Send + Sync` for use across async tasks.
pub trait LeafStore: Send + Sync {
    /// Create a log with an empty tree whose head is described by `root`.
    ///
    /// Fails with [`StoreError::LogExists`] if the log already has state.
    fn create_log(
        &self,
        log_id: LogId,
        settings: LogSettings,
        root: &SignedLogRoot,
    ) -> Result<(), StoreError>;

    /// Settings the log was created with.
    fn log_settings(&self, log_id: LogId) -> Result<LogSettings, StoreError>;

    /// All logs in the store, in ascending id order.
    fn list_logs(&self) -> Result<Vec<LogId>, StoreError>;

    /// The committed tree head.
    fn tree_head(&self, log_id: LogId) -> Result<TreeHead, StoreError>;

    /// Queue `leaf` unless a leaf with the same identity is already queued
    /// or sequenced.
    ///
    /// Returns the canonical leaf and whether it was newly queued. Atomic per
    /// `(log_id, identity_hash)`. In a log that allows duplicates every leaf
    /// is queued.
    fn queue_leaf(&self, log_id: LogId, leaf: Leaf) -> Result<(Leaf, bool), StoreError>;

    /// The queued or sequenced leaf with the given identity, if any.
    fn leaf_by_identity(
        &self,
        log_id: LogId,
        identity_hash: &NodeHash,
    ) -> Result<Option<Leaf>, StoreError>;

    /// Number of leaves waiting to be sequenced.
    fn queued_count(&self, log_id: LogId) -> Result<u64, StoreError>;

    /// Up to `limit` queued leaves in queue order. Does not remove them.
    fn dequeue_batch(&self, log_id: LogId, limit: usize) -> Result<Vec<QueuedEntry>, StoreError>;

    /// Atomically apply a sequencing pass.
    fn commit_batch(&self, log_id: LogId, batch: IntegrationBatch) -> Result<(), StoreError>;

    /// Record a fresh signature over the unchanged tree, bumping the revision.
    ///
    /// `root.revision` must be `expected_revision + 1` and `root` must match
    /// the committed head.
    fn append_signed_root(
        &self,
        log_id: LogId,
        expected_revision: u64,
        root: &SignedLogRoot,
    ) -> Result<(), StoreError>;

    /// The sequenced leaf at `index`.
    fn leaf_at(&self, log_id: LogId, index: u64) -> Result<Option<Leaf>, StoreError>;

    /// Sequenced leaves in `[start, end)`, truncated at the tree size.
    fn leaves_in_range(&self, log_id: LogId, start: u64, end: u64)
    -> Result<Vec<Leaf>, StoreError>;

    /// Indices of sequenced leaves whose merkle hash is `merkle_hash`,
    /// ascending.
    fn leaf_indices_by_hash(
        &self,
        log_id: LogId,
        merkle_hash: &NodeHash,
    ) -> Result<Vec<u64>, StoreError>;

    /// A stored perfect subtree hash.
    fn node(&self, log_id: LogId, id: NodeId) -> Result<Option<NodeHash>, StoreError>;

    /// The signed root with the greatest `(tree_size, revision)`.
    fn latest_signed_root(&self, log_id: LogId) -> Result<SignedLogRoot, StoreError>;

    /// The most recent signed root for exactly `tree_size` leaves.
    fn signed_root_at_size(
        &self,
        log_id: LogId,
        tree_size: u64,
    ) -> Result<Option<SignedLogRoot>, StoreError>;

    /// Take or renew the sequencing lease for `holder` until `now + ttl`.
    ///
    /// Returns `false` if another holder has an unexpired lease.
    fn try_acquire_lease(
        &self,
        log_id: LogId,
        holder: &str,
        now: u64,
        ttl: u64,
    ) -> Result<bool, StoreError>;

    /// Drop the lease if `holder` holds it.
    fn release_lease(&self, log_id: LogId, holder: &str) -> Result<(), StoreError>;
}

/// [`NodeReader`] over one log's nodes in a [`LeafStore`].
pub struct LogNodes<'a> {
    store: &'a dyn LeafStore,
    log_id: LogId,
}

impl<'a> LogNodes<'a> {
    /// Read nodes of `log_id` from `store`.
    pub fn new(store: &'a dyn LeafStore, log_id: LogId) -> Self {
        Self { store, log_id }
    }
}

impl NodeReader for LogNodes<'_> {
    fn read_node(&self, id: NodeId) -> Result<Option<NodeHash>, MerkleError> {
        self.store
            .node(self.log_id, id)
            .map_err(|e| MerkleError::Storage(e.to_string()))
    }
}
