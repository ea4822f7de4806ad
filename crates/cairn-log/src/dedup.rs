//! Leaf construction and identity-based deduplication.

use std::sync::Arc;

use cairn_merkle::{LogHasher, hasher_for};
use cairn_store::LeafStore;
use cairn_types::{
    HASH_SIZE, Leaf, LeafInput, LogId, NodeHash, QueueOutcome, QueueStatus, TimeSource,
};
use tracing::debug;

use crate::error::LogError;

type Result<T> = std::result::Result<T, LogError>;

/// Maps a leaf's identity to its canonical leaf.
///
/// The first submission of an identity is queued; later ones get the stored
/// leaf back unchanged, including its index once sequenced. Atomicity per
/// `(log_id, identity_hash)` comes from the store. Leaves are hashed with
/// the hasher recorded in the log's settings.
pub struct Deduplicator {
    store: Arc<dyn LeafStore>,
    clock: Arc<dyn TimeSource>,
}

impl Deduplicator {
    /// Create a deduplicator over `store`.
    pub fn new(store: Arc<dyn LeafStore>, clock: Arc<dyn TimeSource>) -> Self {
        Self { store, clock }
    }

    /// Hash a submitted leaf and resolve its identity.
    ///
    /// The identity defaults to the merkle hash. A caller-supplied identity
    /// must be exactly one hash long.
    pub fn prepare(&self, hasher: &dyn LogHasher, input: LeafInput) -> Result<Leaf> {
        let merkle_hash = hasher.hash_leaf(&input.value);
        let identity_hash = match &input.identity_hash {
            None => merkle_hash,
            Some(bytes) => NodeHash::from_slice(bytes).ok_or_else(|| {
                LogError::InvalidArgument(format!(
                    "identity hash has {} bytes, expected {HASH_SIZE}",
                    bytes.len()
                ))
            })?,
        };

        Ok(Leaf {
            merkle_hash,
            value: input.value,
            extra: input.extra,
            identity_hash,
            index: None,
            queued_at: self.clock.now_nanos(),
            integrated_at: None,
        })
    }

    /// Queue `leaf` or return the existing leaf with its identity.
    pub fn submit(&self, log_id: LogId, leaf: Leaf) -> Result<(Leaf, bool)> {
        let identity = leaf.identity_hash;
        let (canonical, is_new) = self.store.queue_leaf(log_id, leaf)?;
        if is_new {
            debug!(%log_id, %identity, "queued leaf");
        } else {
            debug!(%log_id, %identity, index = ?canonical.index, "duplicate leaf");
        }
        Ok((canonical, is_new))
    }

    /// [`prepare`](Self::prepare) with the log's hasher, then
    /// [`submit`](Self::submit).
    pub fn queue(&self, log_id: LogId, input: LeafInput) -> Result<QueueOutcome> {
        let settings = self.store.log_settings(log_id)?;
        let leaf = self.prepare(hasher_for(settings.hasher).as_ref(), input)?;
        let (leaf, is_new) = self.submit(log_id, leaf)?;
        let status = if is_new {
            QueueStatus::Queued
        } else {
            QueueStatus::AlreadyExists
        };
        Ok(QueueOutcome { leaf, status })
    }
}
