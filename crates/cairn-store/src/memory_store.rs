//! In-memory leaf storage backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use cairn_merkle::NodeId;
use cairn_types::{Leaf, LogId, LogSettings, NodeHash, SignedLogRoot, TreeHead};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{IntegrationBatch, LeafStore, Lease, QueuedEntry, validate_resign};

/// Where the leaf holding an identity currently lives.
#[derive(Debug, Clone, Copy)]
enum IdentityRecord {
    Queued(u64),
    Sequenced(u64),
}

/// State of one log.
struct MemoryLog {
    settings: LogSettings,
    head: TreeHead,
    next_queue_seq: u64,
    queue: BTreeMap<u64, Leaf>,
    identities: HashMap<NodeHash, IdentityRecord>,
    leaves: Vec<Leaf>,
    by_merkle_hash: HashMap<NodeHash, Vec<u64>>,
    nodes: HashMap<NodeId, NodeHash>,
    /// `(tree_size, revision)` → root.
    roots: BTreeMap<(u64, u64), SignedLogRoot>,
}

/// In-memory leaf store.
///
/// Each log sits behind its own `RwLock`, so a batch commit is a single write
/// lock and writers to different logs never contend.
#[derive(Default)]
pub struct MemoryLeafStore {
    logs: RwLock<HashMap<LogId, Arc<RwLock<MemoryLog>>>>,
    leases: Mutex<HashMap<LogId, Lease>>,
}

impl MemoryLeafStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, log_id: LogId) -> Result<Arc<RwLock<MemoryLog>>, StoreError> {
        let logs = self.logs.read().expect("lock poisoned");
        logs.get(&log_id)
            .cloned()
            .ok_or(StoreError::LogNotFound(log_id))
    }
}

impl MemoryLog {
    fn find_identity(&self, identity_hash: &NodeHash) -> Option<Leaf> {
        match self.identities.get(identity_hash)? {
            IdentityRecord::Queued(seq) => self.queue.get(seq).cloned(),
            IdentityRecord::Sequenced(index) => self.leaves.get(*index as usize).cloned(),
        }
    }
}

impl LeafStore for MemoryLeafStore {
    fn create_log(
        &self,
        log_id: LogId,
        settings: LogSettings,
        root: &SignedLogRoot,
    ) -> Result<(), StoreError> {
        let mut logs = self.logs.write().expect("lock poisoned");
        if logs.contains_key(&log_id) {
            return Err(StoreError::LogExists(log_id));
        }

        let head = TreeHead {
            size: root.tree_size,
            root_hash: root.root_hash,
            revision: root.revision,
        };
        let mut roots = BTreeMap::new();
        roots.insert((root.tree_size, root.revision), root.clone());

        logs.insert(
            log_id,
            Arc::new(RwLock::new(MemoryLog {
                settings,
                head,
                next_queue_seq: 0,
                queue: BTreeMap::new(),
                identities: HashMap::new(),
                leaves: Vec::new(),
                by_merkle_hash: HashMap::new(),
                nodes: HashMap::new(),
                roots,
            })),
        );
        debug!(%log_id, "created log in memory");
        Ok(())
    }

    fn log_settings(&self, log_id: LogId) -> Result<LogSettings, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(log.settings)
    }

    fn list_logs(&self) -> Result<Vec<LogId>, StoreError> {
        let logs = self.logs.read().expect("lock poisoned");
        let mut ids: Vec<LogId> = logs.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn tree_head(&self, log_id: LogId) -> Result<TreeHead, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(log.head)
    }

    fn queue_leaf(&self, log_id: LogId, leaf: Leaf) -> Result<(Leaf, bool), StoreError> {
        let log = self.log(log_id)?;
        let mut log = log.write().expect("lock poisoned");

        if !log.settings.allow_duplicates {
            if let Some(existing) = log.find_identity(&leaf.identity_hash) {
                return Ok((existing, false));
            }
        }

        let seq = log.next_queue_seq;
        log.next_queue_seq += 1;
        if !log.settings.allow_duplicates {
            log.identities
                .insert(leaf.identity_hash, IdentityRecord::Queued(seq));
        }
        log.queue.insert(seq, leaf.clone());
        Ok((leaf, true))
    }

    fn leaf_by_identity(
        &self,
        log_id: LogId,
        identity_hash: &NodeHash,
    ) -> Result<Option<Leaf>, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(log.find_identity(identity_hash))
    }

    fn queued_count(&self, log_id: LogId) -> Result<u64, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(log.queue.len() as u64)
    }

    fn dequeue_batch(&self, log_id: LogId, limit: usize) -> Result<Vec<QueuedEntry>, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(log
            .queue
            .iter()
            .take(limit)
            .map(|(seq, leaf)| QueuedEntry {
                queue_seq: *seq,
                leaf: leaf.clone(),
            })
            .collect())
    }

    fn commit_batch(&self, log_id: LogId, batch: IntegrationBatch) -> Result<(), StoreError> {
        let log = self.log(log_id)?;
        let mut log = log.write().expect("lock poisoned");

        batch.validate(log_id, &log.head)?;
        if let Some((seq, _)) = batch
            .sequenced
            .iter()
            .find(|(seq, _)| !log.queue.contains_key(seq))
        {
            return Err(StoreError::Conflict {
                log_id,
                reason: format!("queue entry {seq} already consumed"),
            });
        }

        // Validated: nothing below can fail.
        for (seq, leaf) in batch.sequenced {
            let index = log.leaves.len() as u64;
            log.queue.remove(&seq);
            if let Some(record) = log.identities.get_mut(&leaf.identity_hash) {
                if matches!(record, IdentityRecord::Queued(s) if *s == seq) {
                    *record = IdentityRecord::Sequenced(index);
                }
            }
            log.by_merkle_hash
                .entry(leaf.merkle_hash)
                .or_default()
                .push(index);
            log.leaves.push(leaf);
        }
        for (id, hash) in batch.nodes {
            log.nodes.entry(id).or_insert(hash);
        }
        log.roots
            .insert((batch.root.tree_size, batch.root.revision), batch.root);
        log.head = batch.head;

        debug!(%log_id, tree_size = log.head.size, revision = log.head.revision, "committed batch");
        Ok(())
    }

    fn append_signed_root(
        &self,
        log_id: LogId,
        expected_revision: u64,
        root: &SignedLogRoot,
    ) -> Result<(), StoreError> {
        let log = self.log(log_id)?;
        let mut log = log.write().expect("lock poisoned");

        let head = validate_resign(log_id, &log.head, expected_revision, root)?;
        log.roots
            .insert((root.tree_size, root.revision), root.clone());
        log.head = head;
        Ok(())
    }

    fn leaf_at(&self, log_id: LogId, index: u64) -> Result<Option<Leaf>, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(usize::try_from(index)
            .ok()
            .and_then(|i| log.leaves.get(i))
            .cloned())
    }

    fn leaves_in_range(
        &self,
        log_id: LogId,
        start: u64,
        end: u64,
    ) -> Result<Vec<Leaf>, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        let len = log.leaves.len() as u64;
        let (start, end) = (start.min(len) as usize, end.min(len) as usize);
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(log.leaves[start..end].to_vec())
    }

    fn leaf_indices_by_hash(
        &self,
        log_id: LogId,
        merkle_hash: &NodeHash,
    ) -> Result<Vec<u64>, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(log
            .by_merkle_hash
            .get(merkle_hash)
            .cloned()
            .unwrap_or_default())
    }

    fn node(&self, log_id: LogId, id: NodeId) -> Result<Option<NodeHash>, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(log.nodes.get(&id).copied())
    }

    fn latest_signed_root(&self, log_id: LogId) -> Result<SignedLogRoot, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        log.roots
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("log {log_id} has no signed root")))
    }

    fn signed_root_at_size(
        &self,
        log_id: LogId,
        tree_size: u64,
    ) -> Result<Option<SignedLogRoot>, StoreError> {
        let log = self.log(log_id)?;
        let log = log.read().expect("lock poisoned");
        Ok(log
            .roots
            .range((tree_size, 0)..=(tree_size, u64::MAX))
            .next_back()
            .map(|(_, root)| root.clone()))
    }

    fn try_acquire_lease(
        &self,
        log_id: LogId,
        holder: &str,
        now: u64,
        ttl: u64,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().expect("lock poisoned");
        if let Some(lease) = leases.get(&log_id) {
            if !lease.available_to(holder, now) {
                return Ok(false);
            }
        }
        leases.insert(
            log_id,
            Lease {
                holder: holder.to_string(),
                expires_at: now.saturating_add(ttl),
            },
        );
        Ok(true)
    }

    fn release_lease(&self, log_id: LogId, holder: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().expect("lock poisoned");
        if leases.get(&log_id).is_some_and(|l| l.holder == holder) {
            leases.remove(&log_id);
        }
        Ok(())
    }
}
