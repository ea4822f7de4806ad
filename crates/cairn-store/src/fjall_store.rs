//! [`LeafStore`] implementation wrapping Fjall keyspaces.
//!
//! Keys start with the 8-byte big-endian [`LogId`] so every per-log scan is
//! a prefix scan, and numeric suffixes are big-endian so key order matches
//! numeric order:
//!
//! - `logs`: log → [`LogRecord`] (settings and committed head)
//! - `queue`: log ++ queue sequence → queued [`Leaf`]
//! - `identities`: log ++ identity hash → [`IdentityRecord`]
//! - `leaves`: log ++ index → sequenced [`Leaf`]
//! - `hashes`: log ++ merkle hash ++ index → empty
//! - `nodes`: log ++ level ++ index → node hash
//! - `roots`: log ++ tree size ++ revision → [`SignedLogRoot`]
//! - `leases`: log → [`Lease`]

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use cairn_merkle::NodeId;
use cairn_types::{Leaf, LogId, LogSettings, NodeHash, SignedLogRoot, TreeHead};
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::traits::{IntegrationBatch, LeafStore, Lease, QueuedEntry, validate_resign};

type Result<T> = std::result::Result<T, StoreError>;

/// Number of lock stripes serializing submissions by identity.
const IDENTITY_STRIPES: usize = 64;

/// Per-log metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    settings: LogSettings,
    head: TreeHead,
}

/// Where the leaf holding an identity currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum IdentityRecord {
    Queued(u64),
    Sequenced(u64),
}

/// Leaf store backed by Fjall.
///
/// Multi-key writes (queueing a leaf, committing a batch, creating a log)
/// go through a single Fjall write batch, so a crash leaves either all of a
/// write or none of it.
pub struct FjallLeafStore {
    db: Database,
    logs: Keyspace,
    queue: Keyspace,
    identities: Keyspace,
    leaves: Keyspace,
    hashes: Keyspace,
    nodes: Keyspace,
    roots: Keyspace,
    leases: Keyspace,
    next_queue_seq: AtomicU64,
    /// Serializes read-check-write sequences on log records.
    write_lock: Mutex<()>,
    identity_locks: Vec<Mutex<()>>,
    lease_lock: Mutex<()>,
    /// Keeps the directory of a temporary store alive.
    _tmp: Option<tempfile::TempDir>,
}

impl FjallLeafStore {
    /// Open a persistent store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path.as_ref()).open()?;
        let store = Self::init_keyspaces(db, None)?;
        info!(path = %path.as_ref().display(), "opened fjall leaf store");
        Ok(store)
    }

    /// Open a temporary store that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db, Some(tmp))
    }

    fn init_keyspaces(db: Database, tmp: Option<tempfile::TempDir>) -> Result<Self> {
        let logs = db.keyspace("logs", KeyspaceCreateOptions::default)?;
        let queue = db.keyspace("queue", KeyspaceCreateOptions::default)?;
        let identities = db.keyspace("identities", KeyspaceCreateOptions::default)?;
        let leaves = db.keyspace("leaves", KeyspaceCreateOptions::default)?;
        let hashes = db.keyspace("hashes", KeyspaceCreateOptions::default)?;
        let nodes = db.keyspace("nodes", KeyspaceCreateOptions::default)?;
        let roots = db.keyspace("roots", KeyspaceCreateOptions::default)?;
        let leases = db.keyspace("leases", KeyspaceCreateOptions::default)?;

        // Queue sequences only need to increase within a log, so resuming
        // after the largest one still queued is enough.
        let mut next_seq = 0;
        for guard in queue.iter() {
            let key = guard.key()?;
            next_seq = next_seq.max(read_suffix_u64(&key)? + 1);
        }

        Ok(Self {
            db,
            logs,
            queue,
            identities,
            leaves,
            hashes,
            nodes,
            roots,
            leases,
            next_queue_seq: AtomicU64::new(next_seq),
            write_lock: Mutex::new(()),
            identity_locks: (0..IDENTITY_STRIPES).map(|_| Mutex::new(())).collect(),
            lease_lock: Mutex::new(()),
            _tmp: tmp,
        })
    }

    fn record(&self, log_id: LogId) -> Result<LogRecord> {
        match self.logs.get(log_id.to_key())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::LogNotFound(log_id)),
        }
    }

    fn identity_lock(&self, log_id: LogId, identity_hash: &NodeHash) -> &Mutex<()> {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&identity_hash.as_bytes()[..8]);
        let mixed = u64::from_be_bytes(prefix) ^ log_id.get() as u64;
        &self.identity_locks[(mixed % IDENTITY_STRIPES as u64) as usize]
    }

    fn queued_leaf(&self, log_id: LogId, seq: u64) -> Result<Option<Leaf>> {
        match self.queue.get(key_u64(log_id, seq))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn identity(&self, log_id: LogId, identity_hash: &NodeHash) -> Result<Option<IdentityRecord>> {
        match self.identities.get(key_hash(log_id, identity_hash))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl LeafStore for FjallLeafStore {
    fn create_log(&self, log_id: LogId, settings: LogSettings, root: &SignedLogRoot) -> Result<()> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        if self.logs.get(log_id.to_key())?.is_some() {
            return Err(StoreError::LogExists(log_id));
        }

        let record = LogRecord {
            settings,
            head: TreeHead {
                size: root.tree_size,
                root_hash: root.root_hash,
                revision: root.revision,
            },
        };

        let mut batch = self.db.batch();
        batch.insert(&self.logs, &log_id.to_key(), postcard::to_allocvec(&record)?);
        batch.insert(
            &self.roots,
            key_root(log_id, root.tree_size, root.revision),
            postcard::to_allocvec(root)?,
        );
        batch.commit()?;

        debug!(%log_id, "created log");
        Ok(())
    }

    fn log_settings(&self, log_id: LogId) -> Result<LogSettings> {
        Ok(self.record(log_id)?.settings)
    }

    fn list_logs(&self) -> Result<Vec<LogId>> {
        let mut ids = Vec::new();
        for guard in self.logs.iter() {
            let key = guard.key()?;
            ids.push(read_log_id(&key)?);
        }
        Ok(ids)
    }

    fn tree_head(&self, log_id: LogId) -> Result<TreeHead> {
        Ok(self.record(log_id)?.head)
    }

    fn queue_leaf(&self, log_id: LogId, leaf: Leaf) -> Result<(Leaf, bool)> {
        let settings = self.log_settings(log_id)?;

        if settings.allow_duplicates {
            let seq = self.next_queue_seq.fetch_add(1, Ordering::SeqCst);
            self.queue
                .insert(key_u64(log_id, seq), postcard::to_allocvec(&leaf)?)?;
            return Ok((leaf, true));
        }

        let _guard = self
            .identity_lock(log_id, &leaf.identity_hash)
            .lock()
            .expect("lock poisoned");

        if let Some(existing) = self.leaf_by_identity(log_id, &leaf.identity_hash)? {
            return Ok((existing, false));
        }

        let seq = self.next_queue_seq.fetch_add(1, Ordering::SeqCst);
        let mut batch = self.db.batch();
        batch.insert(
            &self.queue,
            key_u64(log_id, seq),
            postcard::to_allocvec(&leaf)?,
        );
        batch.insert(
            &self.identities,
            key_hash(log_id, &leaf.identity_hash),
            postcard::to_allocvec(&IdentityRecord::Queued(seq))?,
        );
        batch.commit()?;
        Ok((leaf, true))
    }

    fn leaf_by_identity(&self, log_id: LogId, identity_hash: &NodeHash) -> Result<Option<Leaf>> {
        match self.identity(log_id, identity_hash)? {
            None => Ok(None),
            Some(IdentityRecord::Sequenced(index)) => self.leaf_at(log_id, index),
            Some(IdentityRecord::Queued(seq)) => match self.queued_leaf(log_id, seq)? {
                Some(leaf) => Ok(Some(leaf)),
                // Integrated between the two reads: the record now points at
                // the sequenced leaf.
                None => match self.identity(log_id, identity_hash)? {
                    Some(IdentityRecord::Sequenced(index)) => self.leaf_at(log_id, index),
                    _ => Err(StoreError::Corrupt(format!(
                        "identity {identity_hash} in log {log_id} points at a missing queue entry"
                    ))),
                },
            },
        }
    }

    fn queued_count(&self, log_id: LogId) -> Result<u64> {
        // Note: this is an O(n) scan.
        let mut count = 0;
        for guard in self.queue.prefix(log_id.to_key()) {
            let _ = guard.key()?;
            count += 1;
        }
        Ok(count)
    }

    fn dequeue_batch(&self, log_id: LogId, limit: usize) -> Result<Vec<QueuedEntry>> {
        let mut entries = Vec::new();
        for guard in self.queue.prefix(log_id.to_key()).take(limit) {
            let (key, value) = guard.into_inner()?;
            entries.push(QueuedEntry {
                queue_seq: read_suffix_u64(&key)?,
                leaf: decode(&value)?,
            });
        }
        Ok(entries)
    }

    fn commit_batch(&self, log_id: LogId, batch: IntegrationBatch) -> Result<()> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let mut record = self.record(log_id)?;
        batch.validate(log_id, &record.head)?;

        let mut write = self.db.batch();
        for (seq, leaf) in &batch.sequenced {
            let queue_key = key_u64(log_id, *seq);
            if !self.queue.contains_key(&queue_key)? {
                return Err(StoreError::Conflict {
                    log_id,
                    reason: format!("queue entry {seq} already consumed"),
                });
            }
            let index = leaf.index.unwrap_or_default();

            write.remove(&self.queue, queue_key);
            if self.identity(log_id, &leaf.identity_hash)? == Some(IdentityRecord::Queued(*seq)) {
                write.insert(
                    &self.identities,
                    key_hash(log_id, &leaf.identity_hash),
                    postcard::to_allocvec(&IdentityRecord::Sequenced(index))?,
                );
            }
            write.insert(
                &self.leaves,
                key_u64(log_id, index),
                postcard::to_allocvec(leaf)?,
            );
            let mut hash_key = key_hash(log_id, &leaf.merkle_hash);
            hash_key.extend_from_slice(&index.to_be_bytes());
            write.insert(&self.hashes, hash_key, Vec::<u8>::new());
        }
        for (id, hash) in &batch.nodes {
            write.insert(&self.nodes, key_node(log_id, *id), hash.as_bytes());
        }
        write.insert(
            &self.roots,
            key_root(log_id, batch.root.tree_size, batch.root.revision),
            postcard::to_allocvec(&batch.root)?,
        );
        record.head = batch.head;
        write.insert(&self.logs, &log_id.to_key(), postcard::to_allocvec(&record)?);
        write.commit()?;

        debug!(
            %log_id,
            tree_size = record.head.size,
            revision = record.head.revision,
            leaves = batch.sequenced.len(),
            "committed batch"
        );
        Ok(())
    }

    fn append_signed_root(
        &self,
        log_id: LogId,
        expected_revision: u64,
        root: &SignedLogRoot,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().expect("lock poisoned");
        let mut record = self.record(log_id)?;
        record.head = validate_resign(log_id, &record.head, expected_revision, root)?;

        let mut write = self.db.batch();
        write.insert(
            &self.roots,
            key_root(log_id, root.tree_size, root.revision),
            postcard::to_allocvec(root)?,
        );
        write.insert(&self.logs, &log_id.to_key(), postcard::to_allocvec(&record)?);
        write.commit()?;
        Ok(())
    }

    fn leaf_at(&self, log_id: LogId, index: u64) -> Result<Option<Leaf>> {
        match self.leaves.get(key_u64(log_id, index))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn leaves_in_range(&self, log_id: LogId, start: u64, end: u64) -> Result<Vec<Leaf>> {
        let end = end.min(self.tree_head(log_id)?.size);
        if start >= end {
            return Ok(Vec::new());
        }

        let mut leaves = Vec::with_capacity((end - start) as usize);
        for guard in self
            .leaves
            .range(key_u64(log_id, start)..key_u64(log_id, end))
        {
            let value = guard.value()?;
            leaves.push(decode(&value)?);
        }
        Ok(leaves)
    }

    fn leaf_indices_by_hash(&self, log_id: LogId, merkle_hash: &NodeHash) -> Result<Vec<u64>> {
        let mut indices = Vec::new();
        for guard in self.hashes.prefix(key_hash(log_id, merkle_hash)) {
            let key = guard.key()?;
            indices.push(read_suffix_u64(&key)?);
        }
        Ok(indices)
    }

    fn node(&self, log_id: LogId, id: NodeId) -> Result<Option<NodeHash>> {
        match self.nodes.get(key_node(log_id, id))? {
            Some(bytes) => NodeHash::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt(format!("node {id} has {} bytes", bytes.len()))),
            None => Ok(None),
        }
    }

    fn latest_signed_root(&self, log_id: LogId) -> Result<SignedLogRoot> {
        match self.roots.prefix(log_id.to_key()).next_back() {
            Some(guard) => decode(&guard.value()?),
            None => {
                // Distinguish a missing log from a log without roots.
                self.record(log_id)?;
                Err(StoreError::Corrupt(format!(
                    "log {log_id} has no signed root"
                )))
            }
        }
    }

    fn signed_root_at_size(&self, log_id: LogId, tree_size: u64) -> Result<Option<SignedLogRoot>> {
        match self
            .roots
            .prefix(key_u64(log_id, tree_size))
            .next_back()
        {
            Some(guard) => Ok(Some(decode(&guard.value()?)?)),
            None => Ok(None),
        }
    }

    fn try_acquire_lease(&self, log_id: LogId, holder: &str, now: u64, ttl: u64) -> Result<bool> {
        let _guard = self.lease_lock.lock().expect("lock poisoned");
        if let Some(bytes) = self.leases.get(log_id.to_key())? {
            let lease: Lease = decode(&bytes)?;
            if !lease.available_to(holder, now) {
                return Ok(false);
            }
        }

        let lease = Lease {
            holder: holder.to_string(),
            expires_at: now.saturating_add(ttl),
        };
        self.leases
            .insert(&log_id.to_key(), postcard::to_allocvec(&lease)?)?;
        Ok(true)
    }

    fn release_lease(&self, log_id: LogId, holder: &str) -> Result<()> {
        let _guard = self.lease_lock.lock().expect("lock poisoned");
        if let Some(bytes) = self.leases.get(log_id.to_key())? {
            let lease: Lease = decode(&bytes)?;
            if lease.holder == holder {
                self.leases.remove(&log_id.to_key())?;
            }
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}

/// `log ++ value (8 bytes big-endian)`.
fn key_u64(log_id: LogId, value: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&log_id.to_key());
    key.extend_from_slice(&value.to_be_bytes());
    key
}

/// `log ++ hash (32 bytes)`.
fn key_hash(log_id: LogId, hash: &NodeHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(&log_id.to_key());
    key.extend_from_slice(hash.as_bytes());
    key
}

/// `log ++ level (1 byte) ++ index (8 bytes big-endian)`.
fn key_node(log_id: LogId, id: NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.extend_from_slice(&log_id.to_key());
    key.extend_from_slice(&id.to_key());
    key
}

/// `log ++ tree size ++ revision`, both 8 bytes big-endian.
fn key_root(log_id: LogId, tree_size: u64, revision: u64) -> Vec<u8> {
    let mut key = key_u64(log_id, tree_size);
    key.extend_from_slice(&revision.to_be_bytes());
    key
}

fn read_suffix_u64(key: &[u8]) -> Result<u64> {
    let tail = key
        .len()
        .checked_sub(8)
        .map(|start| &key[start..])
        .ok_or_else(|| StoreError::Corrupt(format!("key of {} bytes", key.len())))?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(tail);
    Ok(u64::from_be_bytes(arr))
}

fn read_log_id(key: &[u8]) -> Result<LogId> {
    let arr: [u8; 8] = key
        .get(..8)
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt(format!("log key of {} bytes", key.len())))?;
    Ok(LogId::from_key(arr))
}
