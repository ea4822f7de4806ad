//! A [`LeafStore`] wrapper that injects write failures.
//!
//! `FaultyStore` wraps any `Arc<dyn LeafStore>` and fails batch commits on
//! demand, either before the write reaches the inner store (a crash before
//! commit) or after it (a lost acknowledgement). The RNG is seeded for
//! deterministic, reproducible behaviour across test runs.
//!
//! # Example
//!
//! ```ignore
//! let faulty = FaultyStore::new(inner)
//!     .fail_next_commits(2)   // the next two commits never land
//!     .failure_rate(0.1)      // then 10% of commits fail at random
//!     .seed(42);
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cairn_merkle::NodeId;
use cairn_types::{Leaf, LogId, LogSettings, NodeHash, SignedLogRoot, TreeHead};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::error::StoreError;
use crate::traits::{IntegrationBatch, LeafStore, QueuedEntry};

/// A [`LeafStore`] wrapper that fails commits before or after applying them.
pub struct FaultyStore {
    inner: Arc<dyn LeafStore>,
    fail_before: AtomicU32,
    fail_after: AtomicU32,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl FaultyStore {
    /// Wrap an existing store with no faults (pass-through) by default.
    pub fn new(inner: Arc<dyn LeafStore>) -> Self {
        Self {
            inner,
            fail_before: AtomicU32::new(0),
            fail_after: AtomicU32::new(0),
            failure_rate: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            injected: AtomicU64::new(0),
        }
    }

    /// Drop the next `n` commits without applying them.
    pub fn fail_next_commits(self, n: u32) -> Self {
        self.fail_before.store(n, Ordering::SeqCst);
        self
    }

    /// Apply the next `n` commits but report them as failed.
    pub fn lose_next_acks(self, n: u32) -> Self {
        self.fail_after.store(n, Ordering::SeqCst);
        self
    }

    /// Fail this fraction of commits at random, before applying them.
    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Drop the next `n` commits, on an already shared store.
    pub fn arm_commit_failures(&self, n: u32) {
        self.fail_before.store(n, Ordering::SeqCst);
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn fail_before_write(&self) -> bool {
        if Self::take(&self.fail_before) {
            return true;
        }
        if self.failure_rate <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().expect("lock poisoned");
        rng.random_bool(self.failure_rate)
    }

    fn inject(&self, log_id: LogId, what: &'static str) -> StoreError {
        self.injected.fetch_add(1, Ordering::SeqCst);
        warn!(%log_id, what, "injecting store fault");
        StoreError::Injected(what)
    }
}

impl LeafStore for FaultyStore {
    fn create_log(
        &self,
        log_id: LogId,
        settings: LogSettings,
        root: &SignedLogRoot,
    ) -> Result<(), StoreError> {
        self.inner.create_log(log_id, settings, root)
    }

    fn log_settings(&self, log_id: LogId) -> Result<LogSettings, StoreError> {
        self.inner.log_settings(log_id)
    }

    fn list_logs(&self) -> Result<Vec<LogId>, StoreError> {
        self.inner.list_logs()
    }

    fn tree_head(&self, log_id: LogId) -> Result<TreeHead, StoreError> {
        self.inner.tree_head(log_id)
    }

    fn queue_leaf(&self, log_id: LogId, leaf: Leaf) -> Result<(Leaf, bool), StoreError> {
        self.inner.queue_leaf(log_id, leaf)
    }

    fn leaf_by_identity(
        &self,
        log_id: LogId,
        identity_hash: &NodeHash,
    ) -> Result<Option<Leaf>, StoreError> {
        self.inner.leaf_by_identity(log_id, identity_hash)
    }

    fn queued_count(&self, log_id: LogId) -> Result<u64, StoreError> {
        self.inner.queued_count(log_id)
    }

    fn dequeue_batch(&self, log_id: LogId, limit: usize) -> Result<Vec<QueuedEntry>, StoreError> {
        self.inner.dequeue_batch(log_id, limit)
    }

    fn commit_batch(&self, log_id: LogId, batch: IntegrationBatch) -> Result<(), StoreError> {
        if self.fail_before_write() {
            return Err(self.inject(log_id, "commit dropped"));
        }
        self.inner.commit_batch(log_id, batch)?;
        if Self::take(&self.fail_after) {
            return Err(self.inject(log_id, "commit acknowledgement lost"));
        }
        Ok(())
    }

    fn append_signed_root(
        &self,
        log_id: LogId,
        expected_revision: u64,
        root: &SignedLogRoot,
    ) -> Result<(), StoreError> {
        if self.fail_before_write() {
            return Err(self.inject(log_id, "root append dropped"));
        }
        self.inner.append_signed_root(log_id, expected_revision, root)
    }

    fn leaf_at(&self, log_id: LogId, index: u64) -> Result<Option<Leaf>, StoreError> {
        self.inner.leaf_at(log_id, index)
    }

    fn leaves_in_range(
        &self,
        log_id: LogId,
        start: u64,
        end: u64,
    ) -> Result<Vec<Leaf>, StoreError> {
        self.inner.leaves_in_range(log_id, start, end)
    }

    fn leaf_indices_by_hash(
        &self,
        log_id: LogId,
        merkle_hash: &NodeHash,
    ) -> Result<Vec<u64>, StoreError> {
        self.inner.leaf_indices_by_hash(log_id, merkle_hash)
    }

    fn node(&self, log_id: LogId, id: NodeId) -> Result<Option<NodeHash>, StoreError> {
        self.inner.node(log_id, id)
    }

    fn latest_signed_root(&self, log_id: LogId) -> Result<SignedLogRoot, StoreError> {
        self.inner.latest_signed_root(log_id)
    }

    fn signed_root_at_size(
        &self,
        log_id: LogId,
        tree_size: u64,
    ) -> Result<Option<SignedLogRoot>, StoreError> {
        self.inner.signed_root_at_size(log_id, tree_size)
    }

    fn try_acquire_lease(
        &self,
        log_id: LogId,
        holder: &str,
        now: u64,
        ttl: u64,
    ) -> Result<bool, StoreError> {
        self.inner.try_acquire_lease(log_id, holder, now, ttl)
    }

    fn release_lease(&self, log_id: LogId, holder: &str) -> Result<(), StoreError> {
        self.inner.release_lease(log_id, holder)
    }
}
