//! Batch integration of queued leaves.
//!
//! A sequencing pass for one log claims up to `batch_size` queued leaves in
//! queue order, assigns them consecutive indices from the committed tree
//! size, appends them to the tree and commits leaves, new nodes, the new
//! head and its signed root as one store write. The write carries the
//! revision it was built against, so a pass that lost a race is rejected
//! rather than applied twice.
//!
//! Exclusion is two-level: a per-log in-process slot serializes passes
//! inside one process, and a store lease keeps processes sharing a store
//! from sequencing the same log at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cairn_merkle::{LogHasher, MerkleTree, hasher_for};
use cairn_store::{IntegrationBatch, LeafStore, LogNodes};
use cairn_types::{LogId, TimeSource, TreeHead};
use tokio::sync::{Mutex as SlotMutex, Notify, watch};
use tracing::{debug, error, info, warn};

use crate::error::LogError;
use crate::signer::RootSigner;

type Result<T> = std::result::Result<T, LogError>;

/// Configuration for the [`Sequencer`].
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Maximum leaves integrated per pass. Zero is treated as one.
    pub batch_size: usize,
    /// Interval between background passes over every log.
    pub interval: Duration,
    /// Re-sign an unchanged tree once its latest root is this old.
    pub max_root_age: Option<Duration>,
    /// How long a store lease is held without renewal.
    pub lease_ttl: Duration,
    /// Name this process holds leases under.
    pub holder: String,
}

impl SequencerConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            batch_size: 16,
            interval: Duration::from_millis(20),
            max_root_age: None,
            lease_ttl: Duration::from_secs(5),
            holder: "test".to_string(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            interval: Duration::from_millis(500),
            max_root_age: Some(Duration::from_secs(3600)),
            lease_ttl: Duration::from_secs(30),
            holder: format!("cairnd-{}", std::process::id()),
        }
    }
}

/// What a single pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrationReport {
    /// The log sequenced.
    pub log_id: LogId,
    /// Leaves integrated by this pass.
    pub leaves: usize,
    /// Tree size after the pass.
    pub new_size: u64,
    /// Revision after the pass.
    pub revision: u64,
    /// Whether the pass only re-signed an unchanged tree.
    pub resigned: bool,
    /// Whether the pass was skipped because another holder has the lease.
    pub lease_denied: bool,
}

impl IntegrationReport {
    fn idle(log_id: LogId, head: &TreeHead) -> Self {
        Self {
            log_id,
            leaves: 0,
            new_size: head.size,
            revision: head.revision,
            resigned: false,
            lease_denied: false,
        }
    }
}

/// Running totals across all passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerStats {
    /// Passes that committed a batch or a re-signed root.
    pub commits: u64,
    /// Leaves integrated.
    pub leaves: u64,
    /// Commits rejected because the log moved underneath the pass.
    pub conflicts: u64,
    /// Passes that failed for any other reason.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    leaves: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
}

/// Drains queued leaves into each log's tree.
///
/// Each log is hashed with the hasher recorded in its settings.
pub struct Sequencer {
    store: Arc<dyn LeafStore>,
    root_signer: Arc<RootSigner>,
    clock: Arc<dyn TimeSource>,
    config: SequencerConfig,
    /// One exclusive pass slot per log.
    slots: Mutex<HashMap<LogId, Arc<SlotMutex<()>>>>,
    /// Logs with a pending explicit trigger.
    pending: Mutex<HashSet<LogId>>,
    /// Leaves queued per log since its last pass.
    backlog: Mutex<HashMap<LogId, usize>>,
    wake: Notify,
    counters: Counters,
}

impl Sequencer {
    /// Create a sequencer.
    pub fn new(
        mut config: SequencerConfig,
        store: Arc<dyn LeafStore>,
        root_signer: Arc<RootSigner>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        config.batch_size = config.batch_size.max(1);
        Self {
            store,
            root_signer,
            clock,
            config,
            slots: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            backlog: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            counters: Counters::default(),
        }
    }

    /// Return the sequencer's configuration.
    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Running totals.
    pub fn stats(&self) -> SequencerStats {
        SequencerStats {
            commits: self.counters.commits.load(Ordering::Relaxed),
            leaves: self.counters.leaves.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Ask the background loop to sequence `log_id` soon.
    ///
    /// Triggers that arrive before the loop gets to the log coalesce into one
    /// pass.
    pub fn trigger(&self, log_id: LogId) {
        self.pending.lock().expect("lock poisoned").insert(log_id);
        self.wake.notify_one();
    }

    /// Record newly queued leaves; triggers a pass once a full batch waits.
    pub fn note_queued(&self, log_id: LogId, count: usize) {
        let full = {
            let mut backlog = self.backlog.lock().expect("lock poisoned");
            let waiting = backlog.entry(log_id).or_default();
            *waiting += count;
            *waiting >= self.config.batch_size
        };
        if full {
            self.trigger(log_id);
        }
    }

    fn slot(&self, log_id: LogId) -> Arc<SlotMutex<()>> {
        let mut slots = self.slots.lock().expect("lock poisoned");
        Arc::clone(slots.entry(log_id).or_default())
    }

    /// Run one sequencing pass for `log_id`.
    ///
    /// Waits for any pass already running for the log in this process.
    /// Returns a report with `lease_denied` set if another process holds
    /// the log's lease.
    pub async fn integrate(&self, log_id: LogId) -> Result<IntegrationReport> {
        let slot = self.slot(log_id);
        let _pass = slot.lock().await;

        let holder = self.config.holder.as_str();
        let ttl = self.config.lease_ttl.as_nanos() as u64;
        if !self
            .store
            .try_acquire_lease(log_id, holder, self.clock.now_nanos(), ttl)?
        {
            debug!(%log_id, "lease held elsewhere, skipping pass");
            let head = self.store.tree_head(log_id)?;
            return Ok(IntegrationReport {
                lease_denied: true,
                ..IntegrationReport::idle(log_id, &head)
            });
        }

        let result = self.integrate_leased(log_id);
        if let Err(e) = self.store.release_lease(log_id, holder) {
            warn!(%log_id, error = %e, "failed to release sequencing lease");
        }

        match &result {
            Ok(report) if report.leaves > 0 || report.resigned => {
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .leaves
                    .fetch_add(report.leaves as u64, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(LogError::Store(e)) if e.is_conflict() => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(%log_id, error = %e, "batch lost a race, will retry");
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(%log_id, error = %e, "sequencing pass failed");
            }
        }
        result
    }

    fn integrate_leased(&self, log_id: LogId) -> Result<IntegrationReport> {
        let hasher = hasher_for(self.store.log_settings(log_id)?.hasher);
        let head = self.store.tree_head(log_id)?;
        let queued = self.store.dequeue_batch(log_id, self.config.batch_size)?;
        self.backlog
            .lock()
            .expect("lock poisoned")
            .remove(&log_id);

        if queued.is_empty() {
            return self.maybe_resign(log_id, hasher.as_ref(), &head);
        }

        let nodes = LogNodes::new(self.store.as_ref(), log_id);
        let mut tree = MerkleTree::load(hasher, &nodes, head.size)?;
        if tree.root() != head.root_hash {
            return Err(LogError::Internal(format!(
                "log {log_id}: stored frontier gives root {} at size {}, head says {}",
                tree.root(),
                head.size,
                head.root_hash
            )));
        }

        let now = self.clock.now_nanos();
        let mut sequenced = Vec::with_capacity(queued.len());
        for entry in queued {
            let mut leaf = entry.leaf;
            leaf.index = Some(tree.size());
            leaf.integrated_at = Some(now);
            tree.append(leaf.merkle_hash);
            sequenced.push((entry.queue_seq, leaf));
        }

        let revision = head.revision + 1;
        let root = self.root_signer.sign_tree(log_id, &tree, revision)?;
        let new_head = TreeHead {
            size: tree.size(),
            root_hash: tree.root(),
            revision,
        };
        let leaves = sequenced.len();

        self.store.commit_batch(
            log_id,
            IntegrationBatch {
                expected_revision: head.revision,
                head: new_head,
                sequenced,
                nodes: tree.take_written(),
                root,
            },
        )?;

        info!(
            %log_id,
            leaves,
            tree_size = new_head.size,
            revision,
            root_hash = %new_head.root_hash,
            "integrated batch"
        );
        Ok(IntegrationReport {
            leaves,
            new_size: new_head.size,
            revision,
            ..IntegrationReport::idle(log_id, &head)
        })
    }

    fn maybe_resign(
        &self,
        log_id: LogId,
        hasher: &dyn LogHasher,
        head: &TreeHead,
    ) -> Result<IntegrationReport> {
        let idle = IntegrationReport::idle(log_id, head);
        let Some(max_age) = self.config.max_root_age else {
            return Ok(idle);
        };

        let latest = self.store.latest_signed_root(log_id)?;
        let age = self.clock.now_nanos().saturating_sub(latest.timestamp_nanos);
        if age < max_age.as_nanos() as u64 {
            return Ok(idle);
        }

        let root = self
            .root_signer
            .resign(log_id, self.store.as_ref(), hasher, head)?;
        self.store.append_signed_root(log_id, head.revision, &root)?;
        info!(%log_id, tree_size = head.size, revision = root.revision, "re-signed stale root");

        Ok(IntegrationReport {
            revision: root.revision,
            resigned: true,
            ..idle
        })
    }

    /// Run one pass over every log in the store.
    pub async fn integrate_all(&self) -> Vec<IntegrationReport> {
        let logs = match self.store.list_logs() {
            Ok(logs) => logs,
            Err(e) => {
                error!(error = %e, "failed to list logs");
                return Vec::new();
            }
        };

        let mut reports = Vec::with_capacity(logs.len());
        for log_id in logs {
            if let Ok(report) = self.integrate(log_id).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn integrate_pending(&self) {
        let pending: Vec<LogId> = self
            .pending
            .lock()
            .expect("lock poisoned")
            .drain()
            .collect();
        for log_id in pending {
            // Failures are logged and counted by `integrate`.
            let _ = self.integrate(log_id).await;
        }
    }

    /// Run the sequencing loop until shutdown. Should be spawned as a
    /// background task.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            interval_ms = self.config.interval.as_millis() as u64,
            holder = %self.config.holder,
            "sequencer started"
        );
        let mut tick = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.integrate_all().await;
                }
                _ = self.wake.notified() => {
                    self.integrate_pending().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("sequencer shutting down");
                    break;
                }
            }
        }

        info!(stats = ?self.stats(), "sequencer stopped");
    }
}
