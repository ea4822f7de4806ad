//! [`LogService`]: the external operations of a set of logs.
//!
//! Index and size parameters are `i64` at this boundary; negative values are
//! rejected as invalid arguments. Reads load the committed tree head once
//! and serve everything from immutable state bounded by it, so they never
//! wait on sequencing.

use std::sync::Arc;

use cairn_merkle::{LogHasher, ProofBuilder, hasher_for};
use cairn_store::{LeafStore, LogNodes, StoreError};
use cairn_types::{
    HASH_SIZE, Leaf, LeafInput, LogId, LogSettings, NodeHash, Proof, QueueOutcome, SignedLogRoot,
    TimeSource, TreeHead,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dedup::Deduplicator;
use crate::error::LogError;
use crate::sequencer::{IntegrationReport, Sequencer, SequencerConfig};
use crate::signer::{LogSigner, RootSigner};

type Result<T> = std::result::Result<T, LogError>;

/// Configuration for creating a [`LogService`].
#[derive(Debug, Clone, Default)]
pub struct LogServiceConfig {
    /// Background sequencing.
    pub sequencer: SequencerConfig,
}

/// The latest signed root, optionally with a proof from an older size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestRoot {
    /// The root with the greatest `(tree_size, revision)`.
    pub root: SignedLogRoot,
    /// Consistency proof from the requested first size to `root.tree_size`.
    pub consistency: Option<Proof>,
}

/// A sequenced leaf together with its inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAndProof {
    /// The leaf.
    pub leaf: Leaf,
    /// Inclusion proof of the leaf at the requested tree size.
    pub proof: Proof,
}

/// Orchestrates deduplication, sequencing, proofs and signed roots.
pub struct LogService {
    store: Arc<dyn LeafStore>,
    dedup: Deduplicator,
    root_signer: Arc<RootSigner>,
    sequencer: Arc<Sequencer>,
}

impl LogService {
    /// Create a service over `store`, signing roots with `signer`.
    pub fn new(
        config: LogServiceConfig,
        store: Arc<dyn LeafStore>,
        signer: Arc<dyn LogSigner>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let root_signer = Arc::new(RootSigner::new(signer, Arc::clone(&clock)));
        let dedup = Deduplicator::new(Arc::clone(&store), Arc::clone(&clock));
        let sequencer = Arc::new(Sequencer::new(
            config.sequencer,
            Arc::clone(&store),
            Arc::clone(&root_signer),
            clock,
        ));

        Self {
            store,
            dedup,
            root_signer,
            sequencer,
        }
    }

    /// Return a reference to the leaf store.
    pub fn store(&self) -> &Arc<dyn LeafStore> {
        &self.store
    }

    /// The hasher `log_id` was initialized with.
    pub fn log_hasher(&self, log_id: LogId) -> Result<Arc<dyn LogHasher>> {
        Ok(hasher_for(self.store.log_settings(log_id)?.hasher))
    }

    /// Return the sequencer.
    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// Spawn the background sequencing loop.
    pub fn spawn_sequencer(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let sequencer = Arc::clone(&self.sequencer);
        tokio::spawn(async move { sequencer.run(shutdown_rx).await })
    }

    /// Run one sequencing pass for `log_id` now.
    pub async fn sequence(&self, log_id: LogId) -> Result<IntegrationReport> {
        self.sequencer.integrate(log_id).await
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Initialize a log with an empty tree and a signed root for size 0.
    ///
    /// Fails with `FailedPrecondition` if the log already has state.
    pub fn init_log(&self, log_id: LogId, settings: LogSettings) -> Result<SignedLogRoot> {
        match self.store.tree_head(log_id) {
            Ok(_) => {
                return Err(LogError::FailedPrecondition(format!(
                    "log {log_id} is already initialized"
                )));
            }
            Err(StoreError::LogNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let root = self
            .root_signer
            .sign_empty(log_id, hasher_for(settings.hasher).as_ref())?;
        self.store
            .create_log(log_id, settings, &root)
            .map_err(|e| match e {
                StoreError::LogExists(_) => LogError::FailedPrecondition(format!(
                    "log {log_id} is already initialized"
                )),
                other => other.into(),
            })?;

        info!(
            %log_id,
            allow_duplicates = settings.allow_duplicates,
            hasher = %settings.hasher,
            "initialized log"
        );
        Ok(root)
    }

    /// All logs known to the store.
    pub fn list_logs(&self) -> Result<Vec<LogId>> {
        Ok(self.store.list_logs()?)
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Queue one leaf.
    ///
    /// A leaf whose identity is already present is not an error: the
    /// outcome carries the existing leaf with `AlreadyExists` status.
    pub fn queue_leaf(&self, log_id: LogId, input: LeafInput) -> Result<QueueOutcome> {
        let outcome = self.dedup.queue(log_id, input)?;
        if outcome.is_new() {
            self.sequencer.note_queued(log_id, 1);
        }
        Ok(outcome)
    }

    /// Queue many leaves. Outcomes are in request order.
    ///
    /// Only an empty request or an unknown log fails as a whole; anything
    /// else is reported per leaf.
    pub fn queue_leaves(
        &self,
        log_id: LogId,
        inputs: Vec<LeafInput>,
    ) -> Result<Vec<Result<QueueOutcome>>> {
        if inputs.is_empty() {
            return Err(LogError::InvalidArgument("no leaves to queue".to_string()));
        }
        self.store.log_settings(log_id)?;

        let outcomes: Vec<_> = inputs
            .into_iter()
            .map(|input| self.dedup.queue(log_id, input))
            .collect();
        let queued = outcomes
            .iter()
            .filter(|o| o.as_ref().is_ok_and(QueueOutcome::is_new))
            .count();

        debug!(%log_id, requested = outcomes.len(), queued, "queued leaves");
        if queued > 0 {
            self.sequencer.note_queued(log_id, queued);
        }
        Ok(outcomes)
    }

    // ------------------------------------------------------------------
    // Proofs
    // ------------------------------------------------------------------

    /// Inclusion proof of the leaf at `leaf_index` in the tree of `tree_size`.
    pub fn get_inclusion_proof(
        &self,
        log_id: LogId,
        leaf_index: i64,
        tree_size: i64,
    ) -> Result<Proof> {
        let leaf_index = non_negative("leaf_index", leaf_index)?;
        let tree_size = non_negative("tree_size", tree_size)?;
        let head = self.committed_head(log_id, tree_size)?;
        check_index(leaf_index, tree_size)?;

        let hasher = self.log_hasher(log_id)?;
        let nodes = LogNodes::new(self.store.as_ref(), log_id);
        let builder = ProofBuilder::new(hasher.as_ref(), &nodes, head.size);
        Ok(builder.inclusion_proof(leaf_index, tree_size)?)
    }

    /// Inclusion proofs for every sequenced leaf with `leaf_hash` below
    /// `tree_size`, in index order. More than one only if the log allows
    /// duplicates.
    pub fn get_inclusion_proof_by_hash(
        &self,
        log_id: LogId,
        leaf_hash: &[u8],
        tree_size: i64,
    ) -> Result<Vec<Proof>> {
        let leaf_hash = parse_hash("leaf_hash", leaf_hash)?;
        let tree_size = non_negative("tree_size", tree_size)?;
        let head = self.committed_head(log_id, tree_size)?;

        let indices: Vec<u64> = self
            .store
            .leaf_indices_by_hash(log_id, &leaf_hash)?
            .into_iter()
            .filter(|index| *index < tree_size)
            .collect();
        if indices.is_empty() {
            return Err(LogError::NotFound(format!(
                "no leaf with hash {leaf_hash} in log {log_id} at size {tree_size}"
            )));
        }

        let hasher = self.log_hasher(log_id)?;
        let nodes = LogNodes::new(self.store.as_ref(), log_id);
        let builder = ProofBuilder::new(hasher.as_ref(), &nodes, head.size);
        indices
            .into_iter()
            .map(|index| Ok(builder.inclusion_proof(index, tree_size)?))
            .collect()
    }

    /// Proof that the tree at `first_tree_size` is a prefix of the tree at
    /// `second_tree_size`.
    pub fn get_consistency_proof(
        &self,
        log_id: LogId,
        first_tree_size: i64,
        second_tree_size: i64,
    ) -> Result<Proof> {
        let first = non_negative("first_tree_size", first_tree_size)?;
        let second = non_negative("second_tree_size", second_tree_size)?;
        if first > second {
            return Err(LogError::InvalidArgument(format!(
                "first_tree_size {first} is greater than second_tree_size {second}"
            )));
        }
        let head = self.committed_head(log_id, second)?;

        let hasher = self.log_hasher(log_id)?;
        let nodes = LogNodes::new(self.store.as_ref(), log_id);
        let builder = ProofBuilder::new(hasher.as_ref(), &nodes, head.size);
        Ok(builder.consistency_proof(first, second)?)
    }

    /// The leaf at `leaf_index` with its inclusion proof at `tree_size`.
    pub fn get_entry_and_proof(
        &self,
        log_id: LogId,
        leaf_index: i64,
        tree_size: i64,
    ) -> Result<EntryAndProof> {
        let index = non_negative("leaf_index", leaf_index)?;
        let size = non_negative("tree_size", tree_size)?;
        let head = self.committed_head(log_id, size)?;
        check_index(index, size)?;

        let leaf = self
            .store
            .leaf_at(log_id, index)?
            .ok_or_else(|| LogError::Internal(format!("log {log_id}: leaf {index} missing")))?;
        let hasher = self.log_hasher(log_id)?;
        let nodes = LogNodes::new(self.store.as_ref(), log_id);
        let proof = ProofBuilder::new(hasher.as_ref(), &nodes, head.size)
            .inclusion_proof(index, size)?;
        Ok(EntryAndProof { leaf, proof })
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// The latest signed root, with a consistency proof from
    /// `first_tree_size` if one is given.
    pub fn get_latest_signed_root(
        &self,
        log_id: LogId,
        first_tree_size: Option<i64>,
    ) -> Result<LatestRoot> {
        let root = self.store.latest_signed_root(log_id)?;
        let Some(first) = first_tree_size else {
            return Ok(LatestRoot {
                root,
                consistency: None,
            });
        };

        let first = non_negative("first_tree_size", first)?;
        if first > root.tree_size {
            return Err(LogError::FailedPrecondition(format!(
                "first_tree_size {first} exceeds latest tree size {}",
                root.tree_size
            )));
        }
        let hasher = self.log_hasher(log_id)?;
        let nodes = LogNodes::new(self.store.as_ref(), log_id);
        let proof = ProofBuilder::new(hasher.as_ref(), &nodes, root.tree_size)
            .consistency_proof(first, root.tree_size)?;

        Ok(LatestRoot {
            root,
            consistency: Some(proof),
        })
    }

    /// The most recent signed root for exactly `tree_size` leaves.
    pub fn get_signed_root_at_size(&self, log_id: LogId, tree_size: i64) -> Result<SignedLogRoot> {
        let tree_size = non_negative("tree_size", tree_size)?;
        self.committed_head(log_id, tree_size)?;
        self.store
            .signed_root_at_size(log_id, tree_size)?
            .ok_or_else(|| {
                LogError::NotFound(format!(
                    "log {log_id} never published a root at size {tree_size}"
                ))
            })
    }

    // ------------------------------------------------------------------
    // Leaves
    // ------------------------------------------------------------------

    /// Number of sequenced leaves.
    pub fn get_sequenced_leaf_count(&self, log_id: LogId) -> Result<u64> {
        Ok(self.store.tree_head(log_id)?.size)
    }

    /// Sequenced leaves at the given indices, in request order.
    ///
    /// An index that is not yet sequenced is reported as `NotFound` for that
    /// item; a negative index rejects the whole request.
    pub fn get_leaves_by_index(
        &self,
        log_id: LogId,
        indices: &[i64],
    ) -> Result<Vec<Result<Leaf>>> {
        let indices = indices
            .iter()
            .map(|i| non_negative("leaf_index", *i))
            .collect::<Result<Vec<_>>>()?;
        let head = self.store.tree_head(log_id)?;

        indices
            .into_iter()
            .map(|index| {
                if index >= head.size {
                    return Ok(Err(LogError::NotFound(format!(
                        "leaf {index} is not sequenced in log {log_id} (size {})",
                        head.size
                    ))));
                }
                match self.store.leaf_at(log_id, index)? {
                    Some(leaf) => Ok(Ok(leaf)),
                    None => Err(LogError::Internal(format!(
                        "log {log_id}: leaf {index} missing below size {}",
                        head.size
                    ))),
                }
            })
            .collect()
    }

    /// Up to `count` sequenced leaves starting at `start_index`.
    ///
    /// The range is truncated at the sequenced count.
    pub fn get_leaves_by_range(
        &self,
        log_id: LogId,
        start_index: i64,
        count: i64,
    ) -> Result<Vec<Leaf>> {
        let start = non_negative("start_index", start_index)?;
        if count <= 0 {
            return Err(LogError::InvalidArgument(format!(
                "count must be positive, got {count}"
            )));
        }
        let end = start.saturating_add(count as u64);
        Ok(self.store.leaves_in_range(log_id, start, end)?)
    }

    /// Sequenced leaves for each of `leaf_hashes`, in request order.
    ///
    /// Each item holds every leaf with that merkle hash in index order, or
    /// `NotFound` if none is sequenced. A malformed hash rejects the whole
    /// request.
    pub fn get_leaves_by_hash(
        &self,
        log_id: LogId,
        leaf_hashes: &[Vec<u8>],
    ) -> Result<Vec<Result<Vec<Leaf>>>> {
        let hashes = leaf_hashes
            .iter()
            .map(|h| parse_hash("leaf_hash", h))
            .collect::<Result<Vec<_>>>()?;
        self.store.log_settings(log_id)?;

        hashes
            .into_iter()
            .map(|hash| {
                let mut leaves = Vec::new();
                for index in self.store.leaf_indices_by_hash(log_id, &hash)? {
                    match self.store.leaf_at(log_id, index)? {
                        Some(leaf) => leaves.push(leaf),
                        None => {
                            return Err(LogError::Internal(format!(
                                "log {log_id}: leaf {index} indexed by hash {hash} is missing"
                            )));
                        }
                    }
                }
                if leaves.is_empty() {
                    return Ok(Err(LogError::NotFound(format!(
                        "no sequenced leaf with hash {hash} in log {log_id}"
                    ))));
                }
                Ok(Ok(leaves))
            })
            .collect()
    }

    /// The committed head, checking that `tree_size` does not exceed it.
    fn committed_head(&self, log_id: LogId, tree_size: u64) -> Result<TreeHead> {
        let head = self.store.tree_head(log_id)?;
        if tree_size > head.size {
            return Err(LogError::FailedPrecondition(format!(
                "tree_size {tree_size} exceeds committed size {} of log {log_id}",
                head.size
            )));
        }
        Ok(head)
    }
}

fn non_negative(name: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        LogError::InvalidArgument(format!("{name} must not be negative, got {value}"))
    })
}

fn check_index(leaf_index: u64, tree_size: u64) -> Result<()> {
    if leaf_index >= tree_size {
        return Err(LogError::InvalidArgument(format!(
            "leaf_index {leaf_index} is not below tree_size {tree_size}"
        )));
    }
    Ok(())
}

fn parse_hash(name: &str, bytes: &[u8]) -> Result<NodeHash> {
    NodeHash::from_slice(bytes).ok_or_else(|| {
        LogError::InvalidArgument(format!(
            "{name} has {} bytes, expected {HASH_SIZE}",
            bytes.len()
        ))
    })
}
