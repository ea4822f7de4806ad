//! Shared test harness for Cairn integration tests.
//!
//! Provides [`IntegrationLog`]: one log in a shared leaf store, served by N
//! independent [`LogService`] instances that stand in for separate
//! processes. Each process has its own sequencer and lease holder name;
//! they share the store, the signing key and a fake clock.

use std::sync::Arc;
use std::time::Duration;

use cairn_log::{
    Ed25519Signer, Ed25519Verifier, LogService, LogServiceConfig, LogVerifier, SequencerConfig,
};
use cairn_merkle::verify;
use cairn_store::{FjallLeafStore, LeafStore, MemoryLeafStore};
use cairn_types::{FakeTimeSource, LeafInput, LogId, LogSettings, SignedLogRoot};

/// The log every harness creates.
pub const LOG: LogId = LogId::new(42);

/// Starting time of the fake clock.
const START_NANOS: u64 = 1_700_000_000_000_000_000;

/// Signing key shared by all processes of a harness.
const SIGNER_KEY: [u8; 32] = [5; 32];

/// How a harness builds its processes.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Number of independent services over the store.
    pub processes: usize,
    /// Sequencer settings; `holder` is replaced per process.
    pub sequencer: SequencerConfig,
    /// Settings of [`LOG`], including its hasher.
    pub settings: LogSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            processes: 1,
            sequencer: SequencerConfig::test_config(),
            settings: LogSettings::default(),
        }
    }
}

/// A log shared by several simulated processes.
pub struct IntegrationLog {
    config: HarnessConfig,
    store: Arc<dyn LeafStore>,
    services: Vec<Arc<LogService>>,
    clock: Arc<FakeTimeSource>,
    verifier: Ed25519Verifier,
}

impl IntegrationLog {
    /// `processes` services over a fresh memory store.
    pub fn new(processes: usize) -> Self {
        Self::with_store(
            Arc::new(MemoryLeafStore::new()),
            HarnessConfig {
                processes,
                ..HarnessConfig::default()
            },
        )
    }

    /// Services over `store`. [`LOG`] is created unless it already exists.
    pub fn with_store(store: Arc<dyn LeafStore>, config: HarnessConfig) -> Self {
        let clock = Arc::new(FakeTimeSource::new(START_NANOS));
        let verifier = Ed25519Signer::from_bytes(&SIGNER_KEY).verifier();

        let mut log = Self {
            config,
            store,
            services: Vec::new(),
            clock,
            verifier,
        };
        for i in 0..log.config.processes {
            let service = log.build_service(i);
            log.services.push(service);
        }
        if log.store.tree_head(LOG).is_err() {
            log.service(0)
                .init_log(LOG, log.config.settings)
                .expect("init log");
        }
        log
    }

    fn build_service(&self, i: usize) -> Arc<LogService> {
        let config = LogServiceConfig {
            sequencer: SequencerConfig {
                holder: format!("process-{i}"),
                ..self.config.sequencer.clone()
            },
        };
        Arc::new(LogService::new(
            config,
            Arc::clone(&self.store),
            Arc::new(Ed25519Signer::from_bytes(&SIGNER_KEY)),
            self.clock.clone(),
        ))
    }

    /// The service of process `i`.
    pub fn service(&self, i: usize) -> &Arc<LogService> {
        &self.services[i]
    }

    /// Number of processes.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the harness has no processes.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<dyn LeafStore> {
        &self.store
    }

    /// The shared fake clock.
    pub fn clock(&self) -> &FakeTimeSource {
        &self.clock
    }

    /// Replace process `i` with a fresh service, as after a crash.
    ///
    /// In-memory sequencer state (backlog, stats) is lost; everything in
    /// the store survives.
    pub fn restart(&mut self, i: usize) {
        self.services[i] = self.build_service(i);
    }

    /// Run passes on process `i` until its queue is empty, retrying failed
    /// passes up to `max_failures` times in total. Returns the leaves it
    /// integrated.
    pub async fn drain(&self, i: usize, max_failures: usize) -> usize {
        let mut integrated = 0;
        let mut failures = 0;
        loop {
            match self.service(i).sequence(LOG).await {
                Ok(report) if report.lease_denied => tokio::task::yield_now().await,
                Ok(report) if report.leaves == 0 => {
                    if self.store.queued_count(LOG).expect("queued count") == 0 {
                        return integrated;
                    }
                    tokio::task::yield_now().await;
                }
                Ok(report) => integrated += report.leaves,
                Err(e) => {
                    failures += 1;
                    assert!(failures <= max_failures, "too many failed passes: {e}");
                }
            }
        }
    }

    /// Poll until [`LOG`] has `size` sequenced leaves.
    pub async fn wait_for_size(&self, size: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.store.tree_head(LOG).expect("tree head").size >= size {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Every signed root, ordered by tree size.
    pub fn signed_roots(&self) -> Vec<SignedLogRoot> {
        let size = self.store.tree_head(LOG).expect("tree head").size;
        (0..=size)
            .filter_map(|s| self.store.signed_root_at_size(LOG, s).expect("signed root"))
            .collect()
    }

    /// Check the whole log from a client's point of view.
    ///
    /// Every signed root carries a valid signature; consecutive roots are
    /// consistent; every leaf has a unique index and verifies against the
    /// latest root. Returns the sequenced leaf values in index order.
    pub fn verify_log(&self) -> Vec<Vec<u8>> {
        let service = self.service(0);
        let hasher = service.log_hasher(LOG).expect("log hasher");
        let hasher = hasher.as_ref();

        let roots = self.signed_roots();
        assert!(!roots.is_empty(), "log has no signed roots");
        for root in &roots {
            self.verifier
                .verify_root(root)
                .unwrap_or_else(|e| panic!("bad signature at size {}: {e}", root.tree_size));
        }
        for pair in roots.windows(2) {
            let (old, new) = (&pair[0], &pair[1]);
            let proof = service
                .get_consistency_proof(LOG, old.tree_size as i64, new.tree_size as i64)
                .expect("consistency proof");
            verify::verify_consistency(
                hasher,
                old.tree_size,
                new.tree_size,
                &proof.hashes,
                &old.root_hash,
                &new.root_hash,
            )
            .unwrap_or_else(|e| {
                panic!("sizes {} -> {} inconsistent: {e}", old.tree_size, new.tree_size)
            });
        }

        let latest = roots.last().expect("latest root");
        let size = latest.tree_size;
        if size == 0 {
            return Vec::new();
        }
        let leaves = service
            .get_leaves_by_range(LOG, 0, size as i64)
            .expect("leaves");
        assert_eq!(leaves.len() as u64, size);

        for (i, leaf) in leaves.iter().enumerate() {
            assert_eq!(leaf.index, Some(i as u64), "leaf {i} has wrong index");
            let proof = service
                .get_inclusion_proof(LOG, i as i64, size as i64)
                .expect("inclusion proof");
            verify::verify_inclusion(
                hasher,
                i as u64,
                size,
                &leaf.merkle_hash,
                &proof.hashes,
                &latest.root_hash,
            )
            .unwrap_or_else(|e| panic!("leaf {i} not included at size {size}: {e}"));
        }
        leaves.into_iter().map(|l| l.value).collect()
    }
}

/// A Fjall store in a fresh temporary directory.
pub fn fjall_store() -> Arc<dyn LeafStore> {
    Arc::new(FjallLeafStore::open_temporary().expect("open temporary fjall store"))
}

/// Leaf input with a recognisable payload.
pub fn value(writer: usize, i: usize) -> LeafInput {
    LeafInput::new(format!("writer-{writer}/leaf-{i}").into_bytes())
}
