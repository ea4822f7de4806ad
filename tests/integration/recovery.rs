//! Integration test: failures and restarts.
//!
//! Store writes that fail before or after landing, processes that restart
//! between passes and a persistent store reopened from disk. After recovery
//! every queued leaf is in the tree exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cairn_integration_tests::{HarnessConfig, IntegrationLog, LOG, value};
use cairn_log::SequencerConfig;
use cairn_merkle::{HasherKind, LogHasher, Rfc6962Hasher};
use cairn_store::{FaultyStore, FjallLeafStore, LeafStore, MemoryLeafStore};
use cairn_types::{LeafInput, LogSettings, QueueStatus};

fn assert_unique(values: &[Vec<u8>]) {
    let unique: HashSet<_> = values.iter().collect();
    assert_eq!(unique.len(), values.len(), "a leaf was integrated twice");
}

/// A third of all commits fail before landing; retries integrate everything.
#[tokio::test]
async fn test_random_commit_failures() {
    let faulty = Arc::new(
        FaultyStore::new(Arc::new(MemoryLeafStore::new()))
            .failure_rate(0.3)
            .seed(7),
    );
    let log = IntegrationLog::with_store(
        faulty.clone(),
        HarnessConfig {
            processes: 2,
            sequencer: SequencerConfig {
                batch_size: 10,
                ..SequencerConfig::test_config()
            },
            ..HarnessConfig::default()
        },
    );

    for i in 0..200 {
        log.service(i % 2).queue_leaf(LOG, value(i % 2, i)).unwrap();
    }
    let integrated = log.drain(0, 1000).await + log.drain(1, 1000).await;
    assert_eq!(integrated, 200);
    assert!(faulty.injected() > 0, "no faults were injected");

    let values = log.verify_log();
    assert_eq!(values.len(), 200);
    assert_unique(&values);
}

/// Commits that land but report failure are not applied a second time.
#[tokio::test]
async fn test_lost_acknowledgements() {
    let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryLeafStore::new())).lose_next_acks(3));
    let log = IntegrationLog::with_store(
        faulty.clone(),
        HarnessConfig {
            sequencer: SequencerConfig {
                batch_size: 5,
                ..SequencerConfig::test_config()
            },
            ..HarnessConfig::default()
        },
    );

    for i in 0..20 {
        log.service(0).queue_leaf(LOG, value(0, i)).unwrap();
    }
    log.drain(0, 3).await;
    assert_eq!(faulty.injected(), 3);

    let values = log.verify_log();
    assert_eq!(values.len(), 20);
    assert_unique(&values);

    // Exactly four batches landed, one revision each.
    let head = log.store().tree_head(LOG).unwrap();
    assert_eq!(head.size, 20);
    assert_eq!(head.revision, 4);
}

/// A process that restarts between passes carries on from the stored head.
#[tokio::test]
async fn test_restart_between_passes() {
    let mut log = IntegrationLog::new(2);

    for i in 0..30 {
        log.service(0).queue_leaf(LOG, value(0, i)).unwrap();
    }
    let first = log.service(0).sequence(LOG).await.unwrap();
    assert_eq!(first.new_size, 16);

    log.restart(0);
    assert_eq!(log.service(0).sequencer().stats().commits, 0);

    // Resubmitting after the restart finds both sequenced and queued leaves.
    let sequenced = log.service(0).queue_leaf(LOG, value(0, 3)).unwrap();
    assert_eq!(sequenced.status, QueueStatus::AlreadyExists);
    assert_eq!(sequenced.leaf.index, Some(3));
    let queued = log.service(1).queue_leaf(LOG, value(0, 20)).unwrap();
    assert_eq!(queued.status, QueueStatus::AlreadyExists);
    assert_eq!(queued.leaf.index, None);

    let second = log.service(0).sequence(LOG).await.unwrap();
    assert_eq!(second.new_size, 30);
    assert_eq!(second.revision, first.revision + 1);

    let values = log.verify_log();
    for (i, v) in values.iter().enumerate() {
        assert_eq!(*v, value(0, i).value);
    }
}

/// A crashed process's lease blocks sequencing only until it expires.
#[tokio::test]
async fn test_stale_lease_expires() {
    let log = IntegrationLog::new(1);
    let ttl = Duration::from_secs(30).as_nanos() as u64;
    let start = log
        .service(0)
        .get_latest_signed_root(LOG, None)
        .unwrap()
        .root
        .timestamp_nanos;
    assert!(
        log.store()
            .try_acquire_lease(LOG, "crashed-process", start, ttl)
            .unwrap()
    );

    log.service(0).queue_leaf(LOG, value(0, 0)).unwrap();
    let report = log.service(0).sequence(LOG).await.unwrap();
    assert!(report.lease_denied);
    assert_eq!(log.store().tree_head(LOG).unwrap().size, 0);

    log.clock().advance(ttl + 1);
    let report = log.service(0).sequence(LOG).await.unwrap();
    assert!(!report.lease_denied);
    assert_eq!(report.new_size, 1);
}

/// Everything a Fjall-backed log holds survives closing and reopening it.
#[tokio::test]
async fn test_fjall_reopen_resumes_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");
    let config = HarnessConfig {
        sequencer: SequencerConfig {
            batch_size: 8,
            ..SequencerConfig::test_config()
        },
        ..HarnessConfig::default()
    };

    let (proof_before, root_before) = {
        let store: Arc<dyn LeafStore> = Arc::new(FjallLeafStore::open(&path).unwrap());
        let log = IntegrationLog::with_store(store, config.clone());
        for i in 0..20 {
            log.service(0).queue_leaf(LOG, value(0, i)).unwrap();
        }
        // One batch of 8; 12 leaves stay queued across the restart.
        log.service(0).sequence(LOG).await.unwrap();
        let proof = log.service(0).get_inclusion_proof(LOG, 5, 8).unwrap();
        let root = log.service(0).get_signed_root_at_size(LOG, 8).unwrap();
        (proof, root)
    };

    let store: Arc<dyn LeafStore> = Arc::new(FjallLeafStore::open(&path).unwrap());
    let log = IntegrationLog::with_store(store, config);
    assert_eq!(log.store().tree_head(LOG).unwrap().size, 8);
    assert_eq!(log.store().queued_count(LOG).unwrap(), 12);

    let again = log.service(0).queue_leaf(LOG, value(0, 15)).unwrap();
    assert_eq!(again.status, QueueStatus::AlreadyExists);

    log.drain(0, 0).await;
    assert_eq!(
        log.service(0).get_inclusion_proof(LOG, 5, 8).unwrap(),
        proof_before
    );
    assert_eq!(
        log.service(0).get_signed_root_at_size(LOG, 8).unwrap(),
        root_before
    );

    let values = log.verify_log();
    assert_eq!(values.len(), 20);
    for (i, v) in values.iter().enumerate() {
        assert_eq!(*v, value(0, i).value);
    }
}

/// A log keeps the hasher it was initialized with when processes that
/// default to another one reopen its store.
#[tokio::test]
async fn test_reopen_with_other_hasher_keeps_log_hasher() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store");

    let root_before = {
        let store: Arc<dyn LeafStore> = Arc::new(FjallLeafStore::open(&path).unwrap());
        let log = IntegrationLog::with_store(store, HarnessConfig::default());
        for v in ["a", "b", "c"] {
            log.service(0)
                .queue_leaf(LOG, LeafInput::new(v.as_bytes().to_vec()))
                .unwrap();
        }
        log.drain(0, 0).await;
        log.service(0).get_signed_root_at_size(LOG, 3).unwrap()
    };

    let store: Arc<dyn LeafStore> = Arc::new(FjallLeafStore::open(&path).unwrap());
    let log = IntegrationLog::with_store(
        store,
        HarnessConfig {
            settings: LogSettings {
                hasher: HasherKind::Blake3,
                ..LogSettings::default()
            },
            ..HarnessConfig::default()
        },
    );
    assert_eq!(
        log.store().log_settings(LOG).unwrap().hasher,
        HasherKind::Rfc6962
    );

    let again = log
        .service(0)
        .queue_leaf(LOG, LeafInput::new(b"a".to_vec()))
        .unwrap();
    assert_eq!(again.status, QueueStatus::AlreadyExists);
    assert_eq!(again.leaf.index, Some(0));
    assert_eq!(log.store().queued_count(LOG).unwrap(), 0);

    log.service(0)
        .queue_leaf(LOG, LeafInput::new(b"d".to_vec()))
        .unwrap();
    assert_eq!(log.drain(0, 0).await, 1);
    assert_eq!(
        log.service(0).get_signed_root_at_size(LOG, 3).unwrap(),
        root_before
    );

    let values = log.verify_log();
    assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    let leaves = log.service(0).get_leaves_by_range(LOG, 0, 4).unwrap();
    for leaf in &leaves {
        assert_eq!(leaf.merkle_hash, Rfc6962Hasher.hash_leaf(&leaf.value));
    }
}
