//! Integration test: proofs against signed roots.
//!
//! Grows a log through batches of uneven sizes, then checks every proof a
//! client could ask for against the roots the log actually signed.

use cairn_integration_tests::{HarnessConfig, IntegrationLog, LOG, fjall_store, value};
use cairn_log::{ErrorKind, SequencerConfig};
use cairn_merkle::{HasherKind, verify};
use cairn_types::{LogSettings, SignedLogRoot};

const BATCHES: [usize; 7] = [1, 2, 5, 8, 13, 1, 16];

/// Queue and sequence each batch in its own pass.
async fn grow(log: &IntegrationLog) {
    let mut next = 0;
    for batch in BATCHES {
        for _ in 0..batch {
            log.service(0).queue_leaf(LOG, value(0, next)).unwrap();
            next += 1;
        }
        let report = log.service(0).sequence(LOG).await.unwrap();
        assert_eq!(report.leaves, batch);
    }
}

fn check_every_proof(log: &IntegrationLog, roots: &[SignedLogRoot]) {
    let service = log.service(0);
    let hasher = service.log_hasher(LOG).unwrap();
    let hasher = hasher.as_ref();

    for root in roots {
        for index in 0..root.tree_size {
            let entry = service
                .get_entry_and_proof(LOG, index as i64, root.tree_size as i64)
                .unwrap();
            verify::verify_inclusion(
                hasher,
                index,
                root.tree_size,
                &entry.leaf.merkle_hash,
                &entry.proof.hashes,
                &root.root_hash,
            )
            .unwrap_or_else(|e| panic!("leaf {index} at size {}: {e}", root.tree_size));
        }
    }

    for (i, first) in roots.iter().enumerate() {
        for second in &roots[i..] {
            let proof = service
                .get_consistency_proof(LOG, first.tree_size as i64, second.tree_size as i64)
                .unwrap();
            verify::verify_consistency(
                hasher,
                first.tree_size,
                second.tree_size,
                &proof.hashes,
                &first.root_hash,
                &second.root_hash,
            )
            .unwrap_or_else(|e| {
                panic!("sizes {} -> {}: {e}", first.tree_size, second.tree_size)
            });
        }
    }
}

#[tokio::test]
async fn test_every_signed_size_verifies() {
    let log = IntegrationLog::new(1);
    grow(&log).await;

    let roots = log.signed_roots();
    let sizes: Vec<u64> = roots.iter().map(|r| r.tree_size).collect();
    assert_eq!(sizes, vec![0, 1, 3, 8, 16, 29, 30, 46]);
    check_every_proof(&log, &roots);
    assert_eq!(log.verify_log().len(), 46);
}

#[tokio::test]
async fn test_blake3_log_on_fjall() {
    let log = IntegrationLog::with_store(
        fjall_store(),
        HarnessConfig {
            settings: LogSettings {
                hasher: HasherKind::Blake3,
                ..LogSettings::default()
            },
            ..HarnessConfig::default()
        },
    );
    grow(&log).await;
    check_every_proof(&log, &log.signed_roots());
}

#[tokio::test]
async fn test_hashers_give_different_roots() {
    let sha = IntegrationLog::new(1);
    let blake = IntegrationLog::with_store(
        fjall_store(),
        HarnessConfig {
            settings: LogSettings {
                hasher: HasherKind::Blake3,
                ..LogSettings::default()
            },
            ..HarnessConfig::default()
        },
    );
    grow(&sha).await;
    grow(&blake).await;

    let a = sha.service(0).get_latest_signed_root(LOG, None).unwrap().root;
    let b = blake.service(0).get_latest_signed_root(LOG, None).unwrap().root;
    assert_eq!(a.tree_size, b.tree_size);
    assert_ne!(a.root_hash, b.root_hash);
}

#[tokio::test]
async fn test_latest_root_with_consistency_from_client_size() {
    let log = IntegrationLog::new(1);
    grow(&log).await;
    let service = log.service(0);
    let hasher = service.log_hasher(LOG).unwrap();
    let hasher = hasher.as_ref();

    // A client that last saw size 8 catches up to the latest root.
    let seen = service.get_signed_root_at_size(LOG, 8).unwrap();
    let latest = service.get_latest_signed_root(LOG, Some(8)).unwrap();
    let proof = latest.consistency.expect("consistency proof");
    verify::verify_consistency(
        hasher,
        8,
        latest.root.tree_size,
        &proof.hashes,
        &seen.root_hash,
        &latest.root.root_hash,
    )
    .unwrap();

    // Nothing to prove from the latest size itself.
    let same = service
        .get_latest_signed_root(LOG, Some(latest.root.tree_size as i64))
        .unwrap();
    assert!(same.consistency.expect("empty proof").hashes.is_empty());

    // A client ahead of the log is told so.
    let err = service.get_latest_signed_root(LOG, Some(1000)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
}

#[tokio::test]
async fn test_proofs_for_old_sizes_survive_growth() {
    let log = IntegrationLog::new(1);
    grow(&log).await;
    let service = log.service(0);

    let before = service.get_inclusion_proof(LOG, 4, 16).unwrap();
    let root_16 = service.get_signed_root_at_size(LOG, 16).unwrap();

    for i in 0..100 {
        service.queue_leaf(LOG, value(1, i)).unwrap();
    }
    log.drain(0, 0).await;

    let after = service.get_inclusion_proof(LOG, 4, 16).unwrap();
    assert_eq!(before, after);
    assert_eq!(
        service.get_signed_root_at_size(LOG, 16).unwrap().root_hash,
        root_16.root_hash
    );
    check_every_proof(&log, &log.signed_roots());
}

#[tokio::test]
async fn test_requests_beyond_committed_size() {
    let log = IntegrationLog::with_store(
        fjall_store(),
        HarnessConfig {
            sequencer: SequencerConfig {
                batch_size: 4,
                ..SequencerConfig::test_config()
            },
            ..HarnessConfig::default()
        },
    );
    for i in 0..10 {
        log.service(0).queue_leaf(LOG, value(0, i)).unwrap();
    }
    log.service(0).sequence(LOG).await.unwrap();
    let service = log.service(0);

    // Queued but unsequenced leaves are invisible to proofs.
    assert_eq!(service.get_sequenced_leaf_count(LOG).unwrap(), 4);
    let err = service.get_inclusion_proof(LOG, 5, 6).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    let err = service.get_consistency_proof(LOG, 2, 5).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    let err = service.get_inclusion_proof(LOG, 4, 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = service.get_consistency_proof(LOG, 3, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
