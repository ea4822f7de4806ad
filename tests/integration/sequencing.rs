//! Integration test: sequencing across processes.
//!
//! Several services share one store. Writers queue through different
//! processes while the processes race to sequence; every leaf must end up
//! in the tree exactly once, in a tree every root of which verifies.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cairn_integration_tests::{HarnessConfig, IntegrationLog, LOG, fjall_store, value};
use cairn_log::SequencerConfig;
use cairn_types::{LeafInput, LogSettings, QueueStatus};

/// 4 processes, 4 writers, 4 sequencing tasks racing over one memory store.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_and_sequencers() {
    let log = Arc::new(IntegrationLog::new(4));

    let mut writers = Vec::new();
    for writer in 0..4 {
        let log = log.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..100 {
                let outcome = log
                    .service(writer)
                    .queue_leaf(LOG, value(writer, i))
                    .unwrap();
                assert_eq!(outcome.status, QueueStatus::Queued);
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let mut sequencers = Vec::new();
    for process in 0..4 {
        let log = log.clone();
        sequencers.push(tokio::spawn(async move {
            let mut integrated = 0;
            for _ in 0..20 {
                integrated += log.service(process).sequence(LOG).await.unwrap().leaves;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            integrated
        }));
    }

    for w in writers {
        w.await.unwrap();
    }
    let mut integrated: usize = 0;
    for s in sequencers {
        integrated += s.await.unwrap();
    }
    integrated += log.drain(0, 0).await;
    assert_eq!(integrated, 400);

    let values = log.verify_log();
    assert_eq!(values.len(), 400);
    let unique: HashSet<_> = values.iter().collect();
    assert_eq!(unique.len(), 400, "a leaf was integrated twice");

    // Each writer's leaves keep their submission order.
    for writer in 0..4 {
        let prefix = format!("writer-{writer}/");
        let own: Vec<_> = values
            .iter()
            .filter(|v| v.starts_with(prefix.as_bytes()))
            .collect();
        for (i, v) in own.iter().enumerate() {
            assert_eq!(**v, value(writer, i).value);
        }
    }
}

/// The same leaf submitted through every process at once is stored once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_submissions_across_processes() {
    let log = Arc::new(IntegrationLog::new(4));

    let mut handles = Vec::new();
    for process in 0..4 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            let mut statuses = Vec::new();
            for i in 0..25 {
                let outcome = log
                    .service(process)
                    .queue_leaf(LOG, LeafInput::new(format!("shared-{i}")))
                    .unwrap();
                statuses.push(outcome.status);
            }
            statuses
        }));
    }

    let mut queued = 0;
    for h in handles {
        queued += h
            .await
            .unwrap()
            .into_iter()
            .filter(|s| *s == QueueStatus::Queued)
            .count();
    }
    assert_eq!(queued, 25, "each identity must be queued exactly once");

    log.drain(0, 0).await;
    assert_eq!(log.verify_log().len(), 25);

    // After sequencing, resubmission returns the sequenced leaf.
    let again = log
        .service(3)
        .queue_leaf(LOG, LeafInput::new("shared-7"))
        .unwrap();
    assert_eq!(again.status, QueueStatus::AlreadyExists);
    assert!(again.leaf.index.is_some());
}

/// Duplicates are admitted as separate leaves when the log allows them.
#[tokio::test]
async fn test_duplicates_allowed_by_settings() {
    let log = IntegrationLog::with_store(
        fjall_store(),
        HarnessConfig {
            processes: 2,
            settings: LogSettings {
                allow_duplicates: true,
                ..LogSettings::default()
            },
            ..HarnessConfig::default()
        },
    );

    for process in 0..2 {
        for _ in 0..3 {
            let outcome = log
                .service(process)
                .queue_leaf(LOG, LeafInput::new("same"))
                .unwrap();
            assert_eq!(outcome.status, QueueStatus::Queued);
        }
    }
    log.drain(1, 0).await;

    let values = log.verify_log();
    assert_eq!(values, vec![b"same".to_vec(); 6]);
    let proofs = log
        .service(0)
        .get_inclusion_proof_by_hash(LOG, log.signed_roots()[1].root_hash.as_bytes(), 6);
    // A root hash is not a leaf hash.
    assert!(proofs.is_err());

    let leaf_hash = log.service(0).get_leaves_by_range(LOG, 0, 1).unwrap()[0].merkle_hash;
    let proofs = log
        .service(0)
        .get_inclusion_proof_by_hash(LOG, leaf_hash.as_bytes(), 6)
        .unwrap();
    let indices: Vec<_> = proofs.iter().map(|p| p.leaf_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
}

/// Background loops in three processes share the work through the lease.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_background_sequencers_share_lease() {
    let log = Arc::new(IntegrationLog::with_store(
        fjall_store(),
        HarnessConfig {
            processes: 3,
            sequencer: SequencerConfig {
                batch_size: 8,
                interval: Duration::from_millis(5),
                ..SequencerConfig::test_config()
            },
            ..HarnessConfig::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loops: Vec<_> = (0..log.len())
        .map(|i| log.service(i).spawn_sequencer(shutdown_rx.clone()))
        .collect();

    for i in 0..120 {
        log.service(i % 3).queue_leaf(LOG, value(i % 3, i)).unwrap();
    }
    assert!(
        log.wait_for_size(120, Duration::from_secs(10)).await,
        "background sequencers did not catch up"
    );

    shutdown_tx.send(true).unwrap();
    for l in loops {
        tokio::time::timeout(Duration::from_secs(5), l)
            .await
            .expect("sequencer loop did not stop")
            .unwrap();
    }

    let stats: u64 = (0..log.len())
        .map(|i| log.service(i).sequencer().stats().leaves)
        .sum();
    assert_eq!(stats, 120);
    assert_eq!(log.verify_log().len(), 120);
}
