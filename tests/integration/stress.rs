//! Integration test: stress.
//!
//! Many concurrent writers and readers against background sequencers on a
//! persistent store. Readers only ever see committed, verifiable state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cairn_integration_tests::{HarnessConfig, IntegrationLog, LOG, fjall_store, value};
use cairn_log::SequencerConfig;
use cairn_merkle::verify;
use tokio::sync::Barrier;

/// 8 writers x 125 leaves through 2 processes while readers check proofs
/// against whatever root is latest.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writers_and_readers_under_sequencing() {
    let log = Arc::new(IntegrationLog::with_store(
        fjall_store(),
        HarnessConfig {
            processes: 2,
            sequencer: SequencerConfig {
                batch_size: 64,
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

    let barrier = Arc::new(Barrier::new(8));
    let mut writers = Vec::new();
    for writer in 0..8 {
        let log = log.clone();
        let barrier = barrier.clone();
        writers.push(tokio::spawn(async move {
            barrier.wait().await; // Start all writers simultaneously.
            for i in 0..125 {
                log.service(writer % 2)
                    .queue_leaf(LOG, value(writer, i))
                    .unwrap();
                if i % 25 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for reader in 0..2 {
        let log = log.clone();
        let stop = stop.clone();
        readers.push(tokio::spawn(async move {
            let service = log.service(reader);
            let hasher = service.log_hasher(LOG).unwrap();
            let mut checks = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let root = service.get_latest_signed_root(LOG, None).unwrap().root;
                if root.tree_size > 0 {
                    let index = checks % root.tree_size;
                    let entry = service
                        .get_entry_and_proof(LOG, index as i64, root.tree_size as i64)
                        .unwrap();
                    verify::verify_inclusion(
                        hasher.as_ref(),
                        index,
                        root.tree_size,
                        &entry.leaf.merkle_hash,
                        &entry.proof.hashes,
                        &root.root_hash,
                    )
                    .unwrap();
                    checks += 1;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            checks
        }));
    }

    for w in writers {
        w.await.unwrap();
    }
    assert!(
        log.wait_for_size(1000, Duration::from_secs(30)).await,
        "sequencers did not integrate all leaves"
    );

    stop.store(true, Ordering::Relaxed);
    let mut checks = 0;
    for r in readers {
        checks += r.await.unwrap();
    }
    assert!(checks > 0, "readers never saw a non-empty root");

    shutdown_tx.send(true).unwrap();
    for l in loops {
        l.await.unwrap();
    }

    let values = log.verify_log();
    assert_eq!(values.len(), 1000);
    for writer in 0..8 {
        let prefix = format!("writer-{writer}/");
        let count = values
            .iter()
            .filter(|v| v.starts_with(prefix.as_bytes()))
            .count();
        assert_eq!(count, 125, "writer {writer} lost leaves");
    }
}
