//! Tests for the log engine.


use std::sync::Arc;

use cairn_store::{LeafStore, MemoryLeafStore};
use cairn_types::{FakeTimeSource, LeafInput, LogId, LogSettings};

use crate::{Ed25519Signer, Ed25519Verifier, LogService, LogServiceConfig, SequencerConfig};

const LOG: LogId = LogId::new(1);

/// A service over a memory store with a fake clock.
struct TestLog {
    service: LogService,
    clock: Arc<FakeTimeSource>,
    verifier: Ed25519Verifier,
}

fn setup() -> TestLog {
    setup_with(
        SequencerConfig::test_config(),
        Arc::new(MemoryLeafStore::new()),
        LogSettings::default(),
    )
}

fn setup_with(
    sequencer: SequencerConfig,
    store: Arc<dyn LeafStore>,
    settings: LogSettings,
) -> TestLog {
    let clock = Arc::new(FakeTimeSource::new(1_000_000));
    let signer = Ed25519Signer::from_bytes(&[9u8; 32]);
    let verifier = signer.verifier();

    let config = LogServiceConfig { sequencer };
    let service = LogService::new(config, store, Arc::new(signer), clock.clone());
    if store_is_empty(&service) {
        service.init_log(LOG, settings).unwrap();
    }

    TestLog {
        service,
        clock,
        verifier,
    }
}

fn store_is_empty(service: &LogService) -> bool {
    service.store().tree_head(LOG).is_err()
}

fn input(value: &str) -> LeafInput {
    LeafInput::new(value.as_bytes().to_vec())
}

/// Queue `values` and integrate them in one pass.
async fn queue_and_sequence(log: &TestLog, values: &[&str]) {
    for value in values {
        log.service.queue_leaf(LOG, input(value)).unwrap();
    }
    log.service.sequence(LOG).await.unwrap();
}
