//! Tests shared by every [`LeafStore`] backend.


use std::sync::Arc;

use cairn_merkle::{LogHasher, MerkleTree, Rfc6962Hasher};
use cairn_types::{Leaf, LogId, LogRoot, LogSettings, SignedLogRoot, TreeHead};

use crate::{IntegrationBatch, LeafStore, LogNodes};

const LOG: LogId = LogId::new(7);

/// A leaf with the default identity.
fn leaf(value: &str) -> Leaf {
    let merkle_hash = Rfc6962Hasher.hash_leaf(value.as_bytes());
    Leaf {
        merkle_hash,
        value: value.as_bytes().to_vec(),
        extra: Vec::new(),
        identity_hash: merkle_hash,
        index: None,
        queued_at: 1,
        integrated_at: None,
    }
}

/// An unsigned root over `head`.
fn root_for(log_id: LogId, head: &TreeHead) -> SignedLogRoot {
    SignedLogRoot::new(log_id, LogRoot::from_head(head, 100 + head.revision), Vec::new())
}

fn create(store: &dyn LeafStore, log_id: LogId, settings: LogSettings) {
    let head = TreeHead {
        size: 0,
        root_hash: Rfc6962Hasher.empty_root(),
        revision: 0,
    };
    store
        .create_log(log_id, settings, &root_for(log_id, &head))
        .unwrap();
}

/// Build the batch that integrates up to `limit` queued leaves.
fn build_batch(store: &dyn LeafStore, log_id: LogId, limit: usize) -> IntegrationBatch {
    let current = store.tree_head(log_id).unwrap();
    let hasher: Arc<dyn LogHasher> = Arc::new(Rfc6962Hasher);
    let mut tree = MerkleTree::load(hasher, &LogNodes::new(store, log_id), current.size).unwrap();

    let mut sequenced = Vec::new();
    for entry in store.dequeue_batch(log_id, limit).unwrap() {
        let mut leaf = entry.leaf;
        leaf.index = Some(tree.size());
        leaf.integrated_at = Some(50);
        tree.append(leaf.merkle_hash);
        sequenced.push((entry.queue_seq, leaf));
    }

    let head = TreeHead {
        size: tree.size(),
        root_hash: tree.root(),
        revision: current.revision + 1,
    };
    IntegrationBatch {
        expected_revision: current.revision,
        head,
        sequenced,
        nodes: tree.take_written(),
        root: root_for(log_id, &head),
    }
}

/// Integrate everything queued.
fn sequence_all(store: &dyn LeafStore, log_id: LogId) -> TreeHead {
    let batch = build_batch(store, log_id, usize::MAX);
    let head = batch.head;
    store.commit_batch(log_id, batch).unwrap();
    head
}
