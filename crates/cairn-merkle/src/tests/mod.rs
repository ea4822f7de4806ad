//! Tests for the Merkle crate.


use std::sync::Arc;

use cairn_types::NodeHash;

use crate::hasher::{LogHasher, Rfc6962Hasher};
use crate::tree::{MemoryNodes, MerkleTree};

/// Leaf payloads of the RFC 6962 reference test vector.
fn rfc_leaves() -> Vec<Vec<u8>> {
    [
        "",
        "00",
        "10",
        "2021",
        "3031",
        "40414243",
        "5051525354555657",
        "606162636465666768696a6b6c6d6e6f",
    ]
    .iter()
    .map(|h| hex::decode(h).unwrap())
    .collect()
}

/// Deterministic payload for leaf `i`.
fn leaf_data(i: u64) -> Vec<u8> {
    format!("leaf-{i}").into_bytes()
}

/// Build a tree of `size` generated leaves, persisting every written node.
fn build_tree(size: u64) -> (MerkleTree, MemoryNodes, Vec<NodeHash>) {
    let hasher: Arc<dyn LogHasher> = Arc::new(Rfc6962Hasher);
    let mut tree = MerkleTree::new(Arc::clone(&hasher));
    let mut nodes = MemoryNodes::new();
    let mut leaves = Vec::new();

    for i in 0..size {
        let leaf = hasher.hash_leaf(&leaf_data(i));
        leaves.push(leaf);
        tree.append(leaf);
    }
    nodes.extend(tree.take_written());

    (tree, nodes, leaves)
}

/// RFC 6962 `MTH` computed directly from the leaf hashes.
fn reference_root(hasher: &dyn LogHasher, leaves: &[NodeHash]) -> NodeHash {
    match leaves.len() {
        0 => hasher.empty_root(),
        1 => leaves[0],
        n => {
            let k = n.next_power_of_two() / 2;
            let left = reference_root(hasher, &leaves[..k]);
            let right = reference_root(hasher, &leaves[k..]);
            hasher.hash_children(&left, &right)
        }
    }
}
