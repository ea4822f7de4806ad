//! Client-side proof verification (RFC 9162 §2.1.3.2 and §2.1.4.2).

use cairn_types::NodeHash;

use crate::error::MerkleError;
use crate::hasher::LogHasher;

type Result<T> = std::result::Result<T, MerkleError>;

/// Recompute the root implied by an inclusion proof.
pub fn root_from_inclusion_proof(
    hasher: &dyn LogHasher,
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &NodeHash,
    proof: &[NodeHash],
) -> Result<NodeHash> {
    if leaf_index >= tree_size {
        return Err(MerkleError::IndexOutOfRange {
            index: leaf_index,
            size: tree_size,
        });
    }

    let mut fnode = leaf_index;
    let mut snode = tree_size - 1;
    let mut root = *leaf_hash;

    for sibling in proof {
        if snode == 0 {
            return Err(MerkleError::Verification("inclusion proof too long"));
        }

        if fnode & 1 == 1 || fnode == snode {
            root = hasher.hash_children(sibling, &root);
            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            root = hasher.hash_children(&root, sibling);
        }

        fnode >>= 1;
        snode >>= 1;
    }

    if snode != 0 {
        return Err(MerkleError::Verification("inclusion proof too short"));
    }
    Ok(root)
}

/// Check that `leaf_hash` is the leaf at `leaf_index` of the tree with `root`.
pub fn verify_inclusion(
    hasher: &dyn LogHasher,
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &NodeHash,
    proof: &[NodeHash],
    root: &NodeHash,
) -> Result<()> {
    let computed = root_from_inclusion_proof(hasher, leaf_index, tree_size, leaf_hash, proof)?;
    if computed != *root {
        return Err(MerkleError::Verification("inclusion proof root mismatch"));
    }
    Ok(())
}

/// Check that the tree `(first, first_root)` is a prefix of
/// `(second, second_root)`.
pub fn verify_consistency(
    hasher: &dyn LogHasher,
    first: u64,
    second: u64,
    proof: &[NodeHash],
    first_root: &NodeHash,
    second_root: &NodeHash,
) -> Result<()> {
    if first > second {
        return Err(MerkleError::SizesNotOrdered { first, second });
    }

    if first == second {
        if !proof.is_empty() {
            return Err(MerkleError::Verification("proof for equal sizes is not empty"));
        }
        if first_root != second_root {
            return Err(MerkleError::Verification("roots differ at equal sizes"));
        }
        return Ok(());
    }

    // Every tree extends the empty tree.
    if first == 0 {
        if !proof.is_empty() {
            return Err(MerkleError::Verification("proof from empty tree is not empty"));
        }
        return Ok(());
    }

    if proof.is_empty() {
        return Err(MerkleError::Verification("consistency proof is empty"));
    }

    // A power-of-two first tree is itself a node of the second; its root is
    // left out of the proof.
    let mut path = Vec::with_capacity(proof.len() + 1);
    if first.is_power_of_two() {
        path.push(*first_root);
    }
    path.extend_from_slice(proof);

    let mut fnode = first - 1;
    let mut snode = second - 1;
    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut first_hash = path[0];
    let mut second_hash = path[0];

    for node in &path[1..] {
        if snode == 0 {
            return Err(MerkleError::Verification("consistency proof too long"));
        }

        if fnode & 1 == 1 || fnode == snode {
            first_hash = hasher.hash_children(node, &first_hash);
            second_hash = hasher.hash_children(node, &second_hash);
            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            second_hash = hasher.hash_children(&second_hash, node);
        }

        fnode >>= 1;
        snode >>= 1;
    }

    if snode != 0 {
        return Err(MerkleError::Verification("consistency proof too short"));
    }
    if first_hash != *first_root {
        return Err(MerkleError::Verification("first root mismatch"));
    }
    if second_hash != *second_root {
        return Err(MerkleError::Verification("second root mismatch"));
    }
    Ok(())
}
