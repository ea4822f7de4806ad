//! The append-only frontier and node storage seam.

use std::collections::HashMap;
use std::sync::Arc;

use cairn_types::NodeHash;

use crate::error::MerkleError;
use crate::hasher::LogHasher;
use crate::node::{NodeId, compact_range};

type Result<T> = std::result::Result<T, MerkleError>;

/// Read access to stored perfect-subtree hashes.
///
/// Nodes are write-once, so readers never need to coordinate with the writer
/// beyond bounding requests by a committed tree size.
pub trait NodeReader {
    /// Fetch a node. Returns `None` if it has not been written.
    fn read_node(&self, id: NodeId) -> Result<Option<NodeHash>>;

    /// Fetch a node that must exist.
    fn require_node(&self, id: NodeId) -> Result<NodeHash> {
        self.read_node(id)?.ok_or(MerkleError::MissingNode(id))
    }
}

/// In-memory node arena keyed by `(level, index)`.
#[derive(Debug, Default, Clone)]
pub struct MemoryNodes {
    nodes: HashMap<NodeId, NodeHash>,
}

impl MemoryNodes {
    /// An empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add nodes produced by [`MerkleTree::take_written`].
    ///
    /// Existing nodes are kept: a position is never overwritten.
    pub fn extend(&mut self, nodes: impl IntoIterator<Item = (NodeId, NodeHash)>) {
        for (id, hash) in nodes {
            self.nodes.entry(id).or_insert(hash);
        }
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeReader for MemoryNodes {
    fn read_node(&self, id: NodeId) -> Result<Option<NodeHash>> {
        Ok(self.nodes.get(&id).copied())
    }
}

/// Right edge of an append-only Merkle tree.
///
/// Holds the perfect subtrees of the [`compact_range`] decomposition of the
/// current size. Appending a leaf completes zero or more new perfect
/// subtrees; each is recorded once in the write set returned by
/// [`take_written`](Self::take_written), which the caller persists together
/// with the leaves.
pub struct MerkleTree {
    hasher: Arc<dyn LogHasher>,
    size: u64,
    /// Perfect subtree roots, left to right, strictly decreasing in level.
    frontier: Vec<(NodeId, NodeHash)>,
    /// Nodes completed since the last `take_written`.
    written: Vec<(NodeId, NodeHash)>,
}

impl MerkleTree {
    /// An empty tree.
    pub fn new(hasher: Arc<dyn LogHasher>) -> Self {
        Self {
            hasher,
            size: 0,
            frontier: Vec::new(),
            written: Vec::new(),
        }
    }

    /// Rebuild the frontier of a tree of `size` leaves from stored nodes.
    pub fn load(hasher: Arc<dyn LogHasher>, nodes: &dyn NodeReader, size: u64) -> Result<Self> {
        let frontier = compact_range(0, size)
            .into_iter()
            .map(|id| nodes.require_node(id).map(|hash| (id, hash)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            hasher,
            size,
            frontier,
            written: Vec::new(),
        })
    }

    /// Number of leaves appended.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The hasher this tree was built with.
    pub fn hasher(&self) -> &Arc<dyn LogHasher> {
        &self.hasher
    }

    /// Root hash at the current size.
    pub fn root(&self) -> NodeHash {
        fold_right(self.hasher.as_ref(), self.frontier.iter().map(|(_, h)| *h))
    }

    /// Append a leaf hash on the right edge. Returns the new size.
    pub fn append(&mut self, leaf_hash: NodeHash) -> u64 {
        let mut id = NodeId::leaf(self.size);
        let mut hash = leaf_hash;
        self.written.push((id, hash));

        while id.is_right_child() {
            let Some((left_id, left)) = self.frontier.pop() else {
                break;
            };
            debug_assert_eq!(left_id, id.sibling());

            hash = self.hasher.hash_children(&left, &hash);
            id = id.parent();
            self.written.push((id, hash));
        }

        self.frontier.push((id, hash));
        self.size += 1;
        self.size
    }

    /// Nodes completed since the last call to [`take_written`](Self::take_written).
    pub fn written(&self) -> &[(NodeId, NodeHash)] {
        &self.written
    }

    /// Drain the write set.
    pub fn take_written(&mut self) -> Vec<(NodeId, NodeHash)> {
        std::mem::take(&mut self.written)
    }
}

/// Combine subtree hashes listed left to right into one root.
///
/// Folds from the right, so the result matches the RFC 6962 tree hash where
/// each left subtree is the largest power of two.
pub(crate) fn fold_right(
    hasher: &dyn LogHasher,
    hashes: impl DoubleEndedIterator<Item = NodeHash>,
) -> NodeHash {
    let mut iter = hashes.rev();
    let Some(mut acc) = iter.next() else {
        return hasher.empty_root();
    };

    for left in iter {
        acc = hasher.hash_children(&left, &acc);
    }
    acc
}
