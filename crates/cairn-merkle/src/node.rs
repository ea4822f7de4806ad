//! Addressing of perfect subtrees.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a perfect subtree: node `(level, index)` covers leaves
/// `[index << level, (index + 1) << level)`. Level 0 nodes are leaves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId {
    /// Height above the leaves.
    pub level: u8,
    /// Index among the nodes at this level.
    pub index: u64,
}

impl NodeId {
    /// A node at the given position.
    pub const fn new(level: u8, index: u64) -> Self {
        Self { level, index }
    }

    /// The node holding leaf `index`.
    pub const fn leaf(index: u64) -> Self {
        Self { level: 0, index }
    }

    /// The node one level up that contains this one.
    pub const fn parent(&self) -> Self {
        Self {
            level: self.level + 1,
            index: self.index >> 1,
        }
    }

    /// The other child of this node's parent.
    pub const fn sibling(&self) -> Self {
        Self {
            level: self.level,
            index: self.index ^ 1,
        }
    }

    /// Whether this node is the right child of its parent.
    pub const fn is_right_child(&self) -> bool {
        self.index & 1 == 1
    }

    /// First leaf index covered.
    pub const fn begin(&self) -> u64 {
        self.index << self.level
    }

    /// One past the last leaf index covered.
    pub const fn end(&self) -> u64 {
        (self.index + 1) << self.level
    }

    /// Fixed-width big-endian key: `level u8 | index u64`.
    pub fn to_key(&self) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = self.level;
        key[1..].copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.level, self.index)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId{self}")
    }
}

/// Decompose the leaf range `[begin, end)` into maximal perfect subtrees,
/// left to right.
///
/// For `begin == 0` this is one node per set bit of `end`, most significant
/// first: the frontier of a tree of size `end`.
pub fn compact_range(mut begin: u64, end: u64) -> Vec<NodeId> {
    let mut nodes = Vec::new();

    while begin < end {
        // Largest aligned subtree starting at `begin` that fits in the range.
        let fit = 63 - (end - begin).leading_zeros();
        let align = begin.trailing_zeros();
        let level = fit.min(align);

        nodes.push(NodeId::new(level as u8, begin >> level));
        begin += 1 << level;
    }

    nodes
}
