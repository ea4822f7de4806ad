//! Historical roots and RFC 6962 proofs from stored perfect subtrees.

use cairn_types::{NodeHash, Proof};

use crate::error::MerkleError;
use crate::hasher::LogHasher;
use crate::node::compact_range;
use crate::tree::{NodeReader, fold_right};

type Result<T> = std::result::Result<T, MerkleError>;

/// Builds roots and proofs for a tree whose committed size is `size`.
///
/// Every hash is derived from immutable perfect-subtree nodes, so a builder
/// can run concurrently with appends as long as `size` was read from a
/// committed tree head.
pub struct ProofBuilder<'a> {
    hasher: &'a dyn LogHasher,
    nodes: &'a dyn NodeReader,
    size: u64,
}

impl<'a> ProofBuilder<'a> {
    /// A builder bounded by the committed tree size.
    pub fn new(hasher: &'a dyn LogHasher, nodes: &'a dyn NodeReader, size: u64) -> Self {
        Self {
            hasher,
            nodes,
            size,
        }
    }

    /// The committed size this builder is bounded by.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Root hash of the tree truncated at `size`.
    pub fn root(&self, size: u64) -> Result<NodeHash> {
        self.check_size(size)?;
        self.range_hash(0, size)
    }

    /// Audit path for `leaf_index` in the tree of `tree_size` leaves.
    pub fn inclusion_proof(&self, leaf_index: u64, tree_size: u64) -> Result<Proof> {
        self.check_size(tree_size)?;
        if leaf_index >= tree_size {
            return Err(MerkleError::IndexOutOfRange {
                index: leaf_index,
                size: tree_size,
            });
        }

        let mut hashes = Vec::new();
        self.path(leaf_index, 0, tree_size, &mut hashes)?;
        Ok(Proof { leaf_index, hashes })
    }

    /// Proof that the tree at `first` is a prefix of the tree at `second`.
    ///
    /// Empty when `first == 0` or `first == second`.
    pub fn consistency_proof(&self, first: u64, second: u64) -> Result<Proof> {
        self.check_size(second)?;
        if first > second {
            return Err(MerkleError::SizesNotOrdered { first, second });
        }

        let mut hashes = Vec::new();
        if first > 0 && first < second {
            self.subproof(first, 0, second, true, &mut hashes)?;
        }
        Ok(Proof {
            leaf_index: 0,
            hashes,
        })
    }

    fn check_size(&self, size: u64) -> Result<()> {
        if size > self.size {
            return Err(MerkleError::SizeOutOfRange {
                requested: size,
                current: self.size,
            });
        }
        Ok(())
    }

    /// Hash of the leaves `[begin, end)`, where `begin` is aligned to the
    /// split that produced the range.
    fn range_hash(&self, begin: u64, end: u64) -> Result<NodeHash> {
        let hashes = compact_range(begin, end)
            .into_iter()
            .map(|id| self.nodes.require_node(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(fold_right(self.hasher, hashes.into_iter()))
    }

    /// RFC 6962 `PATH(m, D[begin:end])`, appended leaf-first.
    fn path(&self, m: u64, begin: u64, end: u64, out: &mut Vec<NodeHash>) -> Result<()> {
        let n = end - begin;
        if n <= 1 {
            return Ok(());
        }

        let k = split_point(n);
        if m < begin + k {
            self.path(m, begin, begin + k, out)?;
            out.push(self.range_hash(begin + k, end)?);
        } else {
            self.path(m, begin + k, end, out)?;
            out.push(self.range_hash(begin, begin + k)?);
        }
        Ok(())
    }

    /// RFC 6962 `SUBPROOF(m, D[begin:end], complete)`.
    ///
    /// `m` counts the leaves of the earlier tree that fall inside the range.
    fn subproof(
        &self,
        m: u64,
        begin: u64,
        end: u64,
        complete: bool,
        out: &mut Vec<NodeHash>,
    ) -> Result<()> {
        let n = end - begin;
        if m == n {
            if !complete {
                out.push(self.range_hash(begin, end)?);
            }
            return Ok(());
        }

        let k = split_point(n);
        if m <= k {
            self.subproof(m, begin, begin + k, complete, out)?;
            out.push(self.range_hash(begin + k, end)?);
        } else {
            self.subproof(m - k, begin + k, end, false, out)?;
            out.push(self.range_hash(begin, begin + k)?);
        }
        Ok(())
    }
}

/// Largest power of two strictly less than `n` (`n >= 2`).
fn split_point(n: u64) -> u64 {
    debug_assert!(n >= 2);
    1 << (63 - (n - 1).leading_zeros())
}
