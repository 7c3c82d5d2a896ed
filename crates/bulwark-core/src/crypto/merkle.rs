//! Binary Merkle trees over domain-separated leaves.
//!
//! ```text
//! leaf     = domain_hash(MerkleLeaf, item_bytes)
//! internal = domain_hash(MerkleInternal, left ‖ right)
//! ```
//!
//! # Odd Levels
//!
//! When a level has an odd number of nodes, the last node is promoted to the
//! next level unchanged. It is neither duplicated nor paired with a padding
//! hash. Duplication makes `[a, b, c]` and `[a, b, c, c]` share a root; this
//! convention does not.
//!
//! ```text
//!            root
//!           /    \
//!         n01     c      <- c promoted
//!        /   \    |
//!       a     b   c
//! ```
//!
//! The root of an empty tree is [`Digest::ZERO`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hash::{Digest, DomainTag, domain_hash, domain_hash_parts};

/// Maximum number of siblings accepted in a proof (trees of up to 2^64
/// leaves).
pub const MAX_PROOF_DEPTH: usize = 64;

/// Merkle tree errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    /// Requested leaf index is out of range.
    #[error("leaf index {index} out of range for {leaf_count} leaves")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of leaves in the tree.
        leaf_count: usize,
    },

    /// Proof has more siblings than any supported tree.
    #[error("proof depth {depth} exceeds maximum {max}")]
    ProofTooDeep {
        /// Siblings in the proof.
        depth: usize,
        /// Limit.
        max: usize,
    },

    /// The siblings do not fit the path of `leaf_index` in a tree of the
    /// claimed size.
    #[error("proof path does not match leaf {index} of {leaf_count}")]
    PathMismatch {
        /// Claimed leaf index.
        index: u64,
        /// Claimed number of leaves.
        leaf_count: u64,
    },

    /// Recomputed root does not match.
    #[error("reconstructed root does not match expected root")]
    RootMismatch,
}

/// Leaf hash for raw item bytes.
#[must_use]
pub fn leaf_hash(item: &[u8]) -> Digest {
    domain_hash(DomainTag::MerkleLeaf, item)
}

/// Internal node hash.
#[must_use]
pub fn internal_hash(left: &Digest, right: &Digest) -> Digest {
    domain_hash_parts(
        DomainTag::MerkleInternal,
        &[&left.as_bytes()[..], &right.as_bytes()[..]],
    )
}

/// A fully materialized Merkle tree.
///
/// `levels[0]` holds the leaf hashes and the last level holds the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Builds a tree from raw item bytes.
    pub fn from_items<I, B>(items: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        Self::from_leaves(items.into_iter().map(|item| leaf_hash(item.as_ref())).collect())
    }

    /// Builds a tree from precomputed leaf hashes.
    #[must_use]
    pub fn from_leaves(leaves: Vec<Digest>) -> Self {
        let mut levels = vec![leaves];
        while levels.last().is_some_and(|level| level.len() > 1) {
            let current = &levels[levels.len() - 1];
            let next: Vec<Digest> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => internal_hash(left, right),
                    _ => pair[0],
                })
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    /// Number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Leaf hashes in insertion order.
    #[must_use]
    pub fn leaves(&self) -> &[Digest] {
        &self.levels[0]
    }

    /// Root digest; [`Digest::ZERO`] for an empty tree.
    #[must_use]
    pub fn root(&self) -> Digest {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(Digest::ZERO)
    }

    /// Inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Result<MerkleProof, MerkleError> {
        let leaf_count = self.leaf_count();
        if index >= leaf_count {
            return Err(MerkleError::IndexOutOfRange { index, leaf_count });
        }

        let mut siblings = Vec::new();
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = position ^ 1;
            if sibling < level.len() {
                siblings.push(MerkleProofSibling {
                    hash: level[sibling],
                    is_left: sibling < position,
                });
            }
            position /= 2;
        }

        Ok(MerkleProof {
            leaf_index: index as u64,
            leaf_hash: self.levels[0][index],
            siblings,
        })
    }
}

/// A sibling on the path from a leaf to the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MerkleProofSibling {
    /// Hash of the sibling node.
    pub hash: Digest,
    /// Whether the sibling sits to the left of the path node.
    pub is_left: bool,
}

/// Merkle inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the proven leaf.
    pub leaf_index: u64,
    /// Hash of the proven leaf.
    pub leaf_hash: Digest,
    /// Siblings from leaf level to root. Levels where the path node was
    /// promoted contribute no sibling.
    pub siblings: Vec<MerkleProofSibling>,
}

impl MerkleProof {
    /// Recomputes the root of a tree with `leaf_count` leaves.
    ///
    /// The side of each sibling and the levels that contribute none are
    /// derived from `leaf_index` and `leaf_count`; the `is_left` flags must
    /// agree with that path.
    pub fn compute_root(&self, leaf_count: u64) -> Result<Digest, MerkleError> {
        if self.siblings.len() > MAX_PROOF_DEPTH {
            return Err(MerkleError::ProofTooDeep {
                depth: self.siblings.len(),
                max: MAX_PROOF_DEPTH,
            });
        }
        if self.leaf_index >= leaf_count {
            return Err(MerkleError::IndexOutOfRange {
                index: usize::try_from(self.leaf_index).unwrap_or(usize::MAX),
                leaf_count: usize::try_from(leaf_count).unwrap_or(usize::MAX),
            });
        }
        let mismatch = || MerkleError::PathMismatch {
            index: self.leaf_index,
            leaf_count,
        };

        let mut siblings = self.siblings.iter();
        let mut current = self.leaf_hash;
        let mut position = self.leaf_index;
        let mut width = leaf_count;
        while width > 1 {
            let pair = position ^ 1;
            if pair < width {
                let sibling = siblings.next().ok_or_else(mismatch)?;
                let is_left = pair < position;
                if sibling.is_left != is_left {
                    return Err(mismatch());
                }
                current = if is_left {
                    internal_hash(&sibling.hash, &current)
                } else {
                    internal_hash(&current, &sibling.hash)
                };
            }
            position /= 2;
            width = width.div_ceil(2);
        }
        if siblings.next().is_some() {
            return Err(mismatch());
        }
        Ok(current)
    }

    /// Verifies the proof against `expected_root` of a tree with
    /// `leaf_count` leaves.
    pub fn verify(&self, expected_root: &Digest, leaf_count: u64) -> Result<(), MerkleError> {
        if self.compute_root(leaf_count)?.ct_eq(expected_root) {
            Ok(())
        } else {
            Err(MerkleError::RootMismatch)
        }
    }

    /// Verifies that `item` is the proven leaf and that the proof reaches
    /// `expected_root`.
    pub fn verify_item(
        &self,
        item: &[u8],
        expected_root: &Digest,
        leaf_count: u64,
    ) -> Result<(), MerkleError> {
        if !leaf_hash(item).ct_eq(&self.leaf_hash) {
            return Err(MerkleError::RootMismatch);
        }
        self.verify(expected_root, leaf_count)
    }
}
