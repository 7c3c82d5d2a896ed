//! Merkle batches of receipts for ledger anchoring.

use super::{Receipt, ReceiptError};
use crate::crypto::merkle::leaf_hash;
use crate::crypto::{Digest, DomainTag, MerkleProof, MerkleTree, domain_hash_parts};

/// An ordered batch of receipts committed to by a single root.
///
/// Leaves are the receipts' signing digests. The published root binds the
/// Merkle root to the batch size under the `ReceiptRoot` tag, so a batch
/// root can never be confused with any other tree's root.
#[derive(Debug, Clone)]
pub struct ReceiptBatch {
    receipts: Vec<Receipt>,
    tree: MerkleTree,
}

impl ReceiptBatch {
    /// Builds a batch.
    ///
    /// # Errors
    ///
    /// [`ReceiptError::Serialization`] if a receipt cannot be encoded.
    pub fn new(receipts: Vec<Receipt>) -> Result<Self, ReceiptError> {
        let digests = receipts
            .iter()
            .map(Receipt::signing_digest)
            .collect::<Result<Vec<_>, _>>()?;
        let tree = MerkleTree::from_items(digests.iter().map(Digest::as_bytes));
        Ok(Self { receipts, tree })
    }

    /// Receipts in batch order.
    #[must_use]
    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    /// Number of receipts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    /// Unbound Merkle root over the receipt digests.
    #[must_use]
    pub fn merkle_root(&self) -> Digest {
        self.tree.root()
    }

    /// `domain_hash(ReceiptRoot, merkle_root ‖ count_le)`.
    #[must_use]
    pub fn root(&self) -> Digest {
        bound_root(&self.tree.root(), self.receipts.len() as u64)
    }

    /// Inclusion proof for the receipt at `index`.
    ///
    /// # Errors
    ///
    /// [`ReceiptError::Batch`] if `index` is out of range.
    pub fn proof(&self, index: usize) -> Result<MerkleProof, ReceiptError> {
        Ok(self.tree.proof(index)?)
    }

    /// Checks that `receipt` is in the batch with bound root `root` and size
    /// `count`, using only the proof.
    #[must_use]
    pub fn verify_member(receipt: &Receipt, proof: &MerkleProof, root: &Digest, count: u64) -> bool {
        if proof.leaf_index >= count {
            return false;
        }
        let Ok(digest) = receipt.signing_digest() else {
            return false;
        };
        if !leaf_hash(digest.as_bytes()).ct_eq(&proof.leaf_hash) {
            return false;
        }
        let Ok(merkle_root) = proof.compute_root(count) else {
            return false;
        };
        bound_root(&merkle_root, count).ct_eq(root)
    }
}

fn bound_root(merkle_root: &Digest, count: u64) -> Digest {
    let count = count.to_le_bytes();
    domain_hash_parts(
        DomainTag::ReceiptRoot,
        &[&merkle_root.as_bytes()[..], &count[..]],
    )
}
