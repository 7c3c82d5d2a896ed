//! Sealed witness logs.

use serde::{Deserialize, Serialize};

use super::{OpType, WitnessEntry, WitnessError};
use crate::canonical;
use crate::crypto::{Digest, DomainTag, MerkleProof, MerkleTree, domain_hash_parts};

/// A sealed, immutable witness log.
///
/// Only [`WitnessRecorder::seal`](super::WitnessRecorder::seal) creates
/// logs; there is no mutating API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessLog {
    entries: Vec<WitnessEntry>,
    chain_head: Digest,
    merkle_root: Digest,
}

impl WitnessLog {
    pub(super) const fn from_parts(
        entries: Vec<WitnessEntry>,
        chain_head: Digest,
        merkle_root: Digest,
    ) -> Self {
        Self {
            entries,
            chain_head,
            merkle_root,
        }
    }

    /// Entries in sequence order.
    #[must_use]
    pub fn entries(&self) -> &[WitnessEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Final chain hash.
    #[must_use]
    pub const fn chain_head(&self) -> Digest {
        self.chain_head
    }

    /// Merkle root over the entries.
    #[must_use]
    pub const fn merkle_root(&self) -> Digest {
        self.merkle_root
    }

    /// Digest identifying the whole sealed log:
    /// `domain_hash(WitnessSeal, root ‖ chain_head ‖ count_le)`.
    #[must_use]
    pub fn digest(&self) -> Digest {
        let count = (self.entries.len() as u64).to_le_bytes();
        domain_hash_parts(
            DomainTag::WitnessSeal,
            &[
                &self.merkle_root.as_bytes()[..],
                &self.chain_head.as_bytes()[..],
                &count[..],
            ],
        )
    }

    /// Entries of one operation type.
    pub fn entries_of(&self, op_type: OpType) -> impl Iterator<Item = &WitnessEntry> + '_ {
        self.entries.iter().filter(move |e| e.op_type == op_type)
    }

    /// The last fault entry (`PolicyViolation`, `ResourceExceeded` or
    /// `Timeout`), if the run ended abnormally.
    #[must_use]
    pub fn termination_fault(&self) -> Option<&WitnessEntry> {
        self.entries.iter().rev().find(|e| e.op_type.is_fault())
    }

    fn tree(&self) -> Result<MerkleTree, WitnessError> {
        let encoded = self
            .entries
            .iter()
            .map(canonical::encode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MerkleTree::from_items(encoded))
    }

    /// Inclusion proof for the entry at `index`.
    pub fn inclusion_proof(&self, index: usize) -> Result<MerkleProof, WitnessError> {
        self.tree()?
            .proof(index)
            .map_err(|e| WitnessError::IntegrityViolation {
                reason: e.to_string(),
            })
    }

    /// Whether `proof` shows `entry` is part of this log.
    #[must_use]
    pub fn verify_inclusion(&self, entry: &WitnessEntry, proof: &MerkleProof) -> bool {
        if proof.leaf_index != entry.sequence {
            return false;
        }
        let Ok(encoded) = canonical::encode(entry) else {
            return false;
        };
        proof
            .verify_item(&encoded, &self.merkle_root, self.entries.len() as u64)
            .is_ok()
    }

    /// Recomputes sequence numbers, the hash chain and the Merkle root.
    ///
    /// Used by auditors on logs that crossed a trust boundary.
    pub fn verify_integrity(&self) -> Result<(), WitnessError> {
        let mut head = Digest::ZERO;
        let mut last_timestamp = 0u64;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.sequence != index as u64 {
                return Err(WitnessError::IntegrityViolation {
                    reason: format!("entry {index} has sequence {}", entry.sequence),
                });
            }
            if entry.timestamp < last_timestamp {
                return Err(WitnessError::IntegrityViolation {
                    reason: format!("entry {index} timestamp goes backwards"),
                });
            }
            last_timestamp = entry.timestamp;
            let encoded = canonical::encode(entry)?;
            head = domain_hash_parts(DomainTag::WitnessChain, &[&head.as_bytes()[..], &encoded]);
        }
        if !head.ct_eq(&self.chain_head) {
            return Err(WitnessError::IntegrityViolation {
                reason: "chain head mismatch".into(),
            });
        }
        if !self.tree()?.root().ct_eq(&self.merkle_root) {
            return Err(WitnessError::IntegrityViolation {
                reason: "merkle root mismatch".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::witness::WitnessRecorder;

    fn sealed(n: usize) -> WitnessLog {
        let mut recorder = WitnessRecorder::new(1 << 20);
        for i in 0..n {
            recorder.advance_clock(1_000);
            recorder
                .record(OpType::Syscall, (i as u32).to_le_bytes().to_vec())
                .unwrap();
        }
        recorder.seal().unwrap()
    }

    #[test]
    fn empty_log_has_zero_root() {
        let log = sealed(0);
        assert!(log.is_empty());
        assert_eq!(log.merkle_root(), Digest::ZERO);
        assert_eq!(log.chain_head(), Digest::ZERO);
        log.verify_integrity().unwrap();
    }

    #[test]
    fn integrity_detects_tampering() {
        let log = sealed(4);
        log.verify_integrity().unwrap();

        let mut tampered = log.clone();
        tampered.entries[2].data[0] ^= 0xff;
        assert!(matches!(
            tampered.verify_integrity(),
            Err(WitnessError::IntegrityViolation { .. })
        ));

        let mut reordered = log;
        reordered.entries.swap(1, 2);
        assert!(reordered.verify_integrity().is_err());
    }

    #[test]
    fn digest_depends_on_every_entry() {
        let a = sealed(3);
        let b = sealed(4);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn proof_bound_to_sequence() {
        let log = sealed(5);
        let proof = log.inclusion_proof(1).unwrap();
        assert!(log.verify_inclusion(&log.entries()[1], &proof));
        assert!(!log.verify_inclusion(&log.entries()[2], &proof));
    }

    #[test]
    fn fault_lookup() {
        let mut recorder = WitnessRecorder::new(1 << 20);
        recorder.record(OpType::Spawn, vec![]).unwrap();
        recorder.record(OpType::Timeout, vec![]).unwrap();
        let log = recorder.seal().unwrap();
        assert_eq!(log.termination_fault().map(|e| e.op_type), Some(OpType::Timeout));
        assert_eq!(log.entries_of(OpType::Spawn).count(), 1);
    }

    #[test]
    fn serde_round_trip_preserves_digest() {
        let log = sealed(3);
        let bytes = canonical::encode(&log).unwrap();
        let back: WitnessLog = canonical::decode(&bytes).unwrap();
        assert_eq!(back.digest(), log.digest());
        back.verify_integrity().unwrap();
    }

    proptest! {
        #[test]
        fn every_entry_has_valid_proof(n in 1usize..40, pick in any::<prop::sample::Index>()) {
            let log = sealed(n);
            let index = pick.index(n);
            let proof = log.inclusion_proof(index).unwrap();
            prop_assert!(log.verify_inclusion(&log.entries()[index], &proof));

            let mut mutated = log.entries()[index].clone();
            mutated.data.push(0);
            prop_assert!(!log.verify_inclusion(&mutated, &proof));
        }
    }
}
