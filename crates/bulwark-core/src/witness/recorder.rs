//! Single-writer witness recorder.

use std::fmt;

use tracing::{debug, warn};

use super::{OpType, WitnessEntry, WitnessError, WitnessLog};
use crate::canonical;
use crate::crypto::merkle::leaf_hash;
use crate::crypto::{Digest, DomainTag, MerkleTree, domain_hash_parts};

/// Recorder lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Accepting entries.
    Recording,
    /// Sealed; the log has been handed out.
    Sealed,
    /// Capacity was exceeded; the trail is incomplete and cannot be sealed.
    Poisoned,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Recording => "recording",
            Self::Sealed => "sealed",
            Self::Poisoned => "poisoned",
        })
    }
}

/// Point-in-time recorder statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderStats {
    /// Entries appended so far.
    pub entries: u64,
    /// Summed canonical size of the entries.
    pub bytes_used: usize,
    /// Bytes left before overflow.
    pub capacity_remaining: usize,
}

/// Append-only, hash-chained recorder for one execution.
///
/// Appends take `&mut self`, so the borrow checker enforces the
/// single-writer rule.
#[derive(Debug)]
pub struct WitnessRecorder {
    entries: Vec<WitnessEntry>,
    leaves: Vec<Digest>,
    chain_head: Digest,
    max_size: usize,
    bytes_used: usize,
    now: u64,
    state: RecorderState,
}

impl WitnessRecorder {
    /// Creates a recorder with a capacity of `max_size` encoded bytes.
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            leaves: Vec::new(),
            chain_head: Digest::ZERO,
            max_size,
            bytes_used: 0,
            now: 0,
            state: RecorderState::Recording,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RecorderState {
        self.state
    }

    /// Current chain head (`h_{n-1}`, or zero when empty).
    #[must_use]
    pub const fn chain_head(&self) -> Digest {
        self.chain_head
    }

    /// Entries recorded so far.
    #[must_use]
    pub fn entries(&self) -> &[WitnessEntry] {
        &self.entries
    }

    /// Current logical time in virtual nanoseconds.
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now
    }

    /// Advances the logical clock. Saturates instead of wrapping.
    pub const fn advance_clock(&mut self, delta_ns: u64) {
        self.now = self.now.saturating_add(delta_ns);
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            entries: self.entries.len() as u64,
            bytes_used: self.bytes_used,
            capacity_remaining: self.max_size.saturating_sub(self.bytes_used),
        }
    }

    fn require_recording(&self, operation: &'static str) -> Result<(), WitnessError> {
        if self.state == RecorderState::Recording {
            Ok(())
        } else {
            Err(WitnessError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// # Errors
    ///
    /// - [`WitnessError::InvalidState`] after seal or overflow
    /// - [`WitnessError::Overflow`] when the entry does not fit; the recorder
    ///   is poisoned
    pub fn record(
        &mut self,
        op_type: OpType,
        data: impl Into<Vec<u8>>,
    ) -> Result<u64, WitnessError> {
        self.require_recording("record")?;

        let sequence = self.entries.len() as u64;
        let entry = WitnessEntry {
            sequence,
            op_type,
            data: data.into(),
            timestamp: self.now,
        };
        let encoded = canonical::encode(&entry)?;

        let attempted = self.bytes_used.saturating_add(encoded.len());
        if attempted > self.max_size {
            self.state = RecorderState::Poisoned;
            warn!(
                op_type = %op_type,
                sequence,
                attempted,
                max_size = self.max_size,
                "witness capacity exceeded, recorder poisoned"
            );
            return Err(WitnessError::Overflow {
                max_size: self.max_size,
                attempted,
            });
        }

        self.chain_head = domain_hash_parts(
            DomainTag::WitnessChain,
            &[&self.chain_head.as_bytes()[..], &encoded],
        );
        self.leaves.push(leaf_hash(&encoded));
        self.bytes_used = attempted;
        self.entries.push(entry);
        Ok(sequence)
    }

    /// Seals the recorder, returning the immutable log.
    ///
    /// # Errors
    ///
    /// [`WitnessError::InvalidState`] if already sealed or poisoned.
    pub fn seal(&mut self) -> Result<WitnessLog, WitnessError> {
        self.require_recording("seal")?;
        self.state = RecorderState::Sealed;

        let root = MerkleTree::from_leaves(std::mem::take(&mut self.leaves)).root();
        let log = WitnessLog::from_parts(std::mem::take(&mut self.entries), self.chain_head, root);
        debug!(
            entries = log.len(),
            merkle_root = %root,
            digest = %log.digest(),
            "witness log sealed"
        );
        Ok(log)
    }
}
