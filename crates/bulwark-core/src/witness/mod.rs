//! Tamper-evident witness logs.
//!
//! A [`WitnessRecorder`] is the single writer of one execution's audit
//! trail. Every appended [`WitnessEntry`] extends a rolling hash chain, and
//! [`WitnessRecorder::seal`] freezes the entries into a [`WitnessLog`] with a
//! Merkle root over the entries.
//!
//! # Chain
//!
//! ```text
//! h_-1 = 0^32
//! h_i  = domain_hash(WitnessChain, h_{i-1} ‖ encode(entry_i))
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!              record()            overflow
//!   Recording ─────────► Recording ─────────► Poisoned
//!       │                                       (no seal)
//!       │ seal()
//!       ▼
//!    Sealed  (record()/seal() fail with InvalidState)
//! ```
//!
//! # Fail-Closed Capacity
//!
//! The recorder enforces `max_size` over the summed canonical size of its
//! entries. An append that would exceed it fails with
//! [`WitnessError::Overflow`] and poisons the recorder: a partial trail is
//! never sealed, so it can never be mistaken for a complete one.

mod log;
mod recorder;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use log::WitnessLog;
pub use recorder::{RecorderState, RecorderStats, WitnessRecorder};

use crate::canonical::SerializationError;

/// Kind of observable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpType {
    /// Workload started (function entry or process spawn).
    Spawn,
    /// Generic syscall passing the filter.
    Syscall,
    /// Bytes served by the seeded generator.
    Random,
    /// Virtual clock read.
    Clock,
    /// Environment variable lookup.
    EnvRead,
    /// Read from the virtual input filesystem.
    FileRead,
    /// Write to the virtual scratch filesystem.
    FileWrite,
    /// Bytes written to stdout.
    Stdout,
    /// Bytes written to stderr.
    Stderr,
    /// Memory reservation or release.
    Memory,
    /// A syscall outside the allowlist; the run is terminated.
    PolicyViolation,
    /// A resource limit was breached; the run is terminated.
    ResourceExceeded,
    /// Deadline expired; the run is cancelled.
    Timeout,
    /// Workload finished with an exit code.
    Exit,
}

impl OpType {
    /// Stable lowercase name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Syscall => "syscall",
            Self::Random => "random",
            Self::Clock => "clock",
            Self::EnvRead => "env_read",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Memory => "memory",
            Self::PolicyViolation => "policy_violation",
            Self::ResourceExceeded => "resource_exceeded",
            Self::Timeout => "timeout",
            Self::Exit => "exit",
        }
    }

    /// Whether this entry type ends a run abnormally.
    #[must_use]
    pub const fn is_fault(self) -> bool {
        matches!(
            self,
            Self::PolicyViolation | Self::ResourceExceeded | Self::Timeout
        )
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended operation. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessEntry {
    /// Position in the log, starting at zero.
    pub sequence: u64,
    /// What happened.
    pub op_type: OpType,
    /// Canonically encoded operation details.
    pub data: Vec<u8>,
    /// Logical timestamp in virtual nanoseconds.
    pub timestamp: u64,
}

/// Witness recorder and log errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum WitnessError {
    /// Appending would exceed the configured capacity.
    #[error("witness log overflow: {attempted} bytes exceeds limit of {max_size}")]
    Overflow {
        /// Configured capacity in bytes.
        max_size: usize,
        /// Size the log would have reached.
        attempted: usize,
    },

    /// Operation not permitted in the recorder's current state.
    #[error("invalid witness recorder state: {operation} while {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Current state.
        state: RecorderState,
    },

    /// Entry could not be encoded.
    #[error("witness entry encoding failed: {0}")]
    Encoding(#[from] SerializationError),

    /// A sealed log failed re-verification.
    #[error("witness log integrity violation: {reason}")]
    IntegrityViolation {
        /// What did not match.
        reason: String,
    },
}
