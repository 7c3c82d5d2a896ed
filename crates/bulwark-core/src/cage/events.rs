//! Typed payloads for cage witness entries.

use serde::{Deserialize, Serialize};

use super::{ResourceKind, Syscall};
use crate::canonical::{self, SerializationError};
use crate::crypto::Digest;
use crate::witness::{OpType, WitnessEntry};

/// What was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Workload {
    /// An in-process function.
    Function,
    /// A child process.
    Command {
        /// Program and arguments.
        argv: Vec<String>,
    },
}

/// Direction of a memory event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryOp {
    /// Reservation (`mmap`).
    Reserve,
    /// Release (`munmap`).
    Release,
}

/// An observable cage operation.
///
/// The canonical encoding of an event is the `data` of its witness entry;
/// the variant determines the entry's [`OpType`]. Bulk data (random bytes,
/// file contents, output) is witnessed by length and content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CageEvent {
    /// Workload started.
    Spawn {
        /// What was started.
        workload: Workload,
    },
    /// Generic allowed syscall.
    Syscall {
        /// Which one.
        syscall: Syscall,
    },
    /// Random bytes served.
    Random {
        /// Number of bytes.
        len: u64,
        /// Digest of the bytes.
        digest: Digest,
    },
    /// Virtual clock read.
    Clock {
        /// Value returned.
        now_ns: u64,
    },
    /// Environment lookup.
    EnvRead {
        /// Variable name.
        name: String,
        /// Whether it was set.
        present: bool,
    },
    /// Virtual file read. `digest` is `None` when the file does not exist.
    FileRead {
        /// Path requested.
        path: String,
        /// Bytes returned.
        len: u64,
        /// Digest of the contents.
        digest: Option<Digest>,
    },
    /// Virtual file write.
    FileWrite {
        /// Path written.
        path: String,
        /// Bytes written.
        len: u64,
        /// Digest of the contents.
        digest: Digest,
    },
    /// Stdout output.
    Stdout {
        /// Bytes written.
        len: u64,
        /// Digest of the bytes.
        digest: Digest,
    },
    /// Stderr output.
    Stderr {
        /// Bytes written.
        len: u64,
        /// Digest of the bytes.
        digest: Digest,
    },
    /// Memory accounting.
    Memory {
        /// Reserve or release.
        op: MemoryOp,
        /// Bytes requested.
        bytes: u64,
        /// Reserved total afterwards.
        current: u64,
    },
    /// Disallowed syscall or kernel filter kill.
    PolicyViolation {
        /// Offending syscall, when known.
        syscall: Option<Syscall>,
        /// Terminating signal, for commands.
        signal: Option<i32>,
    },
    /// Limit breached.
    ResourceExceeded {
        /// Which resource.
        kind: ResourceKind,
        /// Configured limit.
        limit: u64,
        /// Value that would have been reached.
        observed: u64,
    },
    /// Deadline expired.
    Timeout {
        /// Deadline in milliseconds.
        deadline_ms: u64,
    },
    /// Workload finished.
    Exit {
        /// Exit code.
        code: i32,
    },
}

impl CageEvent {
    /// Entry type for this event.
    #[must_use]
    pub const fn op_type(&self) -> OpType {
        match self {
            Self::Spawn { .. } => OpType::Spawn,
            Self::Syscall { .. } => OpType::Syscall,
            Self::Random { .. } => OpType::Random,
            Self::Clock { .. } => OpType::Clock,
            Self::EnvRead { .. } => OpType::EnvRead,
            Self::FileRead { .. } => OpType::FileRead,
            Self::FileWrite { .. } => OpType::FileWrite,
            Self::Stdout { .. } => OpType::Stdout,
            Self::Stderr { .. } => OpType::Stderr,
            Self::Memory { .. } => OpType::Memory,
            Self::PolicyViolation { .. } => OpType::PolicyViolation,
            Self::ResourceExceeded { .. } => OpType::ResourceExceeded,
            Self::Timeout { .. } => OpType::Timeout,
            Self::Exit { .. } => OpType::Exit,
        }
    }

    /// Canonical bytes stored as the entry's `data`.
    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        canonical::encode(self)
    }

    /// Decodes the event carried by a cage witness entry.
    pub fn from_entry(entry: &WitnessEntry) -> Result<Self, SerializationError> {
        let event: Self = canonical::decode(&entry.data)?;
        if event.op_type() != entry.op_type {
            return Err(SerializationError::Custom(format!(
                "entry type {} does not match event type {}",
                entry.op_type,
                event.op_type()
            )));
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_from_entry_checks_type() {
        let event = CageEvent::Exit { code: 3 };
        let mut entry = WitnessEntry {
            sequence: 0,
            op_type: OpType::Exit,
            data: event.encode().unwrap(),
            timestamp: 0,
        };
        assert_eq!(CageEvent::from_entry(&entry).unwrap(), event);

        entry.op_type = OpType::Spawn;
        assert!(CageEvent::from_entry(&entry).is_err());
    }

    #[test]
    fn exit_encoding_is_variant_then_code() {
        // Exit is variant 13.
        let bytes = CageEvent::Exit { code: -1 }.encode().unwrap();
        assert_eq!(bytes, [13, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
    }
}
