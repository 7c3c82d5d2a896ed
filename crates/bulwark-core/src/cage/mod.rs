//! Determinism cage: runs one workload with filtered syscalls, seeded
//! randomness, virtual time and a witness log of every observable operation.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──activate()──► Configuring ──► Active ──execute_*()──► Sealed
//!    │                       │             │
//!    └───────────────────────┴─────────────┴──────────────────► Terminated
//! ```
//!
//! `Sealed` and `Terminated` are terminal. A cage executes exactly one
//! workload; create a new cage for the next one.
//!
//! # Workloads
//!
//! - **Functions** ([`DeterminismCage::execute_function`]) receive a
//!   [`CageContext`], the only route to nondeterministic services. Every
//!   context call is checked against the allowlist, counted against the
//!   limits, and witnessed. The context is neither `Send` nor `Sync`, so a
//!   workload cannot fan its calls out across threads.
//! - **Commands** ([`DeterminismCage::execute_command`]) run as a child
//!   process with a cleared environment. On Linux x86_64 the allowlist can
//!   be enforced by the kernel through a seccomp filter installed before
//!   `exec`.
//!
//! # Fault Handling
//!
//! A policy violation, resource breach or deadline expiry is recorded in
//! the witness log first, then the log is sealed, and only then is the error
//! returned. A command that cannot be started or awaited is sealed with
//! [`EXIT_SPAWN_FAILED`]. The sealed log and the [`ExecutionResult`] stay
//! available on the cage. Witness overflow is the exception: the trail is
//! incomplete, so the cage moves to [`CageState::Terminated`] without
//! sealing.
//!
//! Command memory is capped with `RLIMIT_AS`, which makes allocations fail
//! rather than reporting a breach. A command is charged with a memory
//! breach when the peak RSS of its run reaches the limit, or when it dies
//! from `SIGSEGV`, `SIGBUS`, `SIGABRT` or `SIGKILL` (directly, or as a
//! shell's `128 + signal` exit status). The second rule is a heuristic: a
//! crash unrelated to memory is attributed the same way.

mod config;
mod context;
mod events;
mod executor;
mod resources;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod seccomp;
mod syscall;

use std::fmt;

use thiserror::Error;

pub use config::{CageBuilder, CageConfig, ResourceLimits};
pub use context::{CageContext, Interrupt};
pub use events::{CageEvent, MemoryOp, Workload};
pub use executor::{CageStats, DeterminismCage, ExecutionResult};
pub use resources::{ResourceBreach, ResourceKind, ResourceUsage};
pub use syscall::{Syscall, UnknownSyscall};

use crate::witness::WitnessError;

/// Virtual nanoseconds charged for each gateway call.
pub const SYSCALL_QUANTUM_NS: u64 = 1_000;

/// Exit code reported after a policy violation (128 + `SIGSYS`).
pub const EXIT_POLICY_VIOLATION: i32 = 159;

/// Exit code reported after a resource breach (128 + `SIGKILL`).
pub const EXIT_RESOURCE_EXCEEDED: i32 = 137;

/// Exit code reported after a deadline expiry.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code reported when a function workload panics.
pub const EXIT_PANIC: i32 = 101;

/// Exit code reported when a command cannot be started or awaited.
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Environment variable carrying the hex seed for command workloads.
pub const SEED_ENV_VAR: &str = "BULWARK_SEED";

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a [`DeterminismCage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CageState {
    /// Created, not yet activated.
    Idle,
    /// Validating configuration and preparing services.
    Configuring,
    /// Ready to execute its workload.
    Active,
    /// Workload finished and the witness log is sealed.
    Sealed,
    /// Stopped without a sealed log.
    Terminated,
}

impl CageState {
    /// Returns `true` if no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sealed | Self::Terminated)
    }

    /// Returns the state as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configuring => "configuring",
            Self::Active => "active",
            Self::Sealed => "sealed",
            Self::Terminated => "terminated",
        }
    }

    /// Returns the states reachable from this one.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Idle => &[Self::Configuring, Self::Terminated],
            Self::Configuring => &[Self::Active, Self::Terminated],
            Self::Active => &[Self::Sealed, Self::Terminated],
            Self::Sealed | Self::Terminated => &[],
        }
    }

    /// Returns `true` if transitioning to `target` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, target: &Self) -> bool {
        self.valid_transitions().contains(target)
    }
}

impl fmt::Display for CageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the cage.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CageError {
    /// Configuration failed validation; the cage is terminated.
    #[error("invalid cage configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },

    /// Lifecycle transition not allowed.
    #[error("invalid cage transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: CageState,
        /// Requested state.
        to: CageState,
    },

    /// Operation not allowed in the current state.
    #[error("invalid cage state: cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Current state.
        state: CageState,
    },

    /// The workload attempted a syscall outside the allowlist, or a command
    /// was killed by the kernel filter.
    #[error("policy violation: {}", describe_violation(.syscall, .signal))]
    PolicyViolation {
        /// Offending syscall, when known.
        syscall: Option<Syscall>,
        /// Terminating signal for command workloads.
        signal: Option<i32>,
    },

    /// A resource limit was breached.
    #[error("resource exceeded: {0}")]
    ResourceExceeded(ResourceBreach),

    /// Deadline expired before the workload finished.
    #[error("execution deadline of {deadline_ms}ms expired")]
    Timeout {
        /// Deadline in milliseconds.
        deadline_ms: u64,
    },

    /// The witness log ran out of capacity; no log was sealed.
    #[error("witness overflow: {0}")]
    WitnessOverflow(#[source] WitnessError),

    /// The function workload panicked.
    #[error("workload panicked")]
    WorkloadPanicked,

    /// The command could not be started or awaited.
    #[error("failed to run command: {0}")]
    Spawn(#[from] std::io::Error),

    /// The kernel filter could not be built.
    #[error("seccomp filter error: {0}")]
    Filter(String),
}

fn describe_violation(syscall: &Option<Syscall>, signal: &Option<i32>) -> String {
    match (syscall, signal) {
        (Some(sc), _) => format!("syscall {sc} not allowed"),
        (None, Some(sig)) => format!("killed by signal {sig}"),
        (None, None) => "unknown".to_string(),
    }
}

/// Why a run stopped early. Stored in the cage's region and witnessed
/// before any error reaches the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fault {
    PolicyViolation {
        syscall: Option<Syscall>,
        signal: Option<i32>,
    },
    ResourceExceeded(ResourceBreach),
    Timeout {
        deadline_ms: u64,
    },
    WitnessOverflow(WitnessError),
}

impl Fault {
    pub(crate) const fn exit_code(&self) -> i32 {
        match self {
            Self::PolicyViolation { .. } => EXIT_POLICY_VIOLATION,
            Self::ResourceExceeded(_) | Self::WitnessOverflow(_) => EXIT_RESOURCE_EXCEEDED,
            Self::Timeout { .. } => EXIT_TIMEOUT,
        }
    }

    pub(crate) fn into_error(self) -> CageError {
        match self {
            Self::PolicyViolation { syscall, signal } => {
                CageError::PolicyViolation { syscall, signal }
            },
            Self::ResourceExceeded(breach) => CageError::ResourceExceeded(breach),
            Self::Timeout { deadline_ms } => CageError::Timeout { deadline_ms },
            Self::WitnessOverflow(err) => CageError::WitnessOverflow(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_and_terminated_are_terminal() {
        for state in [CageState::Sealed, CageState::Terminated] {
            assert!(state.is_terminal());
            assert!(state.valid_transitions().is_empty());
        }
        assert!(!CageState::Active.is_terminal());
    }

    #[test]
    fn transition_table() {
        assert!(CageState::Idle.can_transition_to(&CageState::Configuring));
        assert!(CageState::Idle.can_transition_to(&CageState::Terminated));
        assert!(!CageState::Idle.can_transition_to(&CageState::Active));
        assert!(CageState::Configuring.can_transition_to(&CageState::Active));
        assert!(CageState::Active.can_transition_to(&CageState::Sealed));
        assert!(CageState::Active.can_transition_to(&CageState::Terminated));
        assert!(!CageState::Sealed.can_transition_to(&CageState::Active));
        assert!(!CageState::Sealed.can_transition_to(&CageState::Terminated));
    }

    #[test]
    fn violation_messages() {
        let err = CageError::PolicyViolation {
            syscall: Some(Syscall::Socket),
            signal: None,
        };
        assert_eq!(err.to_string(), "policy violation: syscall socket not allowed");
        let err = CageError::PolicyViolation {
            syscall: None,
            signal: Some(31),
        };
        assert_eq!(err.to_string(), "policy violation: killed by signal 31");
    }
}
