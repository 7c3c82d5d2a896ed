//! Policy decisions recorded in receipts.
//!
//! [`ResourcePolicy`] is the built-in engine. It checks a sealed run against
//! the limits it ran under and records the outcome as a canonically encoded
//! [`ComplianceReport`]:
//!
//! | Check                  | Fails when                                   |
//! |------------------------|----------------------------------------------|
//! | `memory-limit`         | peak memory above `max_memory_bytes`         |
//! | `wall-time-limit`      | elapsed wall time above `max_wall_time`      |
//! | `witness-completeness` | the result carries no witness digest         |

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ExecutionId, PolicyDecision};
use crate::cage::{ExecutionResult, ResourceLimits, ResourceUsage};
use crate::canonical::{self, SerializationError};
use crate::crypto::Digest;

/// What a [`PolicyEngine`] sees of a finished execution.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    /// Identifier the receipt will carry.
    pub execution_id: &'a ExecutionId,
    /// The sealed result.
    pub result: &'a ExecutionResult,
    /// Measured usage of the run.
    pub usage: ResourceUsage,
    /// Limits the run was configured with.
    pub limits: &'a ResourceLimits,
}

/// External policy evaluator. The decision is carried verbatim in the
/// receipt.
pub trait PolicyEngine: Send + Sync {
    /// Decides on a finished execution.
    fn evaluate(&self, input: &PolicyInput<'_>) -> PolicyDecision;
}

/// Policy engine that returns the same decision for every execution.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy(pub PolicyDecision);

impl PolicyEngine for StaticPolicy {
    fn evaluate(&self, _input: &PolicyInput<'_>) -> PolicyDecision {
        self.0.clone()
    }
}

/// Overall outcome of a [`ComplianceReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplianceStatus {
    /// Every check passed.
    Compliant,
    /// At least one check failed.
    NonCompliant,
}

/// One evaluated rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheck {
    /// Rule name, e.g. `memory-limit`.
    pub policy_id: String,
    /// Whether the run satisfied it.
    pub passed: bool,
    /// Measured value.
    pub observed: u64,
    /// Allowed value.
    pub limit: u64,
}

/// Decision payload written by [`ResourcePolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// `NonCompliant` iff any check failed.
    pub status: ComplianceStatus,
    /// Checks in evaluation order.
    pub checks: Vec<PolicyCheck>,
}

impl ComplianceReport {
    /// Decodes a report from receipt decision bytes.
    ///
    /// # Errors
    ///
    /// [`SerializationError`] if the bytes are not a canonical report.
    pub fn from_decision(decision: &PolicyDecision) -> Result<Self, SerializationError> {
        canonical::decode(decision.as_bytes())
    }

    /// Checks that failed.
    pub fn violations(&self) -> impl Iterator<Item = &PolicyCheck> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

/// Checks each run against the resource limits it was configured with.
#[derive(Debug, Default)]
pub struct ResourcePolicy {
    evaluated: AtomicU64,
    violations: AtomicU64,
}

impl ResourcePolicy {
    /// Engine with zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            evaluated: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    /// Executions evaluated.
    #[must_use]
    pub fn evaluated(&self) -> u64 {
        self.evaluated.load(Ordering::Relaxed)
    }

    /// Failed checks across all evaluations.
    #[must_use]
    pub fn total_violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Runs every check and tallies the failures.
    pub fn report(&self, input: &PolicyInput<'_>) -> ComplianceReport {
        let millis = |d: std::time::Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        let check = |policy_id: &str, observed: u64, limit: u64, passed: bool| PolicyCheck {
            policy_id: policy_id.to_string(),
            passed,
            observed,
            limit,
        };
        let peak = input.usage.peak_memory_bytes;
        let max_memory = input.limits.max_memory_bytes;
        let wall = millis(input.usage.wall_time);
        let max_wall = millis(input.limits.max_wall_time);
        let witnessed = input.result.witness_digest != Digest::ZERO;

        let checks = vec![
            check("memory-limit", peak, max_memory, peak <= max_memory),
            check("wall-time-limit", wall, max_wall, wall <= max_wall),
            check("witness-completeness", u64::from(witnessed), 1, witnessed),
        ];
        let failed = checks.iter().filter(|check| !check.passed).count() as u64;

        self.evaluated.fetch_add(1, Ordering::Relaxed);
        let status = if failed == 0 {
            ComplianceStatus::Compliant
        } else {
            self.violations.fetch_add(failed, Ordering::Relaxed);
            warn!(
                execution_id = %input.execution_id,
                violations = failed,
                "execution is not compliant"
            );
            ComplianceStatus::NonCompliant
        };
        ComplianceReport { status, checks }
    }
}

impl PolicyEngine for ResourcePolicy {
    fn evaluate(&self, input: &PolicyInput<'_>) -> PolicyDecision {
        let report = self.report(input);
        match canonical::encode(&report) {
            Ok(bytes) => PolicyDecision::new(bytes),
            Err(err) => {
                warn!(error = %err, "compliance report not encodable");
                PolicyDecision::default()
            },
        }
    }
}
