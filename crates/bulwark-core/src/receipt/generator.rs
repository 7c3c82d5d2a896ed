//! Receipt generation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{Clock, ExecutionId, PolicyDecision, Receipt, ReceiptError, SystemClock, receipt_digest};
use crate::cage::ExecutionResult;
use crate::crypto::Signer;

/// Generator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiptGeneratorStats {
    /// Receipts signed.
    pub generated: u64,
    /// Results that could not be encoded.
    pub failed: u64,
    /// Receipts for runs that ended with a nonzero exit code.
    pub nonzero_exits: u64,
}

/// Signs receipts with the node's long-term key.
///
/// Shared across tasks by reference; counters are atomic.
#[derive(Debug)]
pub struct ReceiptGenerator<C = SystemClock> {
    signer: Arc<Signer>,
    clock: C,
    generated: AtomicU64,
    failed: AtomicU64,
    nonzero_exits: AtomicU64,
}

impl ReceiptGenerator<SystemClock> {
    /// Generator stamping receipts with wall-clock time.
    #[must_use]
    pub fn with_system_clock(signer: Arc<Signer>) -> Self {
        Self::new(signer, SystemClock)
    }
}

impl<C: Clock> ReceiptGenerator<C> {
    /// Generator with an injected clock.
    #[must_use]
    pub const fn new(signer: Arc<Signer>, clock: C) -> Self {
        Self {
            signer,
            clock,
            generated: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            nonzero_exits: AtomicU64::new(0),
        }
    }

    /// The signing identity.
    #[must_use]
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// The injected clock.
    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    /// Hashes `result` and signs a receipt for it.
    ///
    /// # Errors
    ///
    /// [`ReceiptError::Serialization`] if the result cannot be encoded.
    pub fn generate_receipt(
        &self,
        execution_id: ExecutionId,
        result: &ExecutionResult,
        policy_decision: PolicyDecision,
    ) -> Result<Receipt, ReceiptError> {
        let signed = self.sign(execution_id, result, policy_decision);
        match &signed {
            Ok(receipt) => {
                self.generated.fetch_add(1, Ordering::Relaxed);
                if result.exit_code != 0 {
                    self.nonzero_exits.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    execution_id = %receipt.execution_id,
                    result_hash = %receipt.result_hash,
                    exit_code = result.exit_code,
                    "receipt signed"
                );
            },
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            },
        }
        signed
    }

    fn sign(
        &self,
        execution_id: ExecutionId,
        result: &ExecutionResult,
        policy_decision: PolicyDecision,
    ) -> Result<Receipt, ReceiptError> {
        let result_hash = result.hash()?;
        let timestamp = self.clock.now_ms();
        let digest = receipt_digest(&execution_id, &result_hash, &policy_decision, timestamp)?;
        Ok(Receipt {
            execution_id,
            result_hash,
            policy_decision,
            signature: self.signer.sign_digest(&digest),
            timestamp,
        })
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> ReceiptGeneratorStats {
        ReceiptGeneratorStats {
            generated: self.generated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            nonzero_exits: self.nonzero_exits.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the counters.
    pub fn reset_stats(&self) {
        self.generated.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.nonzero_exits.store(0, Ordering::Relaxed);
    }
}
