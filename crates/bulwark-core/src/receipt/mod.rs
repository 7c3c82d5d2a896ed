//! Signed execution receipts.
//!
//! A [`Receipt`] binds an execution id, the hash of its [`ExecutionResult`],
//! an opaque policy decision and a timestamp under the node's Ed25519 key.
//!
//! ```text
//! result_hash = domain_hash(ExecutionResult, encode(result))
//! preimage    = domain_hash(ReceiptHash, encode(execution_id, result_hash,
//!                                               policy_decision, timestamp))
//! signature   = Ed25519(node_key, preimage)
//! ```
//!
//! Receipts cross the network as canonical bytes;
//! [`verify_receipt_bytes`] rejects any single flipped byte.
//!
//! [`ExecutionResult`]: crate::cage::ExecutionResult

mod batch;
mod generator;
mod policy;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use batch::ReceiptBatch;
pub use generator::{ReceiptGenerator, ReceiptGeneratorStats};
pub use policy::{
    ComplianceReport, ComplianceStatus, PolicyCheck, PolicyEngine, PolicyInput, ResourcePolicy,
    StaticPolicy,
};

use crate::cage::ExecutionResult;
use crate::canonical::{self, SerializationError};
use crate::crypto::{
    Digest, DomainTag, MerkleError, Signature, SignatureError, VerifyingKey, domain_hash,
    verify_signature,
};

/// Receipt errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ReceiptError {
    /// Encoding or decoding failed.
    #[error("receipt serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    /// Signature did not verify.
    #[error("receipt signature invalid: {0}")]
    Signature(#[from] SignatureError),

    /// Batch proof error.
    #[error("receipt batch error: {0}")]
    Batch(#[from] MerkleError),
}

// ============================================================================
// Identifiers
// ============================================================================

/// 16-byte execution identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId([u8; 16]);

impl ExecutionId {
    /// Wraps raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Fresh random id.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutionId({self})")
    }
}

/// Opaque policy decision bytes from the external [`PolicyEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PolicyDecision(Vec<u8>);

impl PolicyDecision {
    /// Wraps decision bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decision bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Source of receipt timestamps (milliseconds since the Unix epoch).
pub trait Clock: Send + Sync {
    /// Current time.
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicU64);

impl FixedClock {
    /// Clock reading `now_ms`.
    #[must_use]
    pub const fn new(now_ms: u64) -> Self {
        Self(AtomicU64::new(now_ms))
    }

    /// Sets the reading.
    pub fn set(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    /// Moves the reading forward.
    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Receipt
// ============================================================================

#[derive(Serialize)]
struct ReceiptBody<'a> {
    execution_id: &'a ExecutionId,
    result_hash: &'a Digest,
    policy_decision: &'a PolicyDecision,
    timestamp: u64,
}

/// A signed receipt for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// `domain_hash(ExecutionResult, encode(result))`.
    pub result_hash: Digest,
    /// Opaque policy decision.
    pub policy_decision: PolicyDecision,
    /// Ed25519 signature over [`Receipt::signing_digest`].
    pub signature: Signature,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Receipt {
    /// The signed preimage; also the receipt's identity in batches.
    pub fn signing_digest(&self) -> Result<Digest, SerializationError> {
        receipt_digest(
            &self.execution_id,
            &self.result_hash,
            &self.policy_decision,
            self.timestamp,
        )
    }

    /// Canonical bytes for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        canonical::encode(self)
    }

    /// Strict decode from canonical bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        canonical::decode(bytes)
    }

    /// Checks that `result` is the execution this receipt covers.
    pub fn covers(&self, result: &ExecutionResult) -> Result<bool, SerializationError> {
        Ok(result.hash()?.ct_eq(&self.result_hash))
    }

    /// Verifies the signature, reporting why it failed.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), ReceiptError> {
        let digest = self.signing_digest()?;
        verify_signature(key, &digest, &self.signature)?;
        Ok(())
    }
}

pub(crate) fn receipt_digest(
    execution_id: &ExecutionId,
    result_hash: &Digest,
    policy_decision: &PolicyDecision,
    timestamp: u64,
) -> Result<Digest, SerializationError> {
    let body = ReceiptBody {
        execution_id,
        result_hash,
        policy_decision,
        timestamp,
    };
    Ok(domain_hash(DomainTag::ReceiptHash, &canonical::encode(&body)?))
}

/// Whether `receipt` carries a valid signature by `expected_key`.
#[must_use]
pub fn verify_receipt(receipt: &Receipt, expected_key: &VerifyingKey) -> bool {
    receipt.verify(expected_key).is_ok()
}

/// Decodes canonical receipt bytes and verifies them.
#[must_use]
pub fn verify_receipt_bytes(bytes: &[u8], expected_key: &VerifyingKey) -> bool {
    Receipt::from_bytes(bytes).is_ok_and(|receipt| verify_receipt(&receipt, expected_key))
}

/// A receipt field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptField {
    /// `execution_id`
    ExecutionId,
    /// `result_hash`
    ResultHash,
    /// `policy_decision`
    PolicyDecision,
    /// `signature`
    Signature,
    /// `timestamp`
    Timestamp,
}

/// Fields in which `receipt` differs from a trusted `reference` copy.
#[must_use]
pub fn detect_tampering(receipt: &Receipt, reference: &Receipt) -> Vec<ReceiptField> {
    let mut fields = Vec::new();
    if receipt.execution_id != reference.execution_id {
        fields.push(ReceiptField::ExecutionId);
    }
    if !receipt.result_hash.ct_eq(&reference.result_hash) {
        fields.push(ReceiptField::ResultHash);
    }
    if receipt.policy_decision != reference.policy_decision {
        fields.push(ReceiptField::PolicyDecision);
    }
    if receipt.signature != reference.signature {
        fields.push(ReceiptField::Signature);
    }
    if receipt.timestamp != reference.timestamp {
        fields.push(ReceiptField::Timestamp);
    }
    fields
}
