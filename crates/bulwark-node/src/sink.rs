//! Where verified peer receipts go.

use std::sync::{Mutex, PoisonError};

use bulwark_core::receipt::Receipt;
use bulwark_transport::ClusterId;
use tokio::sync::watch;

use crate::error::NodeError;

/// Ledger ingestion point for receipts received from peers.
///
/// `accept` only ever sees receipts whose signature verified under the
/// sender's directory key. Rejections are reported to `reject` so that they
/// are never silently dropped.
pub trait ReceiptSink: Send + Sync {
    /// A verified receipt from `from`.
    fn accept(&self, from: ClusterId, receipt: Receipt);

    /// A payload from `from` that failed verification.
    fn reject(&self, from: ClusterId, error: &NodeError) {
        let _ = (from, error);
    }
}

/// Sink that keeps everything in memory.
#[derive(Debug)]
pub struct MemorySink {
    accepted: Mutex<Vec<(ClusterId, Receipt)>>,
    rejected: Mutex<Vec<(ClusterId, String)>>,
    counts: watch::Sender<(usize, usize)>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self {
            accepted: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            counts: watch::Sender::new((0, 0)),
        }
    }
}

impl MemorySink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted receipts in arrival order.
    #[must_use]
    pub fn accepted(&self) -> Vec<(ClusterId, Receipt)> {
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rejections with their error text, in arrival order.
    #[must_use]
    pub fn rejected(&self) -> Vec<(ClusterId, String)> {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until at least `accepted` receipts were accepted and
    /// `rejected` rejected.
    pub async fn wait_for(&self, accepted: usize, rejected: usize) {
        let mut counts = self.counts.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = counts
            .wait_for(|(a, r)| *a >= accepted && *r >= rejected)
            .await;
    }
}

impl ReceiptSink for MemorySink {
    fn accept(&self, from: ClusterId, receipt: Receipt) {
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((from, receipt));
        self.counts.send_modify(|(a, _)| *a += 1);
    }

    fn reject(&self, from: ClusterId, error: &NodeError) {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((from, error.to_string()));
        self.counts.send_modify(|(_, r)| *r += 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulwark_core::crypto::{Digest, Signature};
    use bulwark_core::receipt::{ExecutionId, PolicyDecision};

    use super::*;

    fn receipt() -> Receipt {
        Receipt {
            execution_id: ExecutionId::from_bytes([1; 16]),
            result_hash: Digest::ZERO,
            policy_decision: PolicyDecision::new(b"allow".to_vec()),
            signature: Signature::from_bytes([0; 64]),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn wait_for_wakes_on_accept() {
        let sink = std::sync::Arc::new(MemorySink::new());
        let waiter = {
            let sink = std::sync::Arc::clone(&sink);
            tokio::spawn(async move { sink.wait_for(2, 1).await })
        };
        let peer = ClusterId::from_bytes([7; 16]);
        sink.accept(peer, receipt());
        sink.reject(peer, &NodeError::UnknownSender(peer));
        sink.accept(peer, receipt());
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.accepted().len(), 2);
        assert_eq!(sink.rejected()[0].0, peer);
    }
}
