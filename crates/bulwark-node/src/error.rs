//! Node errors.

use bulwark_core::cage::{CageError, ExecutionResult};
use bulwark_core::crypto::KeyStoreError;
use bulwark_core::receipt::ReceiptError;
use bulwark_core::witness::WitnessLog;
use bulwark_transport::{ClusterId, TransportError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by [`Node`](crate::Node).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NodeError {
    /// Configuration could not be loaded or is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The signing key could not be loaded or created.
    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// The cage could not be set up, or the caged run failed.
    #[error("execution failed: {source}")]
    Cage {
        /// What the cage reported.
        #[source]
        source: CageError,
        /// The sealed run, when the cage got far enough to seal one. Its
        /// last entry before `Exit` records the fault.
        run: Option<Box<FaultedRun>>,
    },

    /// A local receipt could not be produced or encoded.
    #[error("receipt error: {0}")]
    Receipt(#[from] ReceiptError),

    /// The receipt could not be delivered.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A peer sent a receipt that does not decode or verify under its key.
    #[error("receipt from {peer} rejected: {source}")]
    ReceiptRejected {
        /// Sending cluster.
        peer: ClusterId,
        /// Why it was rejected.
        #[source]
        source: ReceiptError,
    },

    /// A payload arrived from a cluster the directory does not know.
    #[error("payload from unknown cluster {0}")]
    UnknownSender(ClusterId),
}

impl NodeError {
    /// The sealed run behind a [`NodeError::Cage`], if there is one.
    #[must_use]
    pub fn faulted_run(&self) -> Option<&FaultedRun> {
        match self {
            Self::Cage { run, .. } => run.as_deref(),
            _ => None,
        }
    }
}

impl From<CageError> for NodeError {
    fn from(source: CageError) -> Self {
        Self::Cage { source, run: None }
    }
}

/// A run that was sealed but not receipted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultedRun {
    /// The sealed audit trail, including the fault entry.
    pub witness: WitnessLog,
    /// The result recorded with the fault exit code.
    pub result: ExecutionResult,
}
