//! Transport error types.
//!
//! [`FrameRejected`] is what a single inbound frame can fail with; it never
//! changes session state. [`TransportError`] covers everything at the session
//! and connection level.

use std::io;
use std::time::Duration;

use bulwark_core::SerializationError;
use bulwark_core::crypto::SignatureError;
use thiserror::Error;

use crate::frame::{ClusterId, ServiceId};

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FrameRejected {
    /// Unknown protocol version byte.
    #[error("unsupported frame version {version}")]
    BadVersion {
        /// Version byte found.
        version: u8,
    },

    /// `nonce <= last_nonce_seen` for the session.
    #[error("replayed nonce {nonce} (last seen {last_seen})")]
    ReplayDetected {
        /// Nonce carried by the frame.
        nonce: u64,
        /// Highest nonce accepted so far.
        last_seen: u64,
    },

    /// Routing mismatch, bad signature or AEAD tag failure.
    #[error("frame authentication failed")]
    AuthFailure,

    /// The frame or envelope could not be parsed.
    #[error("malformed frame")]
    MalformedPayload,
}

impl FrameRejected {
    /// Stable label for logs and counters.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BadVersion { .. } => "bad_version",
            Self::ReplayDetected { .. } => "replay_detected",
            Self::AuthFailure => "auth_failure",
            Self::MalformedPayload => "malformed_payload",
        }
    }
}

/// Session and connection level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// A frame was rejected.
    #[error("frame rejected: {0}")]
    Rejected(#[from] FrameRejected),

    /// Idle too long or the peer missed its key rotation boundary. The
    /// caller re-handshakes.
    #[error("session with {peer} expired: {reason}")]
    SessionExpired {
        /// Remote cluster.
        peer: ClusterId,
        /// What expired.
        reason: &'static str,
    },

    /// A handshake message could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] SerializationError),

    /// A handshake signature did not verify.
    #[error("signature invalid: {0}")]
    SignatureInvalid(#[from] SignatureError),

    /// Handshake protocol failure.
    #[error("handshake failed: {reason}")]
    Handshake {
        /// Description of the failure.
        reason: String,
    },

    /// The destination is not in the peer directory.
    #[error("unknown peer {0}")]
    UnknownPeer(ClusterId),

    /// The frame is addressed to a different peer or service than the
    /// session it was built on.
    #[error("session is for {peer} on {svc}")]
    SessionMismatch {
        /// The session's peer.
        peer: ClusterId,
        /// The session's service.
        svc: ServiceId,
    },

    /// Outgoing payload exceeds the envelope limit.
    #[error("payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload size.
        len: usize,
        /// Maximum payload size.
        max: usize,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An operation did not complete in time.
    #[error("{operation} timed out after {duration_ms} ms")]
    Timeout {
        /// What timed out.
        operation: &'static str,
        /// Configured timeout.
        duration_ms: u64,
    },

    /// The session task or connection has gone away.
    #[error("session closed")]
    Closed,
}

impl TransportError {
    pub(crate) fn timed_out(operation: &'static str, limit: Duration) -> Self {
        Self::Timeout {
            operation,
            duration_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Whether a fresh handshake may succeed where this failed.
    #[must_use]
    pub const fn is_reconnectable(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired { .. } | Self::Closed | Self::Io(_) | Self::Timeout { .. }
        )
    }
}
