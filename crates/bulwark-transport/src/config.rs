//! Transport parameters.

use std::time::Duration;

use crate::frame::ServiceId;
use crate::session::SessionLimits;
use crate::wire::{MAX_ENVELOPE_LEN, MIN_FRAME_ENVELOPE_LEN};

/// Default service name for receipt exchange.
pub const DEFAULT_SERVICE: &str = "bulwark.receipts.v1";

/// Runtime transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Service this transport speaks.
    pub service: ServiceId,
    /// Key rotation and expiry.
    pub limits: SessionLimits,
    /// Dial plus handshake deadline.
    pub handshake_timeout: Duration,
    /// Per-frame write deadline.
    pub send_timeout: Duration,
    /// Outgoing queue depth per session; a full queue suspends `send`.
    pub queue_capacity: usize,
    /// Depth of the delivered-payload channel.
    pub inbound_capacity: usize,
    /// Rejected frames tolerated before a session is dropped.
    pub rejection_threshold: u32,
    /// Largest envelope accepted from the wire.
    pub max_envelope_len: usize,
    /// How often idle sessions are checked for expiry.
    pub maintenance_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            service: ServiceId::from_name(DEFAULT_SERVICE),
            limits: SessionLimits::default(),
            handshake_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            queue_capacity: 64,
            inbound_capacity: 256,
            rejection_threshold: 8,
            max_envelope_len: MAX_ENVELOPE_LEN,
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

/// A configuration value out of range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transport config: {0}")]
pub struct InvalidTransportConfig(pub String);

impl TransportConfig {
    /// Largest plaintext that fits in a frame envelope of
    /// `max_envelope_len` bytes.
    #[must_use]
    pub const fn max_payload_len(&self) -> usize {
        self.max_envelope_len.saturating_sub(MIN_FRAME_ENVELOPE_LEN)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// [`InvalidTransportConfig`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), InvalidTransportConfig> {
        let invalid = |msg: &str| Err(InvalidTransportConfig(msg.to_string()));
        let l = &self.limits;
        if l.rotate_after_frames == 0 {
            return invalid("rotate_after_frames must be nonzero");
        }
        if l.rotation_interval.is_zero() || l.idle_timeout.is_zero() {
            return invalid("rotation_interval and idle_timeout must be nonzero");
        }
        if l.overlap_window >= l.rotation_interval {
            return invalid("overlap_window must be shorter than rotation_interval");
        }
        if l.idle_timeout >= l.rotation_interval {
            return invalid("idle_timeout must be shorter than rotation_interval");
        }
        if self.handshake_timeout.is_zero() || self.send_timeout.is_zero() {
            return invalid("timeouts must be nonzero");
        }
        if self.maintenance_interval.is_zero() {
            return invalid("maintenance_interval must be nonzero");
        }
        if self.queue_capacity == 0 || self.inbound_capacity == 0 {
            return invalid("queue capacities must be nonzero");
        }
        if self.rejection_threshold == 0 {
            return invalid("rejection_threshold must be nonzero");
        }
        if self.max_envelope_len < MIN_FRAME_ENVELOPE_LEN || self.max_envelope_len > MAX_ENVELOPE_LEN {
            return invalid("max_envelope_len out of range");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        TransportConfig::default().validate().unwrap();
    }

    #[test]
    fn overlap_must_be_shorter_than_rotation() {
        let mut config = TransportConfig::default();
        config.limits.overlap_window = config.limits.rotation_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn idle_must_be_shorter_than_rotation() {
        let mut config = TransportConfig::default();
        config.limits.idle_timeout = Duration::from_secs(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn payload_limit_follows_envelope_limit() {
        let config = TransportConfig {
            max_envelope_len: MIN_FRAME_ENVELOPE_LEN + 100,
            ..TransportConfig::default()
        };
        assert_eq!(config.max_payload_len(), 100);
        assert_eq!(
            TransportConfig::default().max_payload_len(),
            crate::wire::MAX_PAYLOAD_LEN
        );
    }

    #[test]
    fn zero_values_rejected() {
        for mutate in [
            (|c: &mut TransportConfig| c.queue_capacity = 0) as fn(&mut TransportConfig),
            |c| c.rejection_threshold = 0,
            |c| c.limits.rotate_after_frames = 0,
            |c| c.send_timeout = Duration::ZERO,
            |c| c.max_envelope_len = 10,
        ] {
            let mut config = TransportConfig::default();
            mutate(&mut config);
            assert!(config.validate().is_err());
        }
    }
}
