//! Per-peer session state and the frame codec.
//!
//! A [`Session`] is owned by exactly one task, which makes it the single
//! writer of the nonce counter and key material. [`build_frame`] and
//! [`verify_frame`] are the two operations on it.
//!
//! # Verification order
//!
//! 1. version byte
//! 2. replay: `nonce <= last_nonce_seen`
//! 3. routing and Ed25519 signature
//! 4. AEAD under the current receive key, then up to [`RATCHET_LOOKAHEAD`]
//!    ratchet steps ahead, then the previous key while its overlap window is
//!    open
//!
//! Nothing is written to the session until all four pass, so a rejected frame
//! never advances `last_nonce_seen` or the ratchet.

use std::mem;
use std::time::Duration;

use bulwark_core::crypto::{Signature, Signer, VerifyingKey, verify_signature};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{FrameRejected, TransportError};
use crate::frame::{AEAD_TAG_LEN, ClusterId, FRAME_VERSION, Frame, ServiceId, TickRef};
use crate::keys::{EpochKey, SessionKeys};
use crate::wire::MAX_PAYLOAD_LEN;

/// How many ratchet steps ahead of the current receive key are tried.
pub const RATCHET_LOOKAHEAD: u64 = 2;

/// Timing and rotation parameters of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Rotate the send key after this many frames.
    pub rotate_after_frames: u64,
    /// Rotate the send key when it is this old.
    pub rotation_interval: Duration,
    /// How long the previous receive key stays valid after a rotation.
    pub overlap_window: Duration,
    /// Expire the session after this long without traffic.
    pub idle_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            rotate_after_frames: 10_000,
            rotation_interval: Duration::from_secs(300),
            overlap_window: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames built.
    pub frames_sent: u64,
    /// Frames accepted.
    pub frames_received: u64,
    /// Plaintext bytes sent.
    pub bytes_sent: u64,
    /// Plaintext bytes received.
    pub bytes_received: u64,
    /// Send key ratchet steps.
    pub send_rotations: u64,
    /// Receive key ratchet steps.
    pub recv_rotations: u64,
}

#[derive(Debug)]
struct PreviousKey {
    key: EpochKey,
    valid_until: Instant,
}

#[derive(Debug)]
enum KeySlot {
    Current,
    Ahead(EpochKey),
    Previous,
}

#[derive(Debug)]
struct Accepted {
    payload: Vec<u8>,
    slot: KeySlot,
}

/// Authenticated channel state between this node and one peer for one
/// service.
#[derive(Debug)]
pub struct Session {
    local: ClusterId,
    peer: ClusterId,
    svc: ServiceId,
    peer_key: VerifyingKey,
    limits: SessionLimits,

    send: EpochKey,
    sent_under_key: u64,
    recv: EpochKey,
    previous: Option<PreviousKey>,

    next_nonce: u64,
    last_nonce_seen: u64,
    last_activity: Instant,
    stats: SessionStats,
}

impl Session {
    /// A fresh session keyed by a completed handshake.
    #[must_use]
    pub fn new(
        local: ClusterId,
        peer: ClusterId,
        svc: ServiceId,
        peer_key: VerifyingKey,
        keys: SessionKeys,
        limits: SessionLimits,
        now: Instant,
    ) -> Self {
        Self {
            local,
            peer,
            svc,
            peer_key,
            limits,
            send: EpochKey::new(keys.send, now),
            sent_under_key: 0,
            recv: EpochKey::new(keys.recv, now),
            previous: None,
            next_nonce: 1,
            last_nonce_seen: 0,
            last_activity: now,
            stats: SessionStats::default(),
        }
    }

    /// Our cluster.
    #[must_use]
    pub const fn local(&self) -> ClusterId {
        self.local
    }

    /// The remote cluster.
    #[must_use]
    pub const fn peer(&self) -> ClusterId {
        self.peer
    }

    /// The service.
    #[must_use]
    pub const fn svc(&self) -> ServiceId {
        self.svc
    }

    /// Highest nonce accepted from the peer.
    #[must_use]
    pub const fn last_nonce_seen(&self) -> u64 {
        self.last_nonce_seen
    }

    /// Current send and receive ratchet epochs.
    #[must_use]
    pub const fn epochs(&self) -> (u64, u64) {
        (self.send.epoch, self.recv.epoch)
    }

    /// Counter snapshot.
    #[must_use]
    pub const fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Limits in force.
    #[must_use]
    pub const fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Takes the next outgoing nonce. Nonces start at 1 and never repeat.
    pub fn next_nonce(&mut self) -> Result<u64, TransportError> {
        let nonce = self.next_nonce;
        self.next_nonce = nonce.checked_add(1).ok_or(TransportError::SessionExpired {
            peer: self.peer,
            reason: "nonce space exhausted",
        })?;
        Ok(nonce)
    }

    /// Fails with [`TransportError::SessionExpired`] once the session has
    /// been idle for `idle_timeout`.
    pub fn check_expiry(&self, now: Instant) -> Result<(), TransportError> {
        if now.saturating_duration_since(self.last_activity) >= self.limits.idle_timeout {
            return Err(self.expired("idle timeout"));
        }
        Ok(())
    }

    /// Encrypts and signs `payload` at `now`.
    ///
    /// Rotates the send key first if it has carried `rotate_after_frames`
    /// frames or is older than `rotation_interval`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::SessionExpired`] when idle or out of nonces
    /// - [`TransportError::PayloadTooLarge`] above [`MAX_PAYLOAD_LEN`]
    pub fn seal_at(
        &mut self,
        payload: &[u8],
        tick_ref: TickRef,
        signer: &Signer,
        now: Instant,
    ) -> Result<Frame, TransportError> {
        self.check_expiry(now)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        if self.sent_under_key >= self.limits.rotate_after_frames
            || now.saturating_duration_since(self.send.since) >= self.limits.rotation_interval
        {
            self.send = self.send.next(now);
            self.sent_under_key = 0;
            self.stats.send_rotations += 1;
            debug!(peer = %self.peer, epoch = self.send.epoch, "rotated send key");
        }

        let nonce = self.next_nonce()?;
        let mut frame = Frame {
            version: FRAME_VERSION,
            src: self.local,
            dst: self.peer,
            svc: self.svc,
            nonce,
            tick_ref,
            aead_payload: Vec::new(),
            signature: Signature::from_bytes([0; 64]),
        };
        frame.aead_payload = self
            .send
            .seal(nonce, &frame.header_bytes(), payload)
            .ok_or(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            })?;
        frame.signature = signer.sign_digest(&frame.signing_digest());

        self.sent_under_key += 1;
        self.last_activity = now;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;
        Ok(frame)
    }

    /// Verifies `frame` at `now` and, only if it passes, commits the new
    /// nonce and ratchet position.
    pub fn verify_at(&mut self, frame: &Frame, now: Instant) -> Result<Vec<u8>, FrameRejected> {
        let accepted = self.authenticate(frame, now)?;
        Ok(self.commit(frame.nonce, accepted, now))
    }

    /// [`verify_at`](Self::verify_at) plus expiry.
    ///
    /// # Errors
    ///
    /// - [`TransportError::SessionExpired`] when idle, or when an authentic
    ///   frame is still under a receive key older than
    ///   `rotation_interval + idle_timeout` (the peer missed its rotation
    ///   boundary)
    /// - [`TransportError::Rejected`] as [`verify_frame`]
    pub fn open_at(&mut self, frame: &Frame, now: Instant) -> Result<Vec<u8>, TransportError> {
        self.check_expiry(now)?;
        let accepted = self.authenticate(frame, now)?;
        if matches!(accepted.slot, KeySlot::Current)
            && now.saturating_duration_since(self.recv.since)
                > self.limits.rotation_interval + self.limits.idle_timeout
        {
            return Err(self.expired("peer missed rotation boundary"));
        }
        Ok(self.commit(frame.nonce, accepted, now))
    }

    fn authenticate(&self, frame: &Frame, now: Instant) -> Result<Accepted, FrameRejected> {
        if frame.version != FRAME_VERSION {
            return Err(FrameRejected::BadVersion {
                version: frame.version,
            });
        }
        if frame.nonce <= self.last_nonce_seen {
            return Err(FrameRejected::ReplayDetected {
                nonce: frame.nonce,
                last_seen: self.last_nonce_seen,
            });
        }
        if frame.src != self.peer || frame.dst != self.local || frame.svc != self.svc {
            return Err(FrameRejected::AuthFailure);
        }
        verify_signature(&self.peer_key, &frame.signing_digest(), &frame.signature)
            .map_err(|_| FrameRejected::AuthFailure)?;
        if frame.aead_payload.len() < AEAD_TAG_LEN {
            return Err(FrameRejected::MalformedPayload);
        }

        let aad = frame.header_bytes();
        let open = |key: &EpochKey| key.open(frame.nonce, &aad, &frame.aead_payload);

        if let Some(payload) = open(&self.recv) {
            return Ok(Accepted {
                payload,
                slot: KeySlot::Current,
            });
        }
        let mut candidate = self.recv.next(now);
        for _ in 0..RATCHET_LOOKAHEAD {
            if let Some(payload) = open(&candidate) {
                return Ok(Accepted {
                    payload,
                    slot: KeySlot::Ahead(candidate),
                });
            }
            candidate = candidate.next(now);
        }
        if let Some(previous) = &self.previous {
            if now <= previous.valid_until {
                if let Some(payload) = open(&previous.key) {
                    return Ok(Accepted {
                        payload,
                        slot: KeySlot::Previous,
                    });
                }
            }
        }
        Err(FrameRejected::AuthFailure)
    }

    fn commit(&mut self, nonce: u64, accepted: Accepted, now: Instant) -> Vec<u8> {
        if let KeySlot::Ahead(key) = accepted.slot {
            let steps = key.epoch - self.recv.epoch;
            let old = mem::replace(&mut self.recv, key);
            self.previous = Some(PreviousKey {
                key: old,
                valid_until: now + self.limits.overlap_window,
            });
            self.stats.recv_rotations += steps;
            debug!(peer = %self.peer, epoch = self.recv.epoch, "advanced receive key");
        }
        self.last_nonce_seen = nonce;
        self.last_activity = now;
        self.stats.frames_received += 1;
        self.stats.bytes_received += accepted.payload.len() as u64;
        accepted.payload
    }

    fn expired(&self, reason: &'static str) -> TransportError {
        TransportError::SessionExpired {
            peer: self.peer,
            reason,
        }
    }
}

/// Builds a frame carrying `payload` to `dst` on `svc`.
///
/// # Errors
///
/// - [`TransportError::SessionMismatch`] if `session` is not for
///   `(dst, svc)`
/// - as [`Session::seal_at`]
pub fn build_frame(
    dst: ClusterId,
    svc: ServiceId,
    payload: &[u8],
    tick_ref: TickRef,
    session: &mut Session,
    signer: &Signer,
) -> Result<Frame, TransportError> {
    if dst != session.peer || svc != session.svc {
        return Err(TransportError::SessionMismatch {
            peer: session.peer,
            svc: session.svc,
        });
    }
    session.seal_at(payload, tick_ref, signer, Instant::now())
}

/// Verifies `frame` against `session` and returns the plaintext.
///
/// On error `session` is unchanged.
pub fn verify_frame(frame: &Frame, session: &mut Session) -> Result<Vec<u8>, FrameRejected> {
    session.verify_at(frame, Instant::now())
}
