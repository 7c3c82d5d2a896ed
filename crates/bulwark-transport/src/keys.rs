//! Session key material.
//!
//! Each direction of a session has its own AES-256-GCM key. Both are derived
//! from the X25519 shared secret and the handshake transcript with
//! `blake3::derive_key`, and advance independently through a one-way ratchet:
//!
//! ```text
//! k_0 = derive_key(DIRECTION_CONTEXT, shared ‖ transcript)
//! k_{n+1} = derive_key(RATCHET_CONTEXT, k_n)
//! ```

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bulwark_core::crypto::Digest;
use tokio::time::Instant;
use zeroize::Zeroizing;

const INITIATOR_TO_RESPONDER: &str = "bulwark transport 2024-06 initiator to responder key";
const RESPONDER_TO_INITIATOR: &str = "bulwark transport 2024-06 responder to initiator key";
const RATCHET_CONTEXT: &str = "bulwark transport 2024-06 ratchet";

/// Which side of the handshake we were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection and sent the first hello.
    Initiator,
    /// Accepted the connection.
    Responder,
}

/// Initial directional keys for one session.
pub struct SessionKeys {
    pub(crate) send: Zeroizing<[u8; 32]>,
    pub(crate) recv: Zeroizing<[u8; 32]>,
}

impl SessionKeys {
    /// Derives both directions from the shared secret and transcript digest.
    #[must_use]
    pub fn derive(shared_secret: &[u8; 32], transcript: &Digest, role: Role) -> Self {
        let mut material = Zeroizing::new([0u8; 64]);
        material[..32].copy_from_slice(shared_secret);
        material[32..].copy_from_slice(transcript.as_bytes());

        let i2r = Zeroizing::new(blake3::derive_key(INITIATOR_TO_RESPONDER, &material[..]));
        let r2i = Zeroizing::new(blake3::derive_key(RESPONDER_TO_INITIATOR, &material[..]));
        match role {
            Role::Initiator => Self {
                send: i2r,
                recv: r2i,
            },
            Role::Responder => Self {
                send: r2i,
                recv: i2r,
            },
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// One ratchet position of a directional key.
#[derive(Clone)]
pub(crate) struct EpochKey {
    pub(crate) epoch: u64,
    key: Zeroizing<[u8; 32]>,
    pub(crate) since: Instant,
}

impl EpochKey {
    pub(crate) const fn new(key: Zeroizing<[u8; 32]>, since: Instant) -> Self {
        Self {
            epoch: 0,
            key,
            since,
        }
    }

    /// The next ratchet position, installed at `now`.
    pub(crate) fn next(&self, now: Instant) -> Self {
        Self {
            epoch: self.epoch + 1,
            key: Zeroizing::new(blake3::derive_key(RATCHET_CONTEXT, &self.key[..])),
            since: now,
        }
    }

    pub(crate) fn seal(&self, nonce: u64, aad: &[u8], plaintext: &[u8]) -> Option<Vec<u8>> {
        self.cipher()
            .encrypt(
                Nonce::from_slice(&aead_nonce(nonce)),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .ok()
    }

    pub(crate) fn open(&self, nonce: u64, aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        self.cipher()
            .decrypt(
                Nonce::from_slice(&aead_nonce(nonce)),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .ok()
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key[..]))
    }
}

impl std::fmt::Debug for EpochKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochKey")
            .field("epoch", &self.epoch)
            .field("since", &self.since)
            .finish_non_exhaustive()
    }
}

/// 96-bit AEAD nonce: `nonce LE ‖ 0u32`.
fn aead_nonce(nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&nonce.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(role: Role) -> SessionKeys {
        SessionKeys::derive(&[7; 32], &Digest::from_bytes([9; 32]), role)
    }

    #[test]
    fn directions_pair_up() {
        let initiator = keys(Role::Initiator);
        let responder = keys(Role::Responder);
        assert_eq!(*initiator.send, *responder.recv);
        assert_eq!(*initiator.recv, *responder.send);
        assert_ne!(*initiator.send, *initiator.recv);
    }

    #[test]
    fn transcript_changes_keys() {
        let a = SessionKeys::derive(&[7; 32], &Digest::from_bytes([1; 32]), Role::Initiator);
        let b = SessionKeys::derive(&[7; 32], &Digest::from_bytes([2; 32]), Role::Initiator);
        assert_ne!(*a.send, *b.send);
    }

    #[test]
    fn seal_open() {
        let now = Instant::now();
        let key = EpochKey::new(keys(Role::Initiator).send, now);
        let ct = key.seal(5, b"header", b"payload").unwrap();
        assert_eq!(ct.len(), b"payload".len() + 16);
        assert_eq!(key.open(5, b"header", &ct).unwrap(), b"payload");
        assert!(key.open(6, b"header", &ct).is_none());
        assert!(key.open(5, b"headex", &ct).is_none());
    }

    #[test]
    fn ratchet_is_one_way_and_deterministic() {
        let now = Instant::now();
        let k0 = EpochKey::new(keys(Role::Initiator).send, now);
        let k1 = k0.next(now);
        let k1_again = k0.next(now);
        assert_eq!(k1.epoch, 1);
        assert_eq!(*k1.key, *k1_again.key);
        assert_ne!(*k1.key, *k0.key);

        let ct = k1.seal(1, b"", b"x").unwrap();
        assert!(k0.open(1, b"", &ct).is_none());
        assert!(k1_again.open(1, b"", &ct).is_some());
    }
}
