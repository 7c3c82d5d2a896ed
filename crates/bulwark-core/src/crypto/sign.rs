//! Ed25519 signing over domain-separated digests.
//!
//! Signers never sign raw payloads: callers hash with
//! [`domain_hash`](super::domain_hash) first and sign the resulting
//! [`Digest`]. Verification uses `verify_strict`, which rejects small-order
//! keys and non-canonical `S` values.

use std::fmt;

use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use zeroize::Zeroizing;

use super::hash::Digest;

pub use ed25519_dalek::VerifyingKey;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Signature verification errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Public key bytes are not a valid curve point.
    #[error("malformed public key")]
    MalformedKey,

    /// Signature does not verify for the key and digest.
    #[error("signature verification failed")]
    Invalid,
}

/// A raw 64-byte Ed25519 signature.
///
/// Canonically encoded as 64 raw bytes with no length prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// Wraps raw signature bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }

    /// Borrowed signature bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(SIGNATURE_SIZE)?;
        for byte in &self.0 {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SignatureVisitor;

        impl<'de> Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{SIGNATURE_SIZE} signature bytes")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Signature, A::Error> {
                let mut out = [0u8; SIGNATURE_SIZE];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(Signature(out))
            }
        }

        deserializer.deserialize_tuple(SIGNATURE_SIZE, SignatureVisitor)
    }
}

/// A long-term Ed25519 signing identity.
///
/// The secret key is zeroized on drop by `ed25519-dalek`.
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Generates a fresh key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores a signer from its 32-byte secret.
    #[must_use]
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    /// Copies out the 32-byte secret for persistence.
    #[must_use]
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes())
    }

    /// Public half of the key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Signs a domain-separated digest.
    #[must_use]
    pub fn sign_digest(&self, digest: &Digest) -> Signature {
        Signature(self.key.sign(digest.as_bytes()).to_bytes())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("verifying_key", &hex::encode(self.verifying_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Parses a 32-byte Ed25519 public key.
pub fn parse_verifying_key(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<VerifyingKey, SignatureError> {
    VerifyingKey::from_bytes(bytes).map_err(|_| SignatureError::MalformedKey)
}

/// Verifies `signature` over `digest`.
pub fn verify_signature(
    key: &VerifyingKey,
    digest: &Digest,
    signature: &Signature,
) -> Result<(), SignatureError> {
    let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    key.verify_strict(digest.as_bytes(), &signature)
        .map_err(|_| SignatureError::Invalid)
}
