//! BLAKE3 digests with single-byte domain separation.

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::canonical::{self, SerializationError};

/// Size of a BLAKE3 digest in bytes.
pub const HASH_SIZE: usize = 32;

/// A 32-byte BLAKE3 digest.
///
/// Equality through [`Digest::ct_eq`] is constant-time; `PartialEq` is the
/// ordinary derive and is fine for non-secret comparisons.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Digest([u8; HASH_SIZE]);

impl Digest {
    /// The all-zero digest. Used as the chain genesis and as the root of an
    /// empty Merkle tree.
    pub const ZERO: Self = Self([0u8; HASH_SIZE]);

    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Consumes the digest, returning its bytes.
    #[must_use]
    pub const fn into_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }

    /// Constant-time equality.
    #[must_use]
    pub fn ct_eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, DigestParseError> {
        let mut out = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut out).map_err(|_| DigestParseError {
            input_len: s.len(),
        })?;
        Ok(Self(out))
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A digest string was not 64 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid digest hex (length {input_len}, expected {} hex chars)", HASH_SIZE * 2)]
pub struct DigestParseError {
    input_len: usize,
}

/// Domain tags.
///
/// Each tag is bound to exactly one payload kind. Adding a payload kind means
/// adding a variant; reusing an existing tag for a new purpose is forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DomainTag {
    /// Content digests of arbitrary canonical records.
    CanonicalRecord = 0x10,
    /// Rolling witness chain: `h_{i-1} ‖ encode(entry_i)`.
    WitnessChain = 0x11,
    /// Merkle leaf over an encoded item.
    MerkleLeaf = 0x12,
    /// Merkle internal node: `left ‖ right`.
    MerkleInternal = 0x13,
    /// Digest of a sealed witness log.
    WitnessSeal = 0x14,
    /// Receipt signing preimage.
    ReceiptHash = 0x15,
    /// Root binding of a receipt batch.
    ReceiptRoot = 0x16,
    /// `result_hash` of an execution result.
    ExecutionResult = 0x17,
    /// Frame signing preimage (every frame field except the signature).
    FrameHeader = 0x18,
    /// Handshake hello signing preimage.
    HandshakeTranscript = 0x19,
    /// Service identifier hashing.
    ServiceId = 0x1a,
}

impl DomainTag {
    /// Every tag, in ascending byte order.
    pub const ALL: [Self; 11] = [
        Self::CanonicalRecord,
        Self::WitnessChain,
        Self::MerkleLeaf,
        Self::MerkleInternal,
        Self::WitnessSeal,
        Self::ReceiptHash,
        Self::ReceiptRoot,
        Self::ExecutionResult,
        Self::FrameHeader,
        Self::HandshakeTranscript,
        Self::ServiceId,
    ];

    /// The tag byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The byte is not an assigned domain tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown domain tag {0:#04x}")]
pub struct UnknownDomainTag(pub u8);

impl TryFrom<u8> for DomainTag {
    type Error = UnknownDomainTag;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_u8() == value)
            .ok_or(UnknownDomainTag(value))
    }
}

/// `BLAKE3(tag ‖ bytes)`.
#[must_use]
pub fn domain_hash(tag: DomainTag, bytes: &[u8]) -> Digest {
    domain_hash_parts(tag, &[bytes])
}

/// `BLAKE3(tag ‖ parts[0] ‖ parts[1] ‖ ...)` without concatenating first.
#[must_use]
pub fn domain_hash_parts(tag: DomainTag, parts: &[&[u8]]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag.as_u8()]);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Digest of the canonical encoding of `value` under
/// [`DomainTag::CanonicalRecord`].
pub fn content_digest<T: Serialize + ?Sized>(value: &T) -> Result<Digest, SerializationError> {
    let bytes = canonical::encode(value)?;
    Ok(domain_hash(DomainTag::CanonicalRecord, &bytes))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn tag_is_prefixed() {
        let expected = {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&[0x15]);
            hasher.update(b"abc");
            Digest::from(hasher.finalize())
        };
        assert_eq!(domain_hash(DomainTag::ReceiptHash, b"abc"), expected);
    }

    #[test]
    fn parts_match_concatenation() {
        let joined = domain_hash(DomainTag::WitnessChain, b"leftright");
        let parts = domain_hash_parts(DomainTag::WitnessChain, &[&b"left"[..], &b"right"[..]]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn distinct_tags_give_distinct_digests() {
        let payloads: [&[u8]; 3] = [b"", b"x", &[0u8; 64]];
        for payload in payloads {
            let digests: HashSet<Digest> = DomainTag::ALL
                .iter()
                .map(|tag| domain_hash(*tag, payload))
                .collect();
            assert_eq!(digests.len(), DomainTag::ALL.len());
        }
    }

    #[test]
    fn tag_bytes_are_unique_and_round_trip() {
        let bytes: HashSet<u8> = DomainTag::ALL.iter().map(|t| t.as_u8()).collect();
        assert_eq!(bytes.len(), DomainTag::ALL.len());
        for tag in DomainTag::ALL {
            assert_eq!(DomainTag::try_from(tag.as_u8()), Ok(tag));
        }
        assert_eq!(DomainTag::try_from(0x00), Err(UnknownDomainTag(0x00)));
    }

    #[test]
    fn digest_hex_round_trip() {
        let digest = domain_hash(DomainTag::CanonicalRecord, b"hex");
        assert_eq!(Digest::from_hex(&digest.to_hex()), Ok(digest));
        assert!(Digest::from_hex("abcd").is_err());
    }

    #[test]
    fn digest_encodes_as_raw_bytes() {
        let digest = Digest::from_bytes([7u8; HASH_SIZE]);
        assert_eq!(canonical::encode(&digest).unwrap(), vec![7u8; HASH_SIZE]);
    }

    #[test]
    fn ct_eq_matches_eq() {
        let a = domain_hash(DomainTag::MerkleLeaf, b"a");
        let b = domain_hash(DomainTag::MerkleLeaf, b"b");
        assert!(a.ct_eq(&a));
        assert!(!a.ct_eq(&b));
    }
}
