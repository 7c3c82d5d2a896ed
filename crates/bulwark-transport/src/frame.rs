//! The frame wire format.
//!
//! ```text
//! +---------+---------+---------+---------+----------+----------+--------------+-----------+
//! | version | src     | dst     | svc     | nonce    | tick_ref | aead_payload | signature |
//! | u8      | 16 B    | 16 B    | 32 B    | u64 LE   | 32 B     | ct ‖ tag     | 64 B      |
//! +---------+---------+---------+---------+----------+----------+--------------+-----------+
//! ```
//!
//! The first [`HEADER_LEN`] bytes are the AEAD associated data. The signature
//! covers `domain_hash(FrameHeader, header ‖ aead_payload)`.

use std::fmt;
use std::str::FromStr;

use bulwark_core::crypto::{Digest, DomainTag, SIGNATURE_SIZE, Signature, domain_hash, domain_hash_parts};
use serde::{Deserialize, Serialize};

use crate::error::FrameRejected;

/// Current frame version.
pub const FRAME_VERSION: u8 = 1;

/// Length of the authenticated header preceding the AEAD payload.
pub const HEADER_LEN: usize = 1 + 16 + 16 + 32 + 8 + 32;

/// AES-GCM tag length.
pub const AEAD_TAG_LEN: usize = 16;

/// Shortest valid frame: header, empty plaintext with its tag, signature.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + AEAD_TAG_LEN + SIGNATURE_SIZE;

/// A 16-byte cluster identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId([u8; 16]);

impl ClusterId {
    /// Wraps raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterId({self})")
    }
}

/// Error parsing a [`ClusterId`] from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cluster id must be 32 hex characters: {input:?}")]
pub struct ClusterIdParseError {
    /// The rejected input.
    pub input: String,
}

impl FromStr for ClusterId {
    type Err = ClusterIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).map_err(|_| ClusterIdParseError {
            input: s.to_string(),
        })?;
        Ok(Self(out))
    }
}

/// Hash of a service's fully qualified name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(Digest);

impl ServiceId {
    /// `domain_hash(ServiceId, name)`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(domain_hash(DomainTag::ServiceId, name.as_bytes()))
    }

    /// Wraps a precomputed hash.
    #[must_use]
    pub const fn from_digest(digest: Digest) -> Self {
        Self(digest)
    }

    /// The hash.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes are enough to tell services apart in logs.
        f.write_str(&hex::encode(&self.0.as_bytes()[..8]))
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", self.0.to_hex())
    }
}

/// Opaque logical-clock reference stamped on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TickRef(pub [u8; 32]);

/// One authenticated, encrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version; [`FRAME_VERSION`] on build.
    pub version: u8,
    /// Sending cluster.
    pub src: ClusterId,
    /// Receiving cluster.
    pub dst: ClusterId,
    /// Service the session belongs to.
    pub svc: ServiceId,
    /// Strictly increasing per session.
    pub nonce: u64,
    /// Externally supplied tick reference.
    pub tick_ref: TickRef,
    /// AES-256-GCM ciphertext followed by its 16-byte tag.
    pub aead_payload: Vec<u8>,
    /// Ed25519 signature by `src`.
    pub signature: Signature,
}

impl Frame {
    /// Header bytes; the AEAD associated data.
    #[must_use]
    pub fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1..17].copy_from_slice(self.src.as_bytes());
        out[17..33].copy_from_slice(self.dst.as_bytes());
        out[33..65].copy_from_slice(self.svc.digest().as_bytes());
        out[65..73].copy_from_slice(&self.nonce.to_le_bytes());
        out[73..105].copy_from_slice(&self.tick_ref.0);
        out
    }

    /// `domain_hash(FrameHeader, header ‖ aead_payload)`.
    #[must_use]
    pub fn signing_digest(&self) -> Digest {
        domain_hash_parts(
            DomainTag::FrameHeader,
            &[&self.header_bytes()[..], &self.aead_payload[..]],
        )
    }

    /// Encoded length.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.aead_payload.len() + SIGNATURE_SIZE
    }

    /// Wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.header_bytes());
        out.extend_from_slice(&self.aead_payload);
        out.extend_from_slice(self.signature.as_bytes());
        out
    }

    /// Parses wire bytes. The version byte is not checked here.
    ///
    /// # Errors
    ///
    /// [`FrameRejected::MalformedPayload`] if `bytes` is shorter than
    /// [`MIN_FRAME_LEN`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameRejected> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameRejected::MalformedPayload);
        }
        let (header, rest) = bytes.split_at(HEADER_LEN);
        let (aead_payload, signature) = rest.split_at(rest.len() - SIGNATURE_SIZE);

        let mut src = [0u8; 16];
        src.copy_from_slice(&header[1..17]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&header[17..33]);
        let mut svc = [0u8; 32];
        svc.copy_from_slice(&header[33..65]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&header[65..73]);
        let mut tick_ref = [0u8; 32];
        tick_ref.copy_from_slice(&header[73..105]);
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(signature);

        Ok(Self {
            version: header[0],
            src: ClusterId(src),
            dst: ClusterId(dst),
            svc: ServiceId(Digest::from_bytes(svc)),
            nonce: u64::from_le_bytes(nonce),
            tick_ref: TickRef(tick_ref),
            aead_payload: aead_payload.to_vec(),
            signature: Signature::from_bytes(sig),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample() -> Frame {
        Frame {
            version: FRAME_VERSION,
            src: ClusterId([1; 16]),
            dst: ClusterId([2; 16]),
            svc: ServiceId::from_name("ledger.bulwark"),
            nonce: 0x0102_0304_0506_0708,
            tick_ref: TickRef([3; 32]),
            aead_payload: vec![4; 20],
            signature: Signature::from_bytes([5; 64]),
        }
    }

    #[test]
    fn layout_is_fixed() {
        assert_eq!(HEADER_LEN, 105);
        assert_eq!(MIN_FRAME_LEN, 185);

        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), 105 + 20 + 64);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..17], &[1; 16]);
        assert_eq!(&bytes[17..33], &[2; 16]);
        assert_eq!(&bytes[65..73], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[73..105], &[3; 32]);
        assert_eq!(&bytes[105..125], &[4; 20]);
        assert_eq!(&bytes[125..], &[5; 64]);
    }

    #[test]
    fn short_input_is_malformed() {
        let bytes = sample().to_bytes();
        assert_eq!(
            Frame::from_bytes(&bytes[..MIN_FRAME_LEN - 1]),
            Err(FrameRejected::MalformedPayload)
        );
        assert_eq!(Frame::from_bytes(&[]), Err(FrameRejected::MalformedPayload));
    }

    #[test]
    fn signing_digest_covers_ciphertext() {
        let frame = sample();
        let mut other = sample();
        other.aead_payload[0] ^= 1;
        assert_ne!(frame.signing_digest(), other.signing_digest());

        let mut resigned = sample();
        resigned.signature = Signature::from_bytes([6; 64]);
        assert_eq!(frame.signing_digest(), resigned.signing_digest());
    }

    #[test]
    fn service_ids_are_domain_separated() {
        let svc = ServiceId::from_name("a");
        assert_ne!(*svc.digest(), domain_hash(DomainTag::CanonicalRecord, b"a"));
        assert_eq!(svc, ServiceId::from_name("a"));
    }

    #[test]
    fn cluster_id_hex() {
        let id: ClusterId = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        assert_eq!(id.as_bytes()[15], 0x0f);
        assert_eq!(id.to_string(), "000102030405060708090a0b0c0d0e0f");
        assert!("00".parse::<ClusterId>().is_err());
    }

    proptest! {
        #[test]
        fn parse_inverts_encode(
            nonce in any::<u64>(),
            version in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 16..256),
        ) {
            let mut frame = sample();
            frame.nonce = nonce;
            frame.version = version;
            frame.aead_payload = payload;
            prop_assert_eq!(Frame::from_bytes(&frame.to_bytes()).unwrap(), frame);
        }

        #[test]
        fn parse_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..400)) {
            let _ = Frame::from_bytes(&bytes);
        }
    }
}
