//! Fixed vectors for the canonical encoding and content digests.
//!
//! These bytes are a wire contract: any change here breaks receipts and
//! witness logs produced by older nodes.

use bulwark_core::crypto::{DomainTag, content_digest, domain_hash};
use bulwark_core::{decode, encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Record {
    id: u64,
    name: String,
}

fn sample() -> Record {
    Record {
        id: 42,
        name: "abc".to_string(),
    }
}

#[test]
fn record_encodes_to_known_bytes() {
    let bytes = encode(&sample()).expect("encode");
    assert_eq!(hex::encode(&bytes), "2a0000000000000003000000616263");
}

#[test]
fn record_digest_is_tagged_blake3() {
    let bytes = encode(&sample()).expect("encode");

    let mut hasher = blake3::Hasher::new();
    hasher.update(&[0x10]);
    hasher.update(&bytes);
    let expected = *hasher.finalize().as_bytes();

    let digest = content_digest(&sample()).expect("digest");
    assert_eq!(digest.as_bytes(), &expected);
    assert_eq!(digest, domain_hash(DomainTag::CanonicalRecord, &bytes));
}

#[test]
fn record_digest_is_reproducible() {
    let a = content_digest(&sample()).expect("digest");
    let b = content_digest(&sample()).expect("digest");
    assert_eq!(a, b);
    assert_eq!(a.to_hex().len(), 64);
}

#[test]
fn decode_returns_original() {
    let bytes = encode(&sample()).expect("encode");
    let back: Record = decode(&bytes).expect("decode");
    assert_eq!(back, sample());
}

#[test]
fn decode_rejects_trailing_bytes() {
    let mut bytes = encode(&sample()).expect("encode");
    bytes.push(0);
    assert!(decode::<Record>(&bytes).is_err());
}

#[test]
fn decode_rejects_truncation() {
    let bytes = encode(&sample()).expect("encode");
    for cut in 0..bytes.len() {
        assert!(
            decode::<Record>(&bytes[..cut]).is_err(),
            "prefix of {cut} bytes decoded"
        );
    }
}

#[test]
fn changing_a_field_changes_the_digest() {
    let other = Record {
        id: 43,
        name: "abc".to_string(),
    };
    assert_ne!(
        content_digest(&sample()).expect("digest"),
        content_digest(&other).expect("digest")
    );
}
