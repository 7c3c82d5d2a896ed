//! Cryptographic primitives shared by every stage of the pipeline.
//!
//! - **Domain-separated hashing**: BLAKE3 over `tag ‖ bytes`, where the tag
//!   is a variant of the closed [`DomainTag`] enum
//! - **Ed25519 signatures**: receipt, frame and handshake authentication
//! - **Merkle trees**: sealed witness logs and receipt batches
//! - **Key stores**: persistence for long-term signing keys
//!
//! # Domain Separation
//!
//! Every digest that is signed or compared across nodes is produced by
//! [`domain_hash`]. Because each [`DomainTag`] is used for exactly one
//! payload kind, a signature over a receipt hash can never be replayed as a
//! signature over a frame header, even if the underlying bytes coincide.
//!
//! # Example
//!
//! ```
//! use bulwark_core::crypto::{DomainTag, Signer, domain_hash, verify_signature};
//!
//! let signer = Signer::generate();
//! let digest = domain_hash(DomainTag::CanonicalRecord, b"payload");
//! let signature = signer.sign_digest(&digest);
//! assert!(verify_signature(&signer.verifying_key(), &digest, &signature).is_ok());
//!
//! let other = domain_hash(DomainTag::ReceiptHash, b"payload");
//! assert!(verify_signature(&signer.verifying_key(), &other, &signature).is_err());
//! ```

mod hash;
mod keys;
pub mod merkle;
mod sign;

pub use hash::{
    Digest, DigestParseError, DomainTag, HASH_SIZE, UnknownDomainTag, content_digest, domain_hash,
    domain_hash_parts,
};
pub use keys::{FileKeyStore, KeyStore, KeyStoreError, MemoryKeyStore};
pub use merkle::{MerkleError, MerkleProof, MerkleProofSibling, MerkleTree};
pub use sign::{
    PUBLIC_KEY_SIZE, SIGNATURE_SIZE, Signature, SignatureError, Signer, VerifyingKey,
    parse_verifying_key, verify_signature,
};
