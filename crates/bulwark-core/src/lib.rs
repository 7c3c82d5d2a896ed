#![allow(clippy::doc_markdown)]

//! bulwark-core - deterministic execution and audit primitives
//!
//! This crate holds the parts of the cluster trust pipeline that run on a
//! single node: canonical encoding, domain-separated hashing, the witness
//! recorder, the determinism cage and the receipt generator. Network
//! exchange of receipts lives in `bulwark-transport`.
//!
//! # Pipeline
//!
//! ```text
//! caller ──► DeterminismCage ──► WitnessLog (sealed)
//!                 │
//!                 ▼
//!          ExecutionResult ──► ReceiptGenerator ──► Receipt (signed)
//! ```
//!
//! # Modules
//!
//! - [`canonical`]: Canonical serde encoding (`encode` / `decode`)
//! - [`crypto`]: Domain tags, `domain_hash`, Ed25519 signing, Merkle trees,
//!   key stores
//! - [`witness`]: Append-only, hash-chained witness recorder and sealed logs
//! - [`cage`]: Syscall-filtered, seeded executor for functions and commands
//! - [`receipt`]: Signed execution receipts and receipt batches

pub mod cage;
pub mod canonical;
pub mod crypto;
pub mod receipt;
pub mod witness;

pub use canonical::{SerializationError, decode, encode};
pub use crypto::{Digest, DomainTag, domain_hash};
