#![allow(clippy::doc_markdown)]

//! bulwark-node - one node of the cluster trust pipeline
//!
//! Ties the pieces together: workloads run in a
//! [`DeterminismCage`](bulwark_core::cage::DeterminismCage), results are
//! signed into receipts, and receipts travel to peer clusters over
//! [`bulwark_transport`]. Receipts arriving from peers are verified against
//! the peer directory and handed to a [`ReceiptSink`].
//!
//! - [`config`]: TOML node configuration
//! - [`telemetry`]: `tracing` subscriber setup
//! - [`pipeline`]: The running [`Node`]
//! - [`sink`]: Ledger ingestion seam

pub mod config;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod telemetry;

pub use config::{ConfigError, NodeConfig};
pub use error::{FaultedRun, NodeError};
pub use pipeline::{Execution, Node, NodeParts, NodeStats, ReceiptVerifier};
pub use sink::{MemorySink, ReceiptSink};
