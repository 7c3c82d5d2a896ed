#![allow(clippy::doc_markdown)]

//! bulwark-transport - authenticated frames between clusters
//!
//! Every message between two clusters travels as a [`Frame`]: encrypted
//! with AES-256-GCM under a per-direction session key, signed with the
//! sender's long-term Ed25519 key, and stamped with a strictly increasing
//! nonce that the receiver uses to reject replays.
//!
//! # Layers
//!
//! ```text
//! Transport::send ──► session queue ──► session task ──► TCP
//!                                          │
//!                           Session::seal_at / open_at
//!                                          │
//!                         build_frame / verify_frame
//! ```
//!
//! - [`frame`]: The fixed wire layout of a frame
//! - [`session`]: Nonces, the key ratchet, `build_frame` / `verify_frame`
//! - [`handshake`]: Signed X25519 key agreement
//! - [`wire`]: Length-delimited stream envelopes
//! - [`transport`]: Listener, dialer and per-peer session tasks
//!
//! A rejected frame never changes session state. Errors are confined to the
//! session that produced them.

mod actor;
pub mod config;
pub mod directory;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod keys;
pub mod session;
mod table;
pub mod transport;
pub mod wire;

pub use actor::{Inbound, SessionEnd, SessionStatus};
pub use config::{DEFAULT_SERVICE, InvalidTransportConfig, TransportConfig};
pub use directory::{PeerDirectory, PeerInfo, StaticDirectory};
pub use error::{FrameRejected, TransportError};
pub use frame::{ClusterId, Frame, ServiceId, TickRef};
pub use session::{Session, SessionLimits, SessionStats, build_frame, verify_frame};
pub use table::{SessionExists, SessionKey, SessionSummary};
pub use transport::{LogicalTicks, TickSource, Transport};
