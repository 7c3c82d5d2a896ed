//! Known peers: long-term keys and dial addresses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use bulwark_core::crypto::VerifyingKey;

use crate::frame::ClusterId;

/// A known remote cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Long-term Ed25519 key that signs the peer's hellos and frames.
    pub verifying_key: VerifyingKey,
    /// Where to dial the peer, if it accepts connections.
    pub address: Option<SocketAddr>,
}

/// Lookup of peer identities.
///
/// A hello from a cluster the directory does not know is refused.
pub trait PeerDirectory: Send + Sync {
    /// The peer's entry, if known.
    fn lookup(&self, cluster: &ClusterId) -> Option<PeerInfo>;
}

/// In-memory directory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    peers: RwLock<HashMap<ClusterId, PeerInfo>>,
}

impl StaticDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a peer.
    pub fn insert(&self, cluster: ClusterId, info: PeerInfo) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cluster, info);
    }

    /// Forgets a peer.
    pub fn remove(&self, cluster: &ClusterId) -> Option<PeerInfo> {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cluster)
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerDirectory for StaticDirectory {
    fn lookup(&self, cluster: &ClusterId) -> Option<PeerInfo> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster)
            .copied()
    }
}
