//! Node configuration parsing and validation.
//!
//! ```toml
//! [node]
//! cluster_id = "0123456789abcdef0123456789abcdef"
//! key_dir = "/var/lib/bulwark/keys"
//! listen = "0.0.0.0:7400"
//!
//! [[node.peers]]
//! cluster_id = "fedcba9876543210fedcba9876543210"
//! public_key = "<64 hex chars>"
//! address = "10.0.0.2:7400"
//!
//! [cage]
//! profile = "pure"
//! max_wall_time_ms = 30000
//!
//! [transport]
//! idle_timeout_ms = 60000
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Durations are integer milliseconds. Every section but `[node]` may be
//! omitted.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bulwark_core::cage::{CageConfig, ResourceLimits, Syscall};
use bulwark_core::crypto::{PUBLIC_KEY_SIZE, parse_verifying_key};
use bulwark_transport::{ClusterId, PeerInfo, ServiceId, SessionLimits, TransportConfig};
use serde::{Deserialize, Serialize};

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity, keys and peers.
    pub node: NodeSection,

    /// Sandbox settings applied to every execution.
    #[serde(default)]
    pub cage: CageSection,

    /// Session and connection settings.
    #[serde(default)]
    pub transport: TransportSection,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl NodeConfig {
    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`validate`](Self::validate).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks identities, syscall names and limits.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] naming the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let local = self.cluster_id()?;
        if self.node.key_name.is_empty() {
            return Err(invalid("node.key_name must not be empty"));
        }
        let mut seen = HashSet::new();
        for (cluster, _) in self.peers()? {
            if cluster == local {
                return Err(invalid(format!("peer {cluster} is this node")));
            }
            if !seen.insert(cluster) {
                return Err(invalid(format!("peer {cluster} listed twice")));
            }
        }
        self.cage_config([0; 32])?;
        self.transport_config()?;
        Ok(())
    }

    /// This node's cluster id.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] if `node.cluster_id` is not 32 hex digits.
    pub fn cluster_id(&self) -> Result<ClusterId, ConfigError> {
        ClusterId::from_str(&self.node.cluster_id)
            .map_err(|e| invalid(format!("node.cluster_id: {e}")))
    }

    /// Configured peers, parsed.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] for a malformed id or key.
    pub fn peers(&self) -> Result<Vec<(ClusterId, PeerInfo)>, ConfigError> {
        self.node.peers.iter().map(PeerConfig::parse).collect()
    }

    /// Cage configuration for one run seeded with `rng_seed`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] for an unknown syscall name or a limit the
    /// cage refuses.
    pub fn cage_config(&self, rng_seed: [u8; 32]) -> Result<CageConfig, ConfigError> {
        self.cage.build(rng_seed)
    }

    /// Runtime transport configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] if the values are inconsistent.
    pub fn transport_config(&self) -> Result<TransportConfig, ConfigError> {
        self.transport.build()
    }
}

/// `[node]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSection {
    /// 16-byte cluster id as 32 hex digits.
    pub cluster_id: String,

    /// Directory of the file key store.
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    /// Name of the signing key inside `key_dir`; generated on first start.
    #[serde(default = "default_key_name")]
    pub key_name: String,

    /// Address to accept peer connections on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,

    /// Known peers.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_key_name() -> String {
    "node".to_string()
}

/// `[[node.peers]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer cluster id, 32 hex digits.
    pub cluster_id: String,

    /// Peer Ed25519 public key, 64 hex digits.
    pub public_key: String,

    /// Dial address. Peers without one can still connect to us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,
}

impl PeerConfig {
    fn parse(&self) -> Result<(ClusterId, PeerInfo), ConfigError> {
        let cluster = ClusterId::from_str(&self.cluster_id)
            .map_err(|e| invalid(format!("peer cluster_id: {e}")))?;
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| invalid(format!("peer {cluster} public_key: {e}")))?;
        let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            invalid(format!("peer {cluster} public_key must be {PUBLIC_KEY_SIZE} bytes"))
        })?;
        let verifying_key = parse_verifying_key(&bytes)
            .map_err(|e| invalid(format!("peer {cluster} public_key: {e}")))?;
        Ok((
            cluster,
            PeerInfo {
                verifying_key,
                address: self.address,
            },
        ))
    }
}

/// Base syscall allowlist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CageProfile {
    /// In-process functions only.
    #[default]
    Pure,
    /// Dynamically linked single-threaded commands.
    Command,
}

/// `[cage]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CageSection {
    /// Starting allowlist.
    #[serde(default)]
    pub profile: CageProfile,

    /// Syscall names added to the profile.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Syscall names removed from the profile.
    #[serde(default)]
    pub deny: Vec<String>,

    /// Witness log capacity in encoded bytes.
    #[serde(default = "default_max_witness_size")]
    pub max_witness_size: usize,

    /// Wall-time limit per run.
    #[serde(default = "default_max_wall_time_ms")]
    pub max_wall_time_ms: u64,

    /// Memory limit per run.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// Gateway call limit per function run.
    #[serde(default = "default_max_syscalls")]
    pub max_syscalls: u64,

    /// Install the seccomp filter for commands.
    #[serde(default)]
    pub kernel_filter: bool,

    /// Environment visible to workloads.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for CageSection {
    fn default() -> Self {
        Self {
            profile: CageProfile::default(),
            allow: Vec::new(),
            deny: Vec::new(),
            max_witness_size: default_max_witness_size(),
            max_wall_time_ms: default_max_wall_time_ms(),
            max_memory_bytes: default_max_memory_bytes(),
            max_syscalls: default_max_syscalls(),
            kernel_filter: false,
            env: BTreeMap::new(),
        }
    }
}

const fn default_max_witness_size() -> usize {
    4 * 1024 * 1024
}

fn default_max_wall_time_ms() -> u64 {
    millis(ResourceLimits::default().max_wall_time)
}

fn default_max_memory_bytes() -> u64 {
    ResourceLimits::default().max_memory_bytes
}

fn default_max_syscalls() -> u64 {
    ResourceLimits::default().max_syscalls
}

impl CageSection {
    fn build(&self, rng_seed: [u8; 32]) -> Result<CageConfig, ConfigError> {
        let mut builder = CageConfig::builder(rng_seed);
        if self.profile == CageProfile::Command {
            builder = builder.command_profile();
        }
        for name in &self.allow {
            builder = builder.allow(syscall(name)?);
        }
        for name in &self.deny {
            builder = builder.deny(syscall(name)?);
        }
        for (name, value) in &self.env {
            builder = builder.env(name, value);
        }
        let config = builder
            .max_witness_size(self.max_witness_size)
            .resource_limits(ResourceLimits {
                max_wall_time: Duration::from_millis(self.max_wall_time_ms),
                max_memory_bytes: self.max_memory_bytes,
                max_syscalls: self.max_syscalls,
            })
            .kernel_filter(self.kernel_filter)
            .build();
        config
            .validate()
            .map_err(|e| invalid(format!("cage: {e}")))?;
        Ok(config)
    }
}

fn syscall(name: &str) -> Result<Syscall, ConfigError> {
    Syscall::from_str(name).map_err(|e| invalid(format!("cage: {e}")))
}

/// `[transport]`. Missing keys take the runtime defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Service name; its hash goes into every frame.
    pub service: String,
    /// Rotate the send key after this many frames.
    pub rotate_after_frames: u64,
    /// Rotate the send key at this age.
    pub rotation_interval_ms: u64,
    /// Previous receive key lifetime after a rotation.
    pub overlap_window_ms: u64,
    /// Idle sessions expire after this long.
    pub idle_timeout_ms: u64,
    /// Dial plus handshake deadline.
    pub handshake_timeout_ms: u64,
    /// Per-frame write deadline.
    pub send_timeout_ms: u64,
    /// Outgoing queue depth per session.
    pub queue_capacity: usize,
    /// Depth of the received-payload channel.
    pub inbound_capacity: usize,
    /// Rejected frames tolerated per session.
    pub rejection_threshold: u32,
    /// Largest envelope accepted from the wire.
    pub max_envelope_len: usize,
    /// Session expiry check period.
    pub maintenance_interval_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        let runtime = TransportConfig::default();
        Self {
            service: bulwark_transport::DEFAULT_SERVICE.to_string(),
            rotate_after_frames: runtime.limits.rotate_after_frames,
            rotation_interval_ms: millis(runtime.limits.rotation_interval),
            overlap_window_ms: millis(runtime.limits.overlap_window),
            idle_timeout_ms: millis(runtime.limits.idle_timeout),
            handshake_timeout_ms: millis(runtime.handshake_timeout),
            send_timeout_ms: millis(runtime.send_timeout),
            queue_capacity: runtime.queue_capacity,
            inbound_capacity: runtime.inbound_capacity,
            rejection_threshold: runtime.rejection_threshold,
            max_envelope_len: runtime.max_envelope_len,
            maintenance_interval_ms: millis(runtime.maintenance_interval),
        }
    }
}

impl TransportSection {
    fn build(&self) -> Result<TransportConfig, ConfigError> {
        if self.service.is_empty() {
            return Err(invalid("transport.service must not be empty"));
        }
        let config = TransportConfig {
            service: ServiceId::from_name(&self.service),
            limits: SessionLimits {
                rotate_after_frames: self.rotate_after_frames,
                rotation_interval: Duration::from_millis(self.rotation_interval_ms),
                overlap_window: Duration::from_millis(self.overlap_window_ms),
                idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            },
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            queue_capacity: self.queue_capacity,
            inbound_capacity: self.inbound_capacity,
            rejection_threshold: self.rejection_threshold,
            max_envelope_len: self.max_envelope_len,
            maintenance_interval: Duration::from_millis(self.maintenance_interval_ms),
        };
        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.0))?;
        Ok(config)
    }
}

/// `[logging]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directives, e.g. `info` or `bulwark_transport=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append logs to this file instead of stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation(reason.into())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
