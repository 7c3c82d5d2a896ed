//! Cage configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::{CageError, Syscall};

/// Default witness capacity (4 MiB).
pub const DEFAULT_MAX_WITNESS_SIZE: usize = 4 * 1024 * 1024;

/// Resource limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Real elapsed time allowed for the workload.
    pub max_wall_time: Duration,
    /// Memory the workload may reserve (`RLIMIT_AS` for commands).
    pub max_memory_bytes: u64,
    /// Gateway calls allowed for function workloads.
    pub max_syscalls: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_wall_time: Duration::from_secs(30),
            max_memory_bytes: 256 * 1024 * 1024,
            max_syscalls: 100_000,
        }
    }
}

/// Immutable configuration of one [`DeterminismCage`](super::DeterminismCage).
///
/// Two cages with equal configurations running the same workload produce
/// identical sealed witness logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CageConfig {
    /// Syscalls the workload may perform.
    pub allowed_syscalls: BTreeSet<Syscall>,
    /// Seed for the ChaCha20 generator.
    pub rng_seed: [u8; 32],
    /// Witness log capacity in encoded bytes.
    pub max_witness_size: usize,
    /// Resource limits.
    pub resource_limits: ResourceLimits,
    /// Environment visible to the workload.
    pub env: BTreeMap<String, String>,
    /// Read-only virtual input files for function workloads.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Install a seccomp filter for command workloads (Linux x86_64 only).
    pub kernel_filter: bool,
}

impl CageConfig {
    /// Starts a builder with the `pure` profile and the given seed.
    #[must_use]
    pub fn builder(rng_seed: [u8; 32]) -> CageBuilder {
        CageBuilder::new(rng_seed)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// [`CageError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), CageError> {
        let invalid = |reason: &str| {
            Err(CageError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.max_witness_size == 0 {
            return invalid("max_witness_size must be nonzero");
        }
        if self.resource_limits.max_wall_time.is_zero() {
            return invalid("max_wall_time must be nonzero");
        }
        if self.resource_limits.max_memory_bytes == 0 {
            return invalid("max_memory_bytes must be nonzero");
        }
        if self.resource_limits.max_syscalls == 0 {
            return invalid("max_syscalls must be nonzero");
        }
        for name in self.env.keys() {
            if name.is_empty() || name.contains(['=', '\0']) {
                return Err(CageError::InvalidConfig {
                    reason: format!("invalid environment variable name: {name:?}"),
                });
            }
        }
        if self.env.values().any(|v| v.contains('\0')) {
            return invalid("environment values must not contain NUL");
        }
        if self.files.keys().any(String::is_empty) {
            return invalid("virtual file paths must be nonempty");
        }
        if self.kernel_filter {
            if !cfg!(all(target_os = "linux", target_arch = "x86_64")) {
                return invalid("kernel_filter requires linux x86_64");
            }
            if !self.allowed_syscalls.contains(&Syscall::Execve) {
                return invalid("kernel_filter requires execve in allowed_syscalls");
            }
        }
        Ok(())
    }

    /// Whether `syscall` is on the allowlist.
    #[must_use]
    pub fn allows(&self, syscall: Syscall) -> bool {
        self.allowed_syscalls.contains(&syscall)
    }
}

/// Builder for [`CageConfig`].
#[derive(Debug, Clone)]
pub struct CageBuilder {
    config: CageConfig,
}

impl CageBuilder {
    /// Starts from the `pure` profile, default limits and capacity.
    #[must_use]
    pub fn new(rng_seed: [u8; 32]) -> Self {
        Self {
            config: CageConfig {
                allowed_syscalls: Syscall::pure_profile().into_iter().collect(),
                rng_seed,
                max_witness_size: DEFAULT_MAX_WITNESS_SIZE,
                resource_limits: ResourceLimits::default(),
                env: BTreeMap::new(),
                files: BTreeMap::new(),
                kernel_filter: false,
            },
        }
    }

    /// Replaces the allowlist.
    #[must_use]
    pub fn allowed_syscalls(mut self, syscalls: impl IntoIterator<Item = Syscall>) -> Self {
        self.config.allowed_syscalls = syscalls.into_iter().collect();
        self
    }

    /// Adds one syscall to the allowlist.
    #[must_use]
    pub fn allow(mut self, syscall: Syscall) -> Self {
        self.config.allowed_syscalls.insert(syscall);
        self
    }

    /// Removes one syscall from the allowlist.
    #[must_use]
    pub fn deny(mut self, syscall: Syscall) -> Self {
        self.config.allowed_syscalls.remove(&syscall);
        self
    }

    /// Switches to the `command` profile.
    #[must_use]
    pub fn command_profile(self) -> Self {
        self.allowed_syscalls(Syscall::command_profile())
    }

    /// Sets the witness capacity.
    #[must_use]
    pub const fn max_witness_size(mut self, bytes: usize) -> Self {
        self.config.max_witness_size = bytes;
        self
    }

    /// Sets all resource limits.
    #[must_use]
    pub const fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.config.resource_limits = limits;
        self
    }

    /// Sets the wall-time limit.
    #[must_use]
    pub const fn max_wall_time(mut self, limit: Duration) -> Self {
        self.config.resource_limits.max_wall_time = limit;
        self
    }

    /// Sets the memory limit.
    #[must_use]
    pub const fn max_memory_bytes(mut self, limit: u64) -> Self {
        self.config.resource_limits.max_memory_bytes = limit;
        self
    }

    /// Sets the gateway call limit.
    #[must_use]
    pub const fn max_syscalls(mut self, limit: u64) -> Self {
        self.config.resource_limits.max_syscalls = limit;
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(name.into(), value.into());
        self
    }

    /// Adds a read-only virtual input file.
    #[must_use]
    pub fn file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.config.files.insert(path.into(), contents.into());
        self
    }

    /// Enables or disables the kernel filter.
    #[must_use]
    pub const fn kernel_filter(mut self, enabled: bool) -> Self {
        self.config.kernel_filter = enabled;
        self
    }

    /// Returns the configuration without validating it; validation happens
    /// in [`DeterminismCage::activate`](super::DeterminismCage::activate).
    #[must_use]
    pub fn build(self) -> CageConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_validate() {
        let config = CageBuilder::new([7; 32]).build();
        config.validate().unwrap();
        assert!(config.allows(Syscall::Getrandom));
        assert!(!config.allows(Syscall::Socket));
    }

    #[test]
    fn allow_and_deny() {
        let config = CageBuilder::new([0; 32])
            .allow(Syscall::Socket)
            .deny(Syscall::Getrandom)
            .build();
        assert!(config.allows(Syscall::Socket));
        assert!(!config.allows(Syscall::Getrandom));
    }

    #[test]
    fn rejects_zero_limits() {
        for config in [
            CageBuilder::new([0; 32]).max_witness_size(0).build(),
            CageBuilder::new([0; 32]).max_syscalls(0).build(),
            CageBuilder::new([0; 32]).max_memory_bytes(0).build(),
            CageBuilder::new([0; 32]).max_wall_time(Duration::ZERO).build(),
        ] {
            assert!(matches!(
                config.validate(),
                Err(CageError::InvalidConfig { .. })
            ));
        }
    }

    #[test]
    fn rejects_bad_env_names() {
        let config = CageBuilder::new([0; 32]).env("A=B", "x").build();
        assert!(config.validate().is_err());
        let config = CageBuilder::new([0; 32]).env("", "x").build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn kernel_filter_needs_execve() {
        let config = CageBuilder::new([0; 32]).kernel_filter(true).build();
        assert!(config.validate().is_err());
    }
}
