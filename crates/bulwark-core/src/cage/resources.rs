//! Resource accounting against [`ResourceLimits`](super::ResourceLimits).

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::ResourceLimits;

/// A limited resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Elapsed wall-clock time, in milliseconds.
    WallTime,
    /// Reserved memory, in bytes.
    Memory,
    /// Gateway calls.
    Syscalls,
}

impl ResourceKind {
    /// Returns the kind as a string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WallTime => "wall_time",
            Self::Memory => "memory",
            Self::Syscalls => "syscalls",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A breached limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBreach {
    /// Which resource.
    pub kind: ResourceKind,
    /// Configured limit.
    pub limit: u64,
    /// Value that would have been reached.
    pub observed: u64,
}

impl fmt::Display for ResourceBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} limit {} exceeded (observed {})",
            self.kind, self.limit, self.observed
        )
    }
}

/// Usage snapshot for [`CageStats`](super::CageStats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Gateway calls that passed the allowlist.
    pub syscalls: u64,
    /// Currently reserved memory.
    pub memory_bytes: u64,
    /// Highest reserved memory seen.
    pub peak_memory_bytes: u64,
    /// Real elapsed time.
    pub wall_time: Duration,
}

/// Tracks usage for one run and reports the first breach.
#[derive(Debug)]
pub(crate) struct ResourceMeter {
    limits: ResourceLimits,
    usage: ResourceUsage,
    started: Option<Instant>,
}

impl ResourceMeter {
    pub(crate) const fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            usage: ResourceUsage {
                syscalls: 0,
                memory_bytes: 0,
                peak_memory_bytes: 0,
                wall_time: Duration::ZERO,
            },
            started: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub(crate) fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.usage.wall_time = started.elapsed();
        }
    }

    pub(crate) fn usage(&self) -> ResourceUsage {
        let mut usage = self.usage;
        if let Some(started) = self.started {
            usage.wall_time = started.elapsed();
        }
        usage
    }

    pub(crate) fn charge_syscall(&mut self) -> Result<(), ResourceBreach> {
        let next = self.usage.syscalls.saturating_add(1);
        if next > self.limits.max_syscalls {
            return Err(ResourceBreach {
                kind: ResourceKind::Syscalls,
                limit: self.limits.max_syscalls,
                observed: next,
            });
        }
        self.usage.syscalls = next;
        Ok(())
    }

    pub(crate) fn check_wall_time(&self) -> Result<(), ResourceBreach> {
        let Some(started) = self.started else {
            return Ok(());
        };
        let elapsed = started.elapsed();
        if elapsed > self.limits.max_wall_time {
            return Err(ResourceBreach {
                kind: ResourceKind::WallTime,
                limit: duration_ms(self.limits.max_wall_time),
                observed: duration_ms(elapsed),
            });
        }
        Ok(())
    }

    pub(crate) fn reserve(&mut self, bytes: u64) -> Result<u64, ResourceBreach> {
        let next = self.usage.memory_bytes.saturating_add(bytes);
        if next > self.limits.max_memory_bytes {
            return Err(ResourceBreach {
                kind: ResourceKind::Memory,
                limit: self.limits.max_memory_bytes,
                observed: next,
            });
        }
        self.usage.memory_bytes = next;
        self.usage.peak_memory_bytes = self.usage.peak_memory_bytes.max(next);
        Ok(next)
    }

    pub(crate) fn release(&mut self, bytes: u64) -> u64 {
        self.usage.memory_bytes = self.usage.memory_bytes.saturating_sub(bytes);
        self.usage.memory_bytes
    }

    /// Records an externally measured peak (child process RSS).
    pub(crate) fn observe_peak_memory(&mut self, bytes: u64) {
        self.usage.peak_memory_bytes = self.usage.peak_memory_bytes.max(bytes);
    }

    /// Memory breach for a finished child: the observed peak reached the
    /// limit, or the child died the way an exhausted address space kills it.
    pub(crate) const fn memory_breach(&self, abnormal_exit: bool) -> Option<ResourceBreach> {
        let limit = self.limits.max_memory_bytes;
        let peak = self.usage.peak_memory_bytes;
        if abnormal_exit || peak >= limit {
            Some(ResourceBreach {
                kind: ResourceKind::Memory,
                limit,
                observed: peak,
            })
        } else {
            None
        }
    }
}

/// Milliseconds, saturating at `u64::MAX`.
pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
