//! The syscall gateway handed to function workloads.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::RngCore;
use rand_chacha::ChaCha20Rng;
use tracing::warn;

use super::events::{CageEvent, MemoryOp};
use super::resources::{ResourceBreach, ResourceMeter};
use super::{Fault, SYSCALL_QUANTUM_NS, Syscall};
use crate::crypto::{Digest, DomainTag, domain_hash};
use crate::witness::{WitnessError, WitnessRecorder};

/// Returned by a gateway call when the run must stop.
///
/// Workloads propagate it with `?`. The cause has already been witnessed;
/// the cage decides the outcome from its own record, so swallowing an
/// interrupt does not change the result and every later call fails again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupt {
    reason: &'static str,
}

impl Interrupt {
    const fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    /// Short description of the cause.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        self.reason
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cage interrupted: {}", self.reason)
    }
}

impl std::error::Error for Interrupt {}

/// All mutable state of one run. The executor and the workload thread share
/// it behind a mutex; only one gateway call is in flight at a time.
#[derive(Debug)]
pub(crate) struct Region {
    pub(crate) recorder: WitnessRecorder,
    pub(crate) meter: ResourceMeter,
    rng: ChaCha20Rng,
    allowed: BTreeSet<Syscall>,
    env: BTreeMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
    pub(crate) written: BTreeMap<String, Vec<u8>>,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) fault: Option<Fault>,
    pub(crate) violations: u64,
    closed: bool,
}

impl Region {
    pub(crate) fn new(
        recorder: WitnessRecorder,
        meter: ResourceMeter,
        rng: ChaCha20Rng,
        allowed: BTreeSet<Syscall>,
        env: BTreeMap<String, String>,
        files: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            recorder,
            meter,
            rng,
            allowed,
            env,
            files,
            written: BTreeMap::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            fault: None,
            violations: 0,
            closed: false,
        }
    }

    pub(crate) fn lock(region: &Mutex<Self>) -> MutexGuard<'_, Self> {
        region.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event. Overflow becomes the run's fault.
    pub(crate) fn record(&mut self, event: &CageEvent) -> Result<(), Interrupt> {
        let result = event
            .encode()
            .map_err(WitnessError::from)
            .and_then(|data| self.recorder.record(event.op_type(), data));
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                self.fault = Some(Fault::WitnessOverflow(err));
                self.closed = true;
                Err(Interrupt::new("witness capacity exhausted"))
            },
        }
    }

    /// Witnesses `fault` and closes the region. The first fault wins.
    pub(crate) fn fail(&mut self, fault: Fault) -> Interrupt {
        if self.fault.is_some() {
            self.closed = true;
            return Interrupt::new("run already stopped");
        }
        let witnessed = match &fault {
            Fault::PolicyViolation { syscall, signal } => {
                self.violations += 1;
                Some((
                    CageEvent::PolicyViolation {
                        syscall: *syscall,
                        signal: *signal,
                    },
                    "policy violation",
                ))
            },
            Fault::ResourceExceeded(breach) => Some((
                CageEvent::ResourceExceeded {
                    kind: breach.kind,
                    limit: breach.limit,
                    observed: breach.observed,
                },
                "resource limit exceeded",
            )),
            Fault::Timeout { deadline_ms } => Some((
                CageEvent::Timeout {
                    deadline_ms: *deadline_ms,
                },
                "deadline expired",
            )),
            Fault::WitnessOverflow(_) => None,
        };
        let reason = match witnessed {
            Some((event, reason)) => {
                warn!(reason, ?fault, "cage run stopped");
                if let Err(interrupt) = self.record(&event) {
                    return interrupt;
                }
                reason
            },
            None => "witness capacity exhausted",
        };
        self.fault = Some(fault);
        self.closed = true;
        Interrupt::new(reason)
    }

    pub(crate) const fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// Admission check for one gateway call: open, allowed, within limits.
    pub(crate) fn gate(&mut self, syscall: Syscall) -> Result<(), Interrupt> {
        if self.closed {
            return Err(Interrupt::new("run already stopped"));
        }
        self.recorder.advance_clock(SYSCALL_QUANTUM_NS);
        if !self.allowed.contains(&syscall) {
            return Err(self.fail(Fault::PolicyViolation {
                syscall: Some(syscall),
                signal: None,
            }));
        }
        self.meter
            .charge_syscall()
            .and_then(|()| self.meter.check_wall_time())
            .map_err(|breach| self.breach(breach))
    }

    fn breach(&mut self, breach: ResourceBreach) -> Interrupt {
        self.fail(Fault::ResourceExceeded(breach))
    }
}

/// Gateway to every nondeterministic service a function workload may use.
///
/// Each call passes the allowlist and limit checks for its syscall, advances
/// virtual time by [`SYSCALL_QUANTUM_NS`], and appends a witness entry.
/// The context is neither `Send` nor `Sync` and cannot be cloned.
pub struct CageContext {
    region: Arc<Mutex<Region>>,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for CageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CageContext").finish_non_exhaustive()
    }
}

impl CageContext {
    pub(crate) const fn new(region: Arc<Mutex<Region>>) -> Self {
        Self {
            region,
            _not_send: PhantomData,
        }
    }

    fn region(&self) -> MutexGuard<'_, Region> {
        Region::lock(&self.region)
    }

    /// Performs an allowlisted syscall with no observable result.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if the syscall is denied or a limit is hit.
    pub fn invoke(&mut self, syscall: Syscall) -> Result<(), Interrupt> {
        let mut region = self.region();
        region.gate(syscall)?;
        region.record(&CageEvent::Syscall { syscall })
    }

    /// Appends to stdout.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `write` is denied or a limit is hit.
    pub fn write_stdout(&mut self, bytes: &[u8]) -> Result<(), Interrupt> {
        let mut region = self.region();
        region.gate(Syscall::Write)?;
        region.record(&CageEvent::Stdout {
            len: bytes.len() as u64,
            digest: output_digest(bytes),
        })?;
        region.stdout.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends to stderr.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `write` is denied or a limit is hit.
    pub fn write_stderr(&mut self, bytes: &[u8]) -> Result<(), Interrupt> {
        let mut region = self.region();
        region.gate(Syscall::Write)?;
        region.record(&CageEvent::Stderr {
            len: bytes.len() as u64,
            digest: output_digest(bytes),
        })?;
        region.stderr.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads a virtual file. Files written during the run shadow inputs.
    /// Returns `None` for unknown paths.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `openat` or `read` is denied or a limit is hit.
    pub fn read_file(&mut self, path: &str) -> Result<Option<Vec<u8>>, Interrupt> {
        let mut region = self.region();
        region.gate(Syscall::Openat)?;
        region.gate(Syscall::Read)?;
        let contents = region
            .written
            .get(path)
            .or_else(|| region.files.get(path))
            .cloned();
        region.record(&CageEvent::FileRead {
            path: path.to_string(),
            len: contents.as_ref().map_or(0, |c| c.len() as u64),
            digest: contents.as_deref().map(output_digest),
        })?;
        Ok(contents)
    }

    /// Writes a scratch file, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `openat` or `write` is denied or a limit is hit.
    pub fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<(), Interrupt> {
        let mut region = self.region();
        region.gate(Syscall::Openat)?;
        region.gate(Syscall::Write)?;
        region.record(&CageEvent::FileWrite {
            path: path.to_string(),
            len: contents.len() as u64,
            digest: output_digest(contents),
        })?;
        region.written.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    /// Fills `buf` from the seeded generator.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `getrandom` is denied or a limit is hit.
    pub fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), Interrupt> {
        let mut region = self.region();
        region.gate(Syscall::Getrandom)?;
        region.rng.fill_bytes(buf);
        region.record(&CageEvent::Random {
            len: buf.len() as u64,
            digest: output_digest(buf),
        })
    }

    /// One `u64` from the seeded generator.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `getrandom` is denied or a limit is hit.
    pub fn random_u64(&mut self) -> Result<u64, Interrupt> {
        let mut buf = [0u8; 8];
        self.random_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Virtual time in nanoseconds since the run started.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `clock_gettime` is denied or a limit is hit.
    pub fn now(&mut self) -> Result<u64, Interrupt> {
        let mut region = self.region();
        region.gate(Syscall::ClockGettime)?;
        let now_ns = region.recorder.now();
        region.record(&CageEvent::Clock { now_ns })?;
        Ok(now_ns)
    }

    /// Looks up a configured environment variable. Environment access is
    /// not a syscall, but the lookup is still witnessed.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if the run has stopped or the witness log is full.
    pub fn env_var(&mut self, name: &str) -> Result<Option<String>, Interrupt> {
        let mut region = self.region();
        if region.is_closed() {
            return Err(Interrupt::new("run already stopped"));
        }
        let value = region.env.get(name).cloned();
        region.record(&CageEvent::EnvRead {
            name: name.to_string(),
            present: value.is_some(),
        })?;
        Ok(value)
    }

    /// Reserves `bytes` against the memory limit.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `mmap` is denied or the memory limit is hit.
    pub fn reserve_memory(&mut self, bytes: u64) -> Result<(), Interrupt> {
        let mut region = self.region();
        region.gate(Syscall::Mmap)?;
        let current = match region.meter.reserve(bytes) {
            Ok(current) => current,
            Err(breach) => return Err(region.breach(breach)),
        };
        region.record(&CageEvent::Memory {
            op: MemoryOp::Reserve,
            bytes,
            current,
        })
    }

    /// Releases previously reserved memory.
    ///
    /// # Errors
    ///
    /// [`Interrupt`] if `munmap` is denied or a limit is hit.
    pub fn release_memory(&mut self, bytes: u64) -> Result<(), Interrupt> {
        let mut region = self.region();
        region.gate(Syscall::Munmap)?;
        let current = region.meter.release(bytes);
        region.record(&CageEvent::Memory {
            op: MemoryOp::Release,
            bytes,
            current,
        })
    }
}

fn output_digest(bytes: &[u8]) -> Digest {
    domain_hash(DomainTag::CanonicalRecord, bytes)
}
