//! The cage itself: lifecycle, workload execution and sealing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::context::{CageContext, Interrupt, Region};
use super::events::{CageEvent, Workload};
use super::resources::{ResourceBreach, ResourceKind, ResourceMeter, ResourceUsage, duration_ms};
use super::{
    CageConfig, CageError, CageState, EXIT_PANIC, EXIT_SPAWN_FAILED, Fault, SEED_ENV_VAR, Syscall,
};
use crate::canonical::{self, SerializationError};
use crate::crypto::{Digest, DomainTag, domain_hash};
use crate::witness::{RecorderStats, WitnessError, WitnessLog, WitnessRecorder};

/// Outcome of one run.
///
/// `duration` is virtual time from the cage's logical clock, so equal runs
/// produce equal results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Workload exit code, or the fault code for abnormal ends.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
    /// Virtual execution time.
    pub duration: Duration,
    /// [`WitnessLog::digest`] of the sealed log.
    pub witness_digest: Digest,
}

impl ExecutionResult {
    /// `domain_hash(ExecutionResult, encode(self))`.
    pub fn hash(&self) -> Result<Digest, SerializationError> {
        Ok(domain_hash(DomainTag::ExecutionResult, &canonical::encode(self)?))
    }
}

/// Cage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CageStats {
    /// Current state.
    pub state: CageState,
    /// Resource usage of the run.
    pub usage: ResourceUsage,
    /// Policy violations witnessed.
    pub violations: u64,
    /// Witness recorder statistics, captured at seal time once sealed.
    pub witness: Option<RecorderStats>,
}

#[derive(Debug)]
enum Completion {
    Exited(i32),
    Interrupted,
    Panicked,
    Expired(Fault),
    SpawnFailed(std::io::Error),
}

/// Runs exactly one workload deterministically and seals its witness log.
///
/// ```no_run
/// # async fn demo() -> Result<(), bulwark_core::cage::CageError> {
/// use bulwark_core::cage::{CageConfig, DeterminismCage};
///
/// let mut cage = DeterminismCage::new(CageConfig::builder([7; 32]).build());
/// cage.activate()?;
/// let result = cage
///     .execute_function(|ctx| {
///         let n = ctx.random_u64()?;
///         ctx.write_stdout(format!("{n}").as_bytes())?;
///         Ok(0)
///     })
///     .await?;
/// assert_eq!(result.exit_code, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DeterminismCage {
    config: CageConfig,
    state: CageState,
    region: Option<Arc<Mutex<Region>>>,
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    filter: Option<Arc<seccompiler::BpfProgram>>,
    log: Option<WitnessLog>,
    result: Option<ExecutionResult>,
    sealed_stats: Option<RecorderStats>,
}

impl DeterminismCage {
    /// Creates an idle cage.
    #[must_use]
    pub const fn new(config: CageConfig) -> Self {
        Self {
            config,
            state: CageState::Idle,
            region: None,
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            filter: None,
            log: None,
            result: None,
            sealed_stats: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> CageState {
        self.state
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &CageConfig {
        &self.config
    }

    /// The sealed witness log, once sealed.
    #[must_use]
    pub const fn witness_log(&self) -> Option<&WitnessLog> {
        self.log.as_ref()
    }

    /// The execution result, once sealed. Also set when the run ended with
    /// a fault.
    #[must_use]
    pub const fn execution_result(&self) -> Option<&ExecutionResult> {
        self.result.as_ref()
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CageStats {
        let (usage, violations, live) = self.region.as_ref().map_or(
            (ResourceUsage::default(), 0, None),
            |region| {
                let region = Region::lock(region);
                (
                    region.meter.usage(),
                    region.violations,
                    Some(region.recorder.stats()),
                )
            },
        );
        CageStats {
            state: self.state,
            usage,
            violations,
            witness: self.sealed_stats.or(live),
        }
    }

    fn transition(&mut self, to: CageState) -> Result<(), CageError> {
        if !self.state.can_transition_to(&to) {
            return Err(CageError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(from = %self.state, to = %to, "cage transition");
        self.state = to;
        Ok(())
    }

    /// Validates the configuration and prepares the seeded services.
    ///
    /// # Errors
    ///
    /// - [`CageError::InvalidState`] unless idle
    /// - [`CageError::InvalidConfig`] or [`CageError::Filter`]; the cage is
    ///   then terminated
    pub fn activate(&mut self) -> Result<(), CageError> {
        if self.state != CageState::Idle {
            return Err(CageError::InvalidState {
                operation: "activate",
                state: self.state,
            });
        }
        self.transition(CageState::Configuring)?;
        if let Err(err) = self.prepare() {
            warn!(error = %err, "cage configuration rejected");
            self.transition(CageState::Terminated)?;
            return Err(err);
        }
        self.transition(CageState::Active)?;
        info!(
            allowed_syscalls = self.config.allowed_syscalls.len(),
            max_witness_size = self.config.max_witness_size,
            kernel_filter = self.config.kernel_filter,
            "cage active"
        );
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), CageError> {
        self.config.validate()?;

        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        if self.config.kernel_filter {
            let program = super::seccomp::compile(&self.config.allowed_syscalls)?;
            self.filter = Some(Arc::new(program));
        }

        let region = Region::new(
            WitnessRecorder::new(self.config.max_witness_size),
            ResourceMeter::new(self.config.resource_limits),
            ChaCha20Rng::from_seed(self.config.rng_seed),
            self.config.allowed_syscalls.clone(),
            self.config.env.clone(),
            self.config.files.clone(),
        );
        self.region = Some(Arc::new(Mutex::new(region)));
        Ok(())
    }

    /// Stops the cage without running (or finishing) a workload.
    ///
    /// # Errors
    ///
    /// [`CageError::InvalidTransition`] once sealed or terminated.
    pub fn terminate(&mut self) -> Result<(), CageError> {
        self.transition(CageState::Terminated)?;
        if let Some(region) = &self.region {
            let mut region = Region::lock(region);
            region.close();
            region.meter.stop();
        }
        Ok(())
    }

    /// Runs `workload` with the configured wall-time limit.
    ///
    /// # Errors
    ///
    /// - [`CageError::InvalidState`] unless active
    /// - [`CageError::PolicyViolation`], [`CageError::ResourceExceeded`],
    ///   [`CageError::WorkloadPanicked`] after the log is sealed
    /// - [`CageError::WitnessOverflow`]; the cage is terminated
    pub async fn execute_function<F>(&mut self, workload: F) -> Result<ExecutionResult, CageError>
    where
        F: FnOnce(&mut CageContext) -> Result<i32, Interrupt> + Send + 'static,
    {
        self.run_function(None, workload).await
    }

    /// Runs `workload`, cancelling it when `deadline` expires.
    ///
    /// # Errors
    ///
    /// As [`execute_function`](Self::execute_function), plus
    /// [`CageError::Timeout`] after the `Timeout` entry is sealed.
    ///
    /// The workload's blocking thread cannot be preempted. After expiry it
    /// keeps running until its next [`CageContext`] call, which fails
    /// because the region is closed. A workload that never calls the
    /// context again holds its thread until it returns.
    pub async fn execute_function_with_deadline<F>(
        &mut self,
        deadline: Duration,
        workload: F,
    ) -> Result<ExecutionResult, CageError>
    where
        F: FnOnce(&mut CageContext) -> Result<i32, Interrupt> + Send + 'static,
    {
        self.run_function(Some(deadline), workload).await
    }

    #[instrument(skip(self, workload))]
    async fn run_function<F>(
        &mut self,
        deadline: Option<Duration>,
        workload: F,
    ) -> Result<ExecutionResult, CageError>
    where
        F: FnOnce(&mut CageContext) -> Result<i32, Interrupt> + Send + 'static,
    {
        let region = self.begin("execute_function")?;
        if !Self::spawn(&region, Workload::Function) {
            return self.finish(&region, Completion::Interrupted);
        }

        let (limit, expiry) = self.expiry(deadline);
        let worker = Arc::clone(&region);
        let handle = tokio::task::spawn_blocking(move || {
            let mut ctx = CageContext::new(worker);
            workload(&mut ctx)
        });

        // On expiry the blocking thread is detached; its next gateway call
        // finds the region closed.
        let completion = match tokio::time::timeout(limit, handle).await {
            Ok(Ok(Ok(code))) => Completion::Exited(code),
            Ok(Ok(Err(_))) => Completion::Interrupted,
            Ok(Err(_)) => Completion::Panicked,
            Err(_) => Completion::Expired(expiry),
        };
        self.finish(&region, completion)
    }

    /// Runs `argv` as a child process with the configured wall-time limit.
    ///
    /// # Errors
    ///
    /// - [`CageError::InvalidState`] unless active
    /// - [`CageError::InvalidConfig`] for an empty `argv`
    /// - [`CageError::Spawn`] if the process cannot be started or awaited,
    ///   after the log is sealed with [`EXIT_SPAWN_FAILED`]
    /// - [`CageError::PolicyViolation`], [`CageError::ResourceExceeded`]
    ///   after the log is sealed
    /// - [`CageError::WitnessOverflow`]; the cage is terminated
    pub async fn execute_command(&mut self, argv: &[String]) -> Result<ExecutionResult, CageError> {
        self.run_command(None, argv).await
    }

    /// Runs `argv`, killing it when `deadline` expires.
    ///
    /// # Errors
    ///
    /// As [`execute_command`](Self::execute_command), plus
    /// [`CageError::Timeout`] after the `Timeout` entry is sealed.
    pub async fn execute_command_with_deadline(
        &mut self,
        deadline: Duration,
        argv: &[String],
    ) -> Result<ExecutionResult, CageError> {
        self.run_command(Some(deadline), argv).await
    }

    #[instrument(skip(self), fields(program = argv.first().map(String::as_str)))]
    async fn run_command(
        &mut self,
        deadline: Option<Duration>,
        argv: &[String],
    ) -> Result<ExecutionResult, CageError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(CageError::InvalidConfig {
                reason: "command argv is empty".to_string(),
            });
        };
        let region = self.begin("execute_command")?;
        if !Self::spawn(
            &region,
            Workload::Command {
                argv: argv.to_vec(),
            },
        ) {
            return self.finish(&region, Completion::Interrupted);
        }

        // The userland check witnesses a denied exec; the kernel filter covers
        // everything after it.
        if Region::lock(&region).gate(Syscall::Execve).is_err() {
            return self.finish(&region, Completion::Interrupted);
        }

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&self.config.env)
            .env(SEED_ENV_VAR, hex::encode(self.config.rng_seed))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        self.install_child_hooks(&mut cmd);

        let baseline = children_peak_rss();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return self.finish(&region, Completion::SpawnFailed(err)),
        };

        let (limit, expiry) = self.expiry(deadline);
        let completion = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut r = Region::lock(&region);
                observe_child_memory(&mut r, baseline);
                let recorded = record_output(&mut r, output.stdout, output.stderr);
                if recorded {
                    exit_completion(&mut r, output.status)
                } else {
                    Completion::Interrupted
                }
            },
            Ok(Err(err)) => Completion::SpawnFailed(err),
            Err(_) => Completion::Expired(expiry),
        };
        self.finish(&region, completion)
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn install_child_hooks(&self, cmd: &mut tokio::process::Command) {
        use nix::sys::resource::{Resource, setrlimit};

        let memory = self.config.resource_limits.max_memory_bytes;
        #[cfg(target_arch = "x86_64")]
        let filter = self.filter.clone();

        // SAFETY: the hook runs between fork and exec in the child. It only
        // calls setrlimit, prctl and seccomp, which are async-signal-safe,
        // and touches no locks or allocator state shared with the parent.
        unsafe {
            cmd.pre_exec(move || {
                setrlimit(Resource::RLIMIT_AS, memory, memory).map_err(std::io::Error::from)?;
                #[cfg(target_arch = "x86_64")]
                if let Some(program) = &filter {
                    super::seccomp::apply(program)?;
                }
                Ok(())
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn install_child_hooks(&self, _cmd: &mut tokio::process::Command) {}

    fn begin(&self, operation: &'static str) -> Result<Arc<Mutex<Region>>, CageError> {
        match (&self.state, &self.region) {
            (CageState::Active, Some(region)) => Ok(Arc::clone(region)),
            _ => Err(CageError::InvalidState {
                operation,
                state: self.state,
            }),
        }
    }

    /// Starts the meter and witnesses the spawn. Returns `false` on overflow.
    fn spawn(region: &Mutex<Region>, workload: Workload) -> bool {
        let mut region = Region::lock(region);
        region.meter.start();
        region.record(&CageEvent::Spawn { workload }).is_ok()
    }

    fn expiry(&self, deadline: Option<Duration>) -> (Duration, Fault) {
        let max = self.config.resource_limits.max_wall_time;
        match deadline {
            Some(deadline) if deadline < max => (
                deadline,
                Fault::Timeout {
                    deadline_ms: duration_ms(deadline),
                },
            ),
            _ => (
                max,
                Fault::ResourceExceeded(ResourceBreach {
                    kind: ResourceKind::WallTime,
                    limit: duration_ms(max),
                    observed: duration_ms(max),
                }),
            ),
        }
    }

    fn abort_overflow(&mut self, err: WitnessError) -> CageError {
        warn!(error = %err, "witness overflow, cage terminated without a log");
        self.state = CageState::Terminated;
        CageError::WitnessOverflow(err)
    }

    /// Witnesses the exit, seals the log, and reports the outcome.
    fn finish(
        &mut self,
        region: &Mutex<Region>,
        completion: Completion,
    ) -> Result<ExecutionResult, CageError> {
        let mut r = Region::lock(region);
        if let Completion::Expired(fault) = &completion {
            r.fail(fault.clone());
        }
        r.close();
        r.meter.stop();

        let (exit_code, error) = match (r.fault.clone(), completion) {
            (Some(Fault::WitnessOverflow(err)), _) => {
                drop(r);
                return Err(self.abort_overflow(err));
            },
            (Some(fault), _) => (fault.exit_code(), Some(fault.into_error())),
            (None, Completion::Exited(code)) => (code, None),
            (None, Completion::Panicked) => (EXIT_PANIC, Some(CageError::WorkloadPanicked)),
            (None, Completion::SpawnFailed(err)) => {
                warn!(error = %err, "cage command failed");
                (EXIT_SPAWN_FAILED, Some(CageError::Spawn(err)))
            },
            (None, Completion::Interrupted | Completion::Expired(_)) => (1, None),
        };

        if r.record(&CageEvent::Exit { code: exit_code }).is_err() {
            let err = match r.fault.take() {
                Some(Fault::WitnessOverflow(err)) => err,
                _ => WitnessError::IntegrityViolation {
                    reason: "exit entry not recorded".to_string(),
                },
            };
            drop(r);
            return Err(self.abort_overflow(err));
        }

        let recorder_stats = r.recorder.stats();
        let log = match r.recorder.seal() {
            Ok(log) => log,
            Err(err) => {
                drop(r);
                return Err(self.abort_overflow(err));
            },
        };
        let result = ExecutionResult {
            exit_code,
            stdout: std::mem::take(&mut r.stdout),
            stderr: std::mem::take(&mut r.stderr),
            duration: Duration::from_nanos(r.recorder.now()),
            witness_digest: log.digest(),
        };
        drop(r);

        self.state = CageState::Sealed;
        self.sealed_stats = Some(recorder_stats);
        info!(
            exit_code,
            entries = log.len(),
            witness_digest = %result.witness_digest,
            "cage sealed"
        );
        self.log = Some(log);
        self.result = Some(result.clone());

        match error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }
}

/// Witnesses captured output. Returns `false` on overflow.
fn record_output(region: &mut Region, stdout: Vec<u8>, stderr: Vec<u8>) -> bool {
    let digest = |bytes: &[u8]| domain_hash(DomainTag::CanonicalRecord, bytes);
    if !stdout.is_empty() {
        let event = CageEvent::Stdout {
            len: stdout.len() as u64,
            digest: digest(&stdout),
        };
        if region.record(&event).is_err() {
            return false;
        }
    }
    if !stderr.is_empty() {
        let event = CageEvent::Stderr {
            len: stderr.len() as u64,
            digest: digest(&stderr),
        };
        if region.record(&event).is_err() {
            return false;
        }
    }
    region.stdout = stdout;
    region.stderr = stderr;
    true
}

#[cfg(unix)]
fn exit_completion(region: &mut Region, status: std::process::ExitStatus) -> Completion {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal();
    if signal == Some(libc::SIGSYS) {
        region.fail(Fault::PolicyViolation {
            syscall: None,
            signal,
        });
        return Completion::Interrupted;
    }
    let code = status
        .code()
        .or_else(|| signal.map(|signal| 128 + signal))
        .unwrap_or(1);
    if let Some(breach) = region.meter.memory_breach(memory_death(signal, code)) {
        region.fail(Fault::ResourceExceeded(breach));
        return Completion::Interrupted;
    }
    Completion::Exited(code)
}

/// Whether the child died the way `RLIMIT_AS` exhaustion kills a process,
/// either by signal or as a shell reporting `128 + signal`.
#[cfg(unix)]
fn memory_death(signal: Option<i32>, code: i32) -> bool {
    const SIGNALS: [i32; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGABRT, libc::SIGKILL];

    cfg!(target_os = "linux")
        && signal
            .or_else(|| code.checked_sub(128))
            .is_some_and(|signal| SIGNALS.contains(&signal))
}

#[cfg(not(unix))]
fn exit_completion(_region: &mut Region, status: std::process::ExitStatus) -> Completion {
    Completion::Exited(status.code().unwrap_or(1))
}

/// Peak RSS of waited-for children, in bytes. The kernel reports the
/// maximum over all children of this process.
#[cfg(target_os = "linux")]
fn children_peak_rss() -> Option<u64> {
    use nix::sys::resource::{UsageWho, getrusage};

    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).ok()?;
    let kib = u64::try_from(usage.max_rss()).ok()?;
    Some(kib.saturating_mul(1024))
}

#[cfg(not(target_os = "linux"))]
fn children_peak_rss() -> Option<u64> {
    None
}

/// Charges a new high-water mark to this run's child. A peak no higher than
/// `baseline` was set by an earlier child and says nothing about this one.
/// Children of concurrent cages in the same process can still raise it.
fn observe_child_memory(region: &mut Region, baseline: Option<u64>) {
    if let Some(peak) = children_peak_rss().filter(|peak| Some(*peak) > baseline) {
        region.meter.observe_peak_memory(peak);
    }
}
