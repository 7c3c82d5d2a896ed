//! Kernel enforcement of the allowlist for command workloads.
//!
//! The filter allows exactly the configured syscalls and kills the whole
//! process on anything else, so a violation surfaces as death by `SIGSYS`.
//! It is compiled once in [`activate`](super::DeterminismCage::activate) and
//! installed in the child between `fork` and `exec`.

use std::collections::{BTreeMap, BTreeSet};

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};

use super::{CageError, Syscall};

/// Compiles an allowlist filter for x86_64.
pub(crate) fn compile(allowed: &BTreeSet<Syscall>) -> Result<BpfProgram, CageError> {
    // Empty rule vec means unconditional match.
    let rules: BTreeMap<i64, Vec<SeccompRule>> = allowed
        .iter()
        .map(|sc| (sc.x86_64_number(), vec![]))
        .collect();

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::KillProcess,
        SeccompAction::Allow,
        TargetArch::x86_64,
    )
    .map_err(|e| CageError::Filter(format!("failed to create seccomp filter: {e}")))?;

    filter.try_into().map_err(|e: seccompiler::BackendError| {
        CageError::Filter(format!("failed to compile BPF program: {e}"))
    })
}

/// Installs `program` in the calling process. Only for `pre_exec` hooks.
pub(crate) fn apply(program: &BpfProgram) -> std::io::Result<()> {
    seccompiler::apply_filter(program).map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_command_profile() {
        let allowed: BTreeSet<Syscall> = Syscall::command_profile().into_iter().collect();
        let program = compile(&allowed).unwrap();
        assert!(!program.is_empty());
    }
}
