//! The closed set of syscalls a cage can allow.
//!
//! Names match the Linux syscall names and are what configuration files use.
//! Numbers are x86_64 and are only consulted when building a kernel filter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! syscalls {
    ($($variant:ident => $name:literal = $nr:literal,)*) => {
        /// A syscall known to the cage.
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub enum Syscall {
            $(
                #[doc = concat!("`", $name, "`")]
                #[serde(rename = $name)]
                $variant,
            )*
        }

        impl Syscall {
            /// Every known syscall.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// Linux name.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            /// x86_64 syscall number.
            #[must_use]
            pub const fn x86_64_number(self) -> i64 {
                match self {
                    $(Self::$variant => $nr,)*
                }
            }
        }
    };
}

syscalls! {
    Read => "read" = 0,
    Write => "write" = 1,
    Open => "open" = 2,
    Close => "close" = 3,
    Stat => "stat" = 4,
    Fstat => "fstat" = 5,
    Lstat => "lstat" = 6,
    Poll => "poll" = 7,
    Lseek => "lseek" = 8,
    Mmap => "mmap" = 9,
    Mprotect => "mprotect" = 10,
    Munmap => "munmap" = 11,
    Brk => "brk" = 12,
    RtSigaction => "rt_sigaction" = 13,
    RtSigprocmask => "rt_sigprocmask" = 14,
    RtSigreturn => "rt_sigreturn" = 15,
    Ioctl => "ioctl" = 16,
    Pread64 => "pread64" = 17,
    Pwrite64 => "pwrite64" = 18,
    Readv => "readv" = 19,
    Writev => "writev" = 20,
    Access => "access" = 21,
    Pipe => "pipe" = 22,
    SchedYield => "sched_yield" = 24,
    Madvise => "madvise" = 28,
    Dup => "dup" = 32,
    Dup2 => "dup2" = 33,
    Nanosleep => "nanosleep" = 35,
    Getpid => "getpid" = 39,
    Socket => "socket" = 41,
    Connect => "connect" = 42,
    Accept => "accept" = 43,
    Sendto => "sendto" = 44,
    Recvfrom => "recvfrom" = 45,
    Bind => "bind" = 49,
    Listen => "listen" = 50,
    Clone => "clone" = 56,
    Fork => "fork" = 57,
    Vfork => "vfork" = 58,
    Execve => "execve" = 59,
    Exit => "exit" = 60,
    Wait4 => "wait4" = 61,
    Kill => "kill" = 62,
    Uname => "uname" = 63,
    Fcntl => "fcntl" = 72,
    Getcwd => "getcwd" = 79,
    Chdir => "chdir" = 80,
    Rename => "rename" = 82,
    Mkdir => "mkdir" = 83,
    Unlink => "unlink" = 87,
    Readlink => "readlink" = 89,
    Sysinfo => "sysinfo" = 99,
    Ptrace => "ptrace" = 101,
    Getuid => "getuid" = 102,
    Getgid => "getgid" = 104,
    Geteuid => "geteuid" = 107,
    Getegid => "getegid" = 108,
    Getppid => "getppid" = 110,
    ArchPrctl => "arch_prctl" = 158,
    Mount => "mount" = 165,
    Gettid => "gettid" = 186,
    Futex => "futex" = 202,
    Getdents64 => "getdents64" = 217,
    SetTidAddress => "set_tid_address" = 218,
    ClockGettime => "clock_gettime" = 228,
    ClockNanosleep => "clock_nanosleep" = 230,
    ExitGroup => "exit_group" = 231,
    Openat => "openat" = 257,
    Newfstatat => "newfstatat" = 262,
    Readlinkat => "readlinkat" = 267,
    Faccessat => "faccessat" = 269,
    SetRobustList => "set_robust_list" = 273,
    Dup3 => "dup3" = 292,
    Pipe2 => "pipe2" = 293,
    Prlimit64 => "prlimit64" = 302,
    Getrandom => "getrandom" = 318,
    Statx => "statx" = 332,
    Rseq => "rseq" = 334,
    Clone3 => "clone3" = 435,
    Faccessat2 => "faccessat2" = 439,
}

impl Syscall {
    /// Allowlist for in-process functions: the gateway operations of
    /// [`CageContext`](super::CageContext) and nothing that creates threads,
    /// processes, or sockets.
    #[must_use]
    pub fn pure_profile() -> Vec<Self> {
        vec![
            Self::Read,
            Self::Write,
            Self::Openat,
            Self::Close,
            Self::Mmap,
            Self::Munmap,
            Self::Getrandom,
            Self::ClockGettime,
            Self::ExitGroup,
        ]
    }

    /// Allowlist for running a typical dynamically linked, single-threaded
    /// command. Excludes networking, process creation after exec, tracing
    /// and mounts.
    #[must_use]
    pub fn command_profile() -> Vec<Self> {
        vec![
            Self::Read,
            Self::Write,
            Self::Open,
            Self::Openat,
            Self::Close,
            Self::Stat,
            Self::Fstat,
            Self::Lstat,
            Self::Newfstatat,
            Self::Statx,
            Self::Lseek,
            Self::Mmap,
            Self::Mprotect,
            Self::Munmap,
            Self::Brk,
            Self::Madvise,
            Self::RtSigaction,
            Self::RtSigprocmask,
            Self::RtSigreturn,
            Self::Ioctl,
            Self::Pread64,
            Self::Readv,
            Self::Writev,
            Self::Access,
            Self::Faccessat,
            Self::Faccessat2,
            Self::Dup,
            Self::Dup2,
            Self::Dup3,
            Self::Fcntl,
            Self::Getcwd,
            Self::Readlink,
            Self::Readlinkat,
            Self::Getdents64,
            Self::Getpid,
            Self::Getppid,
            Self::Gettid,
            Self::Getuid,
            Self::Geteuid,
            Self::Getgid,
            Self::Getegid,
            Self::Uname,
            Self::Sysinfo,
            Self::ArchPrctl,
            Self::SetTidAddress,
            Self::SetRobustList,
            Self::Rseq,
            Self::Prlimit64,
            Self::Futex,
            Self::Getrandom,
            Self::ClockGettime,
            Self::Execve,
            Self::Exit,
            Self::ExitGroup,
        ]
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name is not a known syscall.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown syscall name: {0}")]
pub struct UnknownSyscall(pub String);

impl FromStr for Syscall {
    type Err = UnknownSyscall;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| UnknownSyscall(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn names_and_numbers_unique() {
        let names: HashSet<_> = Syscall::ALL.iter().map(|s| s.name()).collect();
        let numbers: HashSet<_> = Syscall::ALL.iter().map(|s| s.x86_64_number()).collect();
        assert_eq!(names.len(), Syscall::ALL.len());
        assert_eq!(numbers.len(), Syscall::ALL.len());
    }

    #[test]
    fn parse_round_trip() {
        for sc in Syscall::ALL {
            assert_eq!(sc.name().parse::<Syscall>(), Ok(*sc));
        }
        assert!("frobnicate".parse::<Syscall>().is_err());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn numbers_match_libc() {
        assert_eq!(Syscall::Execve.x86_64_number(), libc::SYS_execve);
        assert_eq!(Syscall::Openat.x86_64_number(), libc::SYS_openat);
        assert_eq!(Syscall::Getrandom.x86_64_number(), libc::SYS_getrandom);
        assert_eq!(Syscall::Clone3.x86_64_number(), libc::SYS_clone3);
    }

    #[test]
    fn pure_profile_has_no_concurrency_or_network() {
        let pure = Syscall::pure_profile();
        for forbidden in [
            Syscall::Clone,
            Syscall::Clone3,
            Syscall::Fork,
            Syscall::Socket,
            Syscall::Execve,
        ] {
            assert!(!pure.contains(&forbidden), "{forbidden} in pure profile");
        }
    }
}
