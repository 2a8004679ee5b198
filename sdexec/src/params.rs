//! Per-invocation wiring supplied by the caller, and the command to run.

use std::collections::BTreeMap;
use std::ops::BitOr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::context::DirectoryType;

/// Which optional mechanisms are applied on this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecFlags(u32);

impl ExecFlags {
    /// Apply namespaces, capability and syscall restrictions.
    pub const APPLY_SANDBOXING: Self = Self(1 << 0);
    /// Apply the root directory.
    pub const APPLY_CHROOT: Self = Self(1 << 1);
    /// Allow stdin to take over a terminal.
    pub const APPLY_TTY_STDIN: Self = Self(1 << 2);
    /// Export `WATCHDOG_*` (main process only).
    pub const SET_WATCHDOG: Self = Self(1 << 3);
    /// Materialize the credential store.
    pub const WRITE_CREDENTIALS: Self = Self(1 << 4);
    /// Set up per-type directories.
    pub const CREATE_DIRECTORIES: Self = Self(1 << 5);

    /// No flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags for the main process of a unit.
    pub const fn main_process() -> Self {
        Self(
            Self::APPLY_SANDBOXING.0
                | Self::APPLY_CHROOT.0
                | Self::APPLY_TTY_STDIN.0
                | Self::SET_WATCHDOG.0
                | Self::WRITE_CREDENTIALS.0
                | Self::CREATE_DIRECTORIES.0,
        )
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `self` with `other` removed.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for ExecFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-invocation parameters.
///
/// Descriptors are owned by the parameters; the parent's copies close when
/// they are dropped after [`spawn`](crate::spawn) returns.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ExecParameters {
    /// Unique id of this activation.
    pub invocation_id: Option<String>,
    /// Optional mechanisms to apply.
    pub flags: ExecFlags,
    /// Socket-activation and stored descriptors, in `LISTEN_FDS` order.
    #[serde(skip)]
    pub fds: Vec<OwnedFd>,
    /// Names for `fds`; exported as `LISTEN_FDNAMES`.
    pub fd_names: Vec<String>,
    /// How many leading entries of `fds` are listening sockets.
    pub n_socket_fds: usize,
    /// Control group, relative to the cgroup root.
    pub cgroup_path: Option<PathBuf>,
    /// Overrides of the per-type directory prefixes.
    pub prefixes: BTreeMap<DirectoryType, PathBuf>,
    /// Base environment, overridden by everything else.
    pub environment: Vec<String>,
    /// Watchdog interval in microseconds; 0 disables it.
    pub watchdog_usec: u64,
    /// Ask on the console before executing.
    pub confirm_spawn: bool,
    /// Notified with `1` right before exec and `0` if exec fails.
    #[serde(skip)]
    pub exec_fd: Option<OwnedFd>,
    /// Receives the [`IdentityReport`](sdexec_proto::IdentityReport) datagram.
    #[serde(skip)]
    pub identity_fd: Option<OwnedFd>,
    /// Pass-through standard input.
    #[serde(skip)]
    pub stdin_fd: Option<OwnedFd>,
    /// Pass-through standard output.
    #[serde(skip)]
    pub stdout_fd: Option<OwnedFd>,
    /// Pass-through standard error.
    #[serde(skip)]
    pub stderr_fd: Option<OwnedFd>,
}

impl ExecParameters {
    /// Parameters for a main process with no descriptors.
    pub fn new() -> Self {
        Self {
            flags: ExecFlags::main_process(),
            ..Self::default()
        }
    }

    /// Prefix for directories of type `ty`.
    pub fn prefix(&self, ty: DirectoryType) -> &Path {
        self.prefixes
            .get(&ty)
            .map_or_else(|| Path::new(ty.default_prefix()), PathBuf::as_path)
    }
}

/// Flags of one command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct CommandFlags {
    /// A failing or missing program is not an error.
    pub ignore_failure: bool,
    /// Do not expand `$VAR` references in arguments.
    pub no_env_expand: bool,
    /// Run without identity change or sandboxing.
    pub full_privileges: bool,
    /// Emulate ambient capabilities when the kernel lacks them: keep uid 0
    /// and let the program drop privileges itself.
    pub ambient_fallback: bool,
}

/// One program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ExecCommand {
    /// Program path; searched in `PATH` when relative.
    pub path: PathBuf,
    /// Full argument vector including `argv[0]`.
    pub argv: Vec<String>,
    /// Flags.
    #[serde(default)]
    pub flags: CommandFlags,
    /// Outcome of the last run.
    #[serde(skip)]
    pub status: ExecStatus,
}

impl ExecCommand {
    /// Command with `argv[0]` set to the path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            argv: vec![path.to_string_lossy().into_owned()],
            path,
            flags: CommandFlags::default(),
            status: ExecStatus::default(),
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Human-readable command line for prompts and logs.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Exit-status record of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct ExecStatus {
    /// Process id, 0 if never started.
    pub pid: i32,
    /// When the process was forked.
    pub start: Option<SystemTime>,
    /// When the process was reaped.
    pub exit: Option<SystemTime>,
    /// `si_code` style classification (`CLD_EXITED`, `CLD_KILLED`, ...).
    pub code: i32,
    /// Exit code or signal number.
    pub status: i32,
}

impl ExecStatus {
    /// Records a fresh start, clearing the previous outcome.
    pub fn start(&mut self, pid: i32) {
        *self = Self {
            pid,
            start: Some(SystemTime::now()),
            ..Self::default()
        };
    }

    /// Records the outcome of `pid`. Ignored if it is not the recorded pid.
    pub fn exit(&mut self, pid: i32, code: i32, status: i32) {
        if self.pid != pid {
            return;
        }
        self.exit = Some(SystemTime::now());
        self.code = code;
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let f = ExecFlags::APPLY_SANDBOXING | ExecFlags::APPLY_CHROOT;
        assert!(f.contains(ExecFlags::APPLY_SANDBOXING));
        assert!(!f.contains(ExecFlags::WRITE_CREDENTIALS));
        assert!(!f.without(ExecFlags::APPLY_CHROOT).contains(ExecFlags::APPLY_CHROOT));
        assert!(ExecFlags::main_process().contains(f));
    }

    #[test]
    fn prefixes_default_per_type() {
        let mut p = ExecParameters::new();
        assert_eq!(p.prefix(DirectoryType::State), Path::new("/var/lib"));
        p.prefixes.insert(DirectoryType::State, "/srv/state".into());
        assert_eq!(p.prefix(DirectoryType::State), Path::new("/srv/state"));
    }

    #[test]
    fn status_tracks_only_its_pid() {
        let mut st = ExecStatus::default();
        st.start(42);
        st.exit(7, 1, 1);
        assert!(st.exit.is_none());
        st.exit(42, 1, 3);
        assert_eq!((st.code, st.status), (1, 3));
        assert!(st.exit.is_some());
    }

    #[test]
    fn command_line_joins_argv() {
        let cmd = ExecCommand::new("/bin/echo").args(["hello", "world"]);
        assert_eq!(cmd.command_line(), "/bin/echo hello world");
    }
}
