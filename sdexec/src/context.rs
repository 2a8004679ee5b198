//! Declarative, per-unit description of how a program is to be run.
//!
//! An [`ExecContext`] is immutable for the lifetime of an execution attempt.
//! It is usually loaded from JSON:
//!
//! ```
//! let ctx: sdexec::ExecContext = serde_json::from_str(r#"{
//!     "user": "nobody",
//!     "private_tmp": true,
//!     "directories": { "state": { "items": [{ "path": "db" }] } },
//!     "syscall_filter": { "allow_list": false, "syscalls": { "mount": null } }
//! }"#).unwrap();
//! assert_eq!(ctx.user.as_deref(), Some("nobody"));
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::limits::{ResourceKind, ResourceLimit};
use crate::sandbox::caps::CapabilitySet;
use crate::status::ExitStatus;

/// Per-unit desired execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ExecContext {
    // Identity.
    /// User name or numeric uid to run as. `None` keeps the manager's user.
    pub user: Option<String>,
    /// Group name or numeric gid. Defaults to the user's primary group.
    pub group: Option<String>,
    /// Allocate a transient user and group for the unit.
    pub dynamic_user: bool,
    /// Additional groups, by name or numeric gid.
    pub supplementary_groups: Vec<String>,
    /// PAM service name; opens a login session when set.
    pub pam_name: Option<String>,

    // Namespaces.
    /// Give the unit private `/tmp` and `/var/tmp`.
    pub private_tmp: bool,
    /// Give the unit a minimal private `/dev`.
    pub private_devices: bool,
    /// Give the unit a private network namespace.
    pub private_network: bool,
    /// Give the unit a private IPC namespace.
    pub private_ipc: bool,
    /// Give the unit a private user namespace.
    pub private_users: bool,
    /// Give the unit a private mount namespace even without other options.
    pub private_mounts: bool,
    /// Give the unit a private UTS namespace.
    pub protect_hostname: bool,
    /// Hide or lock down home directories.
    pub protect_home: ProtectHome,
    /// Make system directories read-only.
    pub protect_system: ProtectSystem,
    /// Mount `/proc` with restricted visibility.
    pub protect_proc: ProtectProc,
    /// Make `/proc/sys` and `/sys` read-only.
    pub protect_kernel_tunables: bool,
    /// Block module loading.
    pub protect_kernel_modules: bool,
    /// Block access to the kernel log.
    pub protect_kernel_logs: bool,
    /// Make the control-group tree read-only.
    pub protect_control_groups: bool,
    /// Block changes to the system clock.
    pub protect_clock: bool,
    /// Paths made read-only.
    pub read_only_paths: Vec<PathBuf>,
    /// Paths kept writable under a read-only parent.
    pub read_write_paths: Vec<PathBuf>,
    /// Paths made inaccessible.
    pub inaccessible_paths: Vec<PathBuf>,
    /// Additional bind mounts.
    pub bind_mounts: Vec<BindMount>,
    /// Additional tmpfs mounts.
    pub temporary_filesystems: Vec<TemporaryFilesystem>,
    /// Root directory or disk image for the unit.
    pub root: Option<RootSource>,
    /// Per-type managed directories.
    pub directories: BTreeMap<DirectoryType, DirectoryConfig>,

    // Capabilities and MAC.
    /// Capability bounding set. `None` leaves it unchanged.
    pub capability_bounding_set: Option<CapabilitySet>,
    /// Ambient capabilities.
    pub ambient_capabilities: CapabilitySet,
    /// Securebits to set (`SECBIT_*`).
    pub secure_bits: u32,
    /// Set `PR_SET_NO_NEW_PRIVS` explicitly.
    pub no_new_privileges: bool,
    /// Mandatory-access-control context to switch to on exec.
    pub mac: Option<MacContext>,

    // Syscall filtering.
    /// Main syscall filter.
    pub syscall_filter: Option<SyscallFilterRules>,
    /// Syscalls to audit-log.
    pub syscall_log: Vec<String>,
    /// Allowed syscall ABIs. `["native"]` blocks every foreign ABI.
    pub syscall_architectures: Vec<String>,
    /// Socket address-family restriction.
    pub restrict_address_families: Option<AddressFamilyRules>,
    /// Namespace types the unit may still create. `None` is unrestricted.
    pub restrict_namespaces: Option<Vec<NamespaceType>>,
    /// Forbid realtime scheduling.
    pub restrict_realtime: bool,
    /// Forbid creating set-user/group-id files.
    pub restrict_suid_sgid: bool,
    /// Forbid changing the execution domain.
    pub lock_personality: bool,
    /// Forbid memory that is both writable and executable.
    pub memory_deny_write_execute: bool,
    /// Execution domain.
    pub personality: Option<Personality>,

    // Process knobs.
    /// Resource limits.
    pub limits: BTreeMap<ResourceKind, ResourceLimit>,
    /// Scheduling priority.
    pub nice: Option<i32>,
    /// OOM score adjustment.
    pub oom_score_adjust: Option<i32>,
    /// File mode creation mask.
    pub umask: u32,
    /// Ignore `SIGPIPE` in the executed program.
    pub ignore_sigpipe: bool,
    /// Working directory.
    pub working_directory: Option<WorkingDirectory>,
    /// Tolerate a missing working directory.
    pub working_directory_missing_ok: bool,

    // Standard I/O.
    /// Standard input routing.
    pub stdin: StdInput,
    /// Standard output routing.
    pub stdout: StdOutput,
    /// Standard error routing.
    pub stderr: StdOutput,
    /// Terminal used by `tty` routings. Defaults to the console.
    pub tty_path: Option<PathBuf>,
    /// Reset the terminal before use.
    pub tty_reset: bool,
    /// Hang up other sessions on the terminal before use.
    pub tty_vhangup: bool,
    /// Identifier sent in the journal stream header.
    pub syslog_identifier: Option<String>,
    /// Default priority of journal-routed output.
    pub syslog_priority: u8,
    /// Parse `<N>` priority prefixes in journal-routed output.
    pub syslog_level_prefix: bool,
    /// Journal namespace, exported as `LOG_NAMESPACE`.
    pub log_namespace: Option<String>,

    // Environment and credentials.
    /// `KEY=VALUE` assignments.
    pub environment: Vec<String>,
    /// Credential declarations, in declaration order.
    pub credentials: Vec<CredentialSpec>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            user: None,
            group: None,
            dynamic_user: false,
            supplementary_groups: Vec::new(),
            pam_name: None,
            private_tmp: false,
            private_devices: false,
            private_network: false,
            private_ipc: false,
            private_users: false,
            private_mounts: false,
            protect_hostname: false,
            protect_home: ProtectHome::default(),
            protect_system: ProtectSystem::default(),
            protect_proc: ProtectProc::default(),
            protect_kernel_tunables: false,
            protect_kernel_modules: false,
            protect_kernel_logs: false,
            protect_control_groups: false,
            protect_clock: false,
            read_only_paths: Vec::new(),
            read_write_paths: Vec::new(),
            inaccessible_paths: Vec::new(),
            bind_mounts: Vec::new(),
            temporary_filesystems: Vec::new(),
            root: None,
            directories: BTreeMap::new(),
            capability_bounding_set: None,
            ambient_capabilities: CapabilitySet::EMPTY,
            secure_bits: 0,
            no_new_privileges: false,
            mac: None,
            syscall_filter: None,
            syscall_log: Vec::new(),
            syscall_architectures: Vec::new(),
            restrict_address_families: None,
            restrict_namespaces: None,
            restrict_realtime: false,
            restrict_suid_sgid: false,
            lock_personality: false,
            memory_deny_write_execute: false,
            personality: None,
            limits: BTreeMap::new(),
            nice: None,
            oom_score_adjust: None,
            umask: 0o022,
            ignore_sigpipe: true,
            working_directory: None,
            working_directory_missing_ok: false,
            stdin: StdInput::default(),
            stdout: StdOutput::default(),
            stderr: StdOutput::default(),
            tty_path: None,
            tty_reset: false,
            tty_vhangup: false,
            syslog_identifier: None,
            syslog_priority: 6,
            syslog_level_prefix: true,
            log_namespace: None,
            environment: Vec::new(),
            credentials: Vec::new(),
        }
    }
}

impl ExecContext {
    /// Whether the program ends up running as uid 0.
    pub fn targets_root(&self) -> bool {
        !self.dynamic_user && matches!(self.user.as_deref(), None | Some("root" | "0"))
    }

    /// Whether any standard stream is routed to a terminal.
    pub const fn uses_tty(&self) -> bool {
        self.stdin.is_tty() || matches!(self.stdout, StdOutput::Tty) || matches!(self.stderr, StdOutput::Tty)
    }

    /// Whether any syscall-filter based hardening option is set.
    pub fn uses_syscall_filters(&self) -> bool {
        self.syscall_filter.is_some()
            || !self.syscall_log.is_empty()
            || !self.syscall_architectures.is_empty()
            || self.restrict_address_families.is_some()
            || self.restrict_namespaces.is_some()
            || self.restrict_realtime
            || self.restrict_suid_sgid
            || self.lock_personality
            || self.memory_deny_write_execute
            || self.protect_kernel_tunables
            || self.protect_kernel_modules
            || self.protect_kernel_logs
            || self.protect_clock
            || self.private_devices
    }
}

/// Standard input routing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StdInput {
    /// `/dev/null`.
    #[default]
    Null,
    /// The configured terminal, waiting for nobody.
    Tty,
    /// The configured terminal, stealing it from its current owner.
    TtyForce,
    /// The configured terminal, failing if it is owned elsewhere.
    TtyFail,
    /// The single socket-activation descriptor.
    Socket,
    /// A passed descriptor by name.
    Fd(String),
    /// Literal text.
    Data(String),
    /// A file opened read-only.
    File(PathBuf),
}

impl StdInput {
    /// Whether this routing uses a terminal.
    pub const fn is_tty(&self) -> bool {
        matches!(self, Self::Tty | Self::TtyForce | Self::TtyFail)
    }
}

/// Standard output or error routing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StdOutput {
    /// Keep what the caller passed (or, for stderr, follow stdout).
    #[default]
    Inherit,
    /// `/dev/null`.
    Null,
    /// The configured terminal.
    Tty,
    /// The journal's stdout stream transport.
    Journal,
    /// The single socket-activation descriptor.
    Socket,
    /// A passed descriptor by name.
    Fd(String),
    /// A file opened for writing from offset 0.
    File(PathBuf),
    /// A file opened for appending.
    Append(PathBuf),
    /// A file truncated on open.
    Truncate(PathBuf),
}

/// Root of the unit's file system view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RootSource {
    /// An existing directory tree.
    Directory(PathBuf),
    /// A disk image, attached read-only through a loop device.
    Image(PathBuf),
}

/// Home directory protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProtectHome {
    /// No protection.
    #[default]
    No,
    /// Inaccessible.
    Yes,
    /// Read-only.
    ReadOnly,
    /// Replaced by empty tmpfs.
    Tmpfs,
}

/// System directory protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProtectSystem {
    /// No protection.
    #[default]
    No,
    /// `/usr` and the boot loader directories read-only.
    Yes,
    /// Additionally `/etc` read-only.
    Full,
    /// The whole tree read-only except API file systems.
    Strict,
}

/// `/proc` visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProtectProc {
    /// Host `/proc`.
    #[default]
    Default,
    /// Other users' processes cannot be inspected.
    NoAccess,
    /// Other users' processes are hidden.
    Invisible,
    /// Only ptrace-able processes are visible.
    Ptraceable,
}

impl ProtectProc {
    /// `hidepid=` mount option value, if any.
    pub const fn hidepid(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::NoAccess => Some("noaccess"),
            Self::Invisible => Some("invisible"),
            Self::Ptraceable => Some("ptraceable"),
        }
    }
}

/// Mandatory-access-control context applied on exec.
///
/// A label starting with `-` makes failure to switch non-fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum MacContext {
    /// SELinux exec context.
    Selinux(String),
    /// AppArmor profile.
    Apparmor(String),
    /// SMACK process label.
    Smack(String),
}

impl MacContext {
    /// Label with the `-` marker stripped, and whether failure is tolerated.
    pub fn label(&self) -> (&str, bool) {
        let raw = match self {
            Self::Selinux(s) | Self::Apparmor(s) | Self::Smack(s) => s.as_str(),
        };
        raw.strip_prefix('-').map_or((raw, false), |l| (l, true))
    }

    /// Exit status of a failed switch.
    pub const fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Selinux(_) => ExitStatus::SelinuxContext,
            Self::Apparmor(_) => ExitStatus::ApparmorProfile,
            Self::Smack(_) => ExitStatus::SmackProcessLabel,
        }
    }
}

/// What a syscall filter does with a matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SyscallAction {
    /// Let the call through.
    Allow,
    /// Fail the call with this errno.
    Errno(u16),
    /// Let the call through and audit-log it.
    Log,
    /// Kill the whole process.
    KillProcess,
}

/// Main syscall allow/deny filter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SyscallFilterRules {
    /// `true`: only listed calls are allowed. `false`: listed calls are denied.
    pub allow_list: bool,
    /// Syscall names or `@group` names, with an optional per-entry errno
    /// (deny-lists only).
    pub syscalls: BTreeMap<String, Option<u16>>,
    /// Errno returned for denied calls; `None` kills the process.
    pub error_number: Option<u16>,
}

/// Socket address-family restriction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct AddressFamilyRules {
    /// `true`: only listed families may be used.
    pub allow_list: bool,
    /// Family names, e.g. `AF_UNIX`.
    pub families: Vec<String>,
}

/// Namespace types for namespace restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NamespaceType {
    /// Control-group namespace.
    Cgroup,
    /// IPC namespace.
    Ipc,
    /// Network namespace.
    Net,
    /// Mount namespace.
    Mnt,
    /// PID namespace.
    Pid,
    /// User namespace.
    User,
    /// UTS namespace.
    Uts,
}

impl NamespaceType {
    /// Every namespace type.
    pub const ALL: [Self; 7] = [
        Self::Cgroup,
        Self::Ipc,
        Self::Net,
        Self::Mnt,
        Self::Pid,
        Self::User,
        Self::Uts,
    ];

    /// `CLONE_NEW*` flag.
    #[allow(clippy::cast_sign_loss)]
    pub const fn clone_flag(self) -> u32 {
        (match self {
            Self::Cgroup => libc::CLONE_NEWCGROUP,
            Self::Ipc => libc::CLONE_NEWIPC,
            Self::Net => libc::CLONE_NEWNET,
            Self::Mnt => libc::CLONE_NEWNS,
            Self::Pid => libc::CLONE_NEWPID,
            Self::User => libc::CLONE_NEWUSER,
            Self::Uts => libc::CLONE_NEWUTS,
        }) as u32
    }
}

/// Execution domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Personality {
    /// Native Linux.
    #[default]
    Linux,
    /// 32-bit Linux (`uname` reports a 32-bit machine).
    Linux32,
}

impl Personality {
    /// Raw persona value.
    pub const fn persona(self) -> u32 {
        match self {
            Self::Linux => 0x0000,
            Self::Linux32 => 0x0008,
        }
    }
}

/// Working directory selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum WorkingDirectory {
    /// The target user's home directory.
    Home,
    /// A fixed path.
    Path(PathBuf),
}

/// One extra bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BindMount {
    /// Host path.
    pub source: PathBuf,
    /// Path inside the unit's view.
    pub destination: PathBuf,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Include submounts.
    #[serde(default = "yes")]
    pub recursive: bool,
    /// Skip silently when the source is missing.
    #[serde(default)]
    pub ignore_missing: bool,
}

/// One extra tmpfs mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TemporaryFilesystem {
    /// Mount point.
    pub path: PathBuf,
    /// Mount options, e.g. `mode=0755,size=10M`.
    #[serde(default)]
    pub options: String,
}

const fn yes() -> bool {
    true
}

/// Managed directory types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DirectoryType {
    /// Below `/run`.
    Runtime,
    /// Below `/var/lib`.
    State,
    /// Below `/var/cache`.
    Cache,
    /// Below `/var/log`.
    Logs,
    /// Below `/etc`.
    Configuration,
}

impl DirectoryType {
    /// Every type, in creation order.
    pub const ALL: [Self; 5] = [
        Self::Runtime,
        Self::State,
        Self::Cache,
        Self::Logs,
        Self::Configuration,
    ];

    /// Environment variable listing the directories.
    pub const fn env_name(self) -> &'static str {
        match self {
            Self::Runtime => "RUNTIME_DIRECTORY",
            Self::State => "STATE_DIRECTORY",
            Self::Cache => "CACHE_DIRECTORY",
            Self::Logs => "LOGS_DIRECTORY",
            Self::Configuration => "CONFIGURATION_DIRECTORY",
        }
    }

    /// System prefix the directories live under.
    pub const fn default_prefix(self) -> &'static str {
        match self {
            Self::Runtime => "/run",
            Self::State => "/var/lib",
            Self::Cache => "/var/cache",
            Self::Logs => "/var/log",
            Self::Configuration => "/etc",
        }
    }

    /// Exit status when setting the directories up fails.
    pub const fn exit_status(self) -> ExitStatus {
        match self {
            Self::Runtime => ExitStatus::RuntimeDirectory,
            Self::State => ExitStatus::StateDirectory,
            Self::Cache => ExitStatus::CacheDirectory,
            Self::Logs => ExitStatus::LogsDirectory,
            Self::Configuration => ExitStatus::ConfigurationDirectory,
        }
    }

    /// Whether dynamic users get these directories through the `private/`
    /// indirection. Runtime directories are removed with the unit and
    /// configuration is never owned by the service.
    pub const fn supports_private(self) -> bool {
        matches!(self, Self::State | Self::Cache | Self::Logs)
    }
}

/// Configuration of one directory type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct DirectoryConfig {
    /// Access mode applied to each directory.
    pub mode: u32,
    /// Directories, relative to the type's prefix.
    pub items: Vec<DirectoryItem>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            mode: 0o755,
            items: Vec::new(),
        }
    }
}

/// One managed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DirectoryItem {
    /// Path relative to the type's prefix.
    pub path: PathBuf,
    /// Extra relative paths symlinked to this directory.
    #[serde(default)]
    pub symlinks: Vec<PathBuf>,
    /// Create only: do not fix up mode or ownership of an existing directory
    /// and do not export it in the environment.
    #[serde(default)]
    pub only_create: bool,
}

impl DirectoryItem {
    /// A plain directory item.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            symlinks: Vec::new(),
            only_create: false,
        }
    }
}

/// One credential declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CredentialSpec {
    /// Credential id (file name in the store).
    pub id: String,
    /// Where the value comes from.
    pub source: CredentialSource,
    /// Value is sealed and must be decrypted first.
    #[serde(default)]
    pub encrypted: bool,
}

/// Origin of a credential value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum CredentialSource {
    /// Inline value; used only if the id is not already present.
    /// Encrypted literals are base64.
    Literal(String),
    /// Absolute file, directory or socket path, or a name resolved against
    /// the credential search path.
    Path(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        let ctx: ExecContext = serde_json::from_str("{}").unwrap();
        assert_eq!(ctx, ExecContext::default());
        assert!(ctx.ignore_sigpipe);
        assert_eq!(ctx.umask, 0o022);
        assert!(ctx.targets_root());
    }

    #[test]
    fn tagged_unions_have_payloads() {
        let ctx: ExecContext = serde_json::from_str(
            r#"{
                "stdin": { "data": "hello\n" },
                "stdout": "journal",
                "stderr": { "append": "/var/log/x.log" },
                "root": { "image": "/img/root.raw" },
                "mac": { "apparmor": "-svc" },
                "credentials": [
                    { "id": "token", "source": { "literal": "secret" } },
                    { "id": "tls", "source": { "path": "/etc/tls" } }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(ctx.stdin, StdInput::Data("hello\n".into()));
        assert_eq!(ctx.stdout, StdOutput::Journal);
        assert_eq!(ctx.root, Some(RootSource::Image("/img/root.raw".into())));
        assert_eq!(ctx.mac.as_ref().map(MacContext::label), Some(("svc", true)));
        assert_eq!(ctx.credentials.len(), 2);
    }

    #[test]
    fn directories_keyed_by_type() {
        let ctx: ExecContext = serde_json::from_str(
            r#"{ "dynamic_user": true,
                 "directories": { "state": { "mode": 448, "items": [{ "path": "db" }] } } }"#,
        )
        .unwrap();
        let state = &ctx.directories[&DirectoryType::State];
        assert_eq!(state.mode, 0o700);
        assert_eq!(state.items[0], DirectoryItem::new("db"));
        assert!(!ctx.targets_root());
    }

    #[test]
    fn syscall_options_are_detected() {
        let mut ctx = ExecContext::default();
        assert!(!ctx.uses_syscall_filters());
        ctx.restrict_realtime = true;
        assert!(ctx.uses_syscall_filters());
    }

    #[test]
    fn directory_type_tables() {
        assert_eq!(DirectoryType::State.env_name(), "STATE_DIRECTORY");
        assert_eq!(DirectoryType::Logs.default_prefix(), "/var/log");
        assert_eq!(
            DirectoryType::Cache.exit_status(),
            ExitStatus::CacheDirectory
        );
        assert!(!DirectoryType::Runtime.supports_private());
    }
}
