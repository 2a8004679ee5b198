//! Exit codes a spawned child terminates with when a setup stage fails.
//!
//! The numeric values are a stable ABI shared with every service manager in
//! the systemd family; callers decode a child's exit code with
//! [`ExitStatus::from_code`].

use std::fmt;

use serde::Serialize;

/// Exit status of a child whose setup failed before the program image was
/// replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
#[repr(u8)]
pub enum ExitStatus {
    /// Changing to the working directory failed.
    Chdir = 200,
    /// Setting the scheduling priority failed.
    Nice = 201,
    /// Closing or rearranging file descriptors failed.
    Fds = 202,
    /// Locating or executing the program failed.
    Exec = 203,
    /// Applying resource limits failed.
    Limits = 205,
    /// Adjusting the OOM score failed.
    OomAdjust = 206,
    /// Resetting the signal mask or handlers failed.
    SignalMask = 207,
    /// Setting up standard input failed.
    Stdin = 208,
    /// Setting up standard output failed.
    Stdout = 209,
    /// Changing the root directory failed.
    Chroot = 210,
    /// Setting securebits failed.
    Securebits = 213,
    /// Resolving or setting groups failed.
    Group = 216,
    /// Resolving or changing the user failed.
    User = 217,
    /// Adjusting capabilities failed.
    Capabilities = 218,
    /// Joining the unit's control group failed.
    Cgroup = 219,
    /// Creating a new session failed.
    Setsid = 220,
    /// Execution was cancelled at the confirmation prompt.
    Confirm = 221,
    /// Setting up standard error failed.
    Stderr = 222,
    /// Opening the login session failed.
    Pam = 224,
    /// Setting up the network namespace failed.
    Network = 225,
    /// Setting up the mount, IPC or UTS namespace failed.
    Namespace = 226,
    /// Setting "no new privileges" failed.
    NoNewPrivileges = 227,
    /// Installing a syscall filter failed.
    Seccomp = 228,
    /// Switching the SELinux exec context failed.
    SelinuxContext = 229,
    /// Setting the execution domain failed.
    Personality = 230,
    /// Switching the AppArmor profile failed.
    ApparmorProfile = 231,
    /// Installing the address-family filter failed.
    AddressFamilies = 232,
    /// Creating the runtime directory failed.
    RuntimeDirectory = 233,
    /// Changing terminal ownership failed.
    Chown = 235,
    /// Switching the SMACK process label failed.
    SmackProcessLabel = 236,
    /// Creating the state directory failed.
    StateDirectory = 238,
    /// Creating the cache directory failed.
    CacheDirectory = 239,
    /// Creating the logs directory failed.
    LogsDirectory = 240,
    /// Creating the configuration directory failed.
    ConfigurationDirectory = 241,
    /// Setting up credentials failed.
    Credentials = 243,
}

impl ExitStatus {
    /// Every status, in ascending code order.
    pub const ALL: [Self; 35] = [
        Self::Chdir,
        Self::Nice,
        Self::Fds,
        Self::Exec,
        Self::Limits,
        Self::OomAdjust,
        Self::SignalMask,
        Self::Stdin,
        Self::Stdout,
        Self::Chroot,
        Self::Securebits,
        Self::Group,
        Self::User,
        Self::Capabilities,
        Self::Cgroup,
        Self::Setsid,
        Self::Confirm,
        Self::Stderr,
        Self::Pam,
        Self::Network,
        Self::Namespace,
        Self::NoNewPrivileges,
        Self::Seccomp,
        Self::SelinuxContext,
        Self::Personality,
        Self::ApparmorProfile,
        Self::AddressFamilies,
        Self::RuntimeDirectory,
        Self::Chown,
        Self::SmackProcessLabel,
        Self::StateDirectory,
        Self::CacheDirectory,
        Self::LogsDirectory,
        Self::ConfigurationDirectory,
        Self::Credentials,
    ];

    /// Numeric process exit code.
    pub const fn as_code(self) -> i32 {
        self as i32
    }

    /// Decodes a process exit code. Codes outside the table return `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_code() == code)
    }

    /// Canonical upper-case name, e.g. `"NO_NEW_PRIVILEGES"`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Chdir => "CHDIR",
            Self::Nice => "NICE",
            Self::Fds => "FDS",
            Self::Exec => "EXEC",
            Self::Limits => "LIMITS",
            Self::OomAdjust => "OOM_ADJUST",
            Self::SignalMask => "SIGNAL_MASK",
            Self::Stdin => "STDIN",
            Self::Stdout => "STDOUT",
            Self::Chroot => "CHROOT",
            Self::Securebits => "SECUREBITS",
            Self::Group => "GROUP",
            Self::User => "USER",
            Self::Capabilities => "CAPABILITIES",
            Self::Cgroup => "CGROUP",
            Self::Setsid => "SETSID",
            Self::Confirm => "CONFIRM",
            Self::Stderr => "STDERR",
            Self::Pam => "PAM",
            Self::Network => "NETWORK",
            Self::Namespace => "NAMESPACE",
            Self::NoNewPrivileges => "NO_NEW_PRIVILEGES",
            Self::Seccomp => "SECCOMP",
            Self::SelinuxContext => "SELINUX_CONTEXT",
            Self::Personality => "PERSONALITY",
            Self::ApparmorProfile => "APPARMOR",
            Self::AddressFamilies => "ADDRESS_FAMILIES",
            Self::RuntimeDirectory => "RUNTIME_DIRECTORY",
            Self::Chown => "CHOWN",
            Self::SmackProcessLabel => "SMACK_PROCESS_LABEL",
            Self::StateDirectory => "STATE_DIRECTORY",
            Self::CacheDirectory => "CACHE_DIRECTORY",
            Self::LogsDirectory => "LOGS_DIRECTORY",
            Self::ConfigurationDirectory => "CONFIGURATION_DIRECTORY",
            Self::Credentials => "CREDENTIALS",
        }
    }

    /// One-line human description.
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Chdir => "failed to change working directory",
            Self::Nice => "failed to set scheduling priority",
            Self::Fds => "failed to close or rearrange file descriptors",
            Self::Exec => "failed to locate or execute the program",
            Self::Limits => "failed to apply resource limits",
            Self::OomAdjust => "failed to adjust the OOM score",
            Self::SignalMask => "failed to reset signal mask",
            Self::Stdin => "failed to set up standard input",
            Self::Stdout => "failed to set up standard output",
            Self::Chroot => "failed to change root directory",
            Self::Securebits => "failed to set securebits",
            Self::Group => "failed to determine or set group credentials",
            Self::User => "failed to determine or set user credentials",
            Self::Capabilities => "failed to adjust capabilities",
            Self::Cgroup => "failed to join control group",
            Self::Setsid => "failed to create new session",
            Self::Confirm => "execution cancelled at confirmation prompt",
            Self::Stderr => "failed to set up standard error",
            Self::Pam => "failed to open login session",
            Self::Network => "failed to set up network namespace",
            Self::Namespace => "failed to set up mount namespace",
            Self::NoNewPrivileges => "failed to disable new privileges",
            Self::Seccomp => "failed to install syscall filter",
            Self::SelinuxContext => "failed to set SELinux context",
            Self::Personality => "failed to set execution domain",
            Self::ApparmorProfile => "failed to set AppArmor profile",
            Self::AddressFamilies => "failed to restrict address families",
            Self::RuntimeDirectory => "failed to set up runtime directory",
            Self::Chown => "failed to change terminal ownership",
            Self::SmackProcessLabel => "failed to set SMACK process label",
            Self::StateDirectory => "failed to set up state directory",
            Self::CacheDirectory => "failed to set up cache directory",
            Self::LogsDirectory => "failed to set up logs directory",
            Self::ConfigurationDirectory => "failed to set up configuration directory",
            Self::Credentials => "failed to set up credentials",
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
