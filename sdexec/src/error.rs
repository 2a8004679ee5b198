//! Error types for pipeline operations.

use std::ffi::NulError;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::status::ExitStatus;

/// Alias for `Result<T, sdexec::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by pipeline operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A system call failed.
    #[error("{op}: {errno}")]
    Errno {
        /// The operation that failed.
        op: &'static str,
        /// The error number reported by the kernel.
        errno: nix::errno::Errno,
    },

    /// A string argument contained an interior NUL byte.
    #[error("interior NUL byte in string argument")]
    Nul(#[from] NulError),

    /// A user or group could not be resolved.
    #[error("identity: {0}")]
    Identity(String),

    /// More supplementary groups than the kernel accepts.
    #[error("too many supplementary groups: {count} > {max}")]
    TooManyGroups {
        /// Number of distinct groups requested.
        count: usize,
        /// Kernel maximum (`NGROUPS_MAX`).
        max: usize,
    },

    /// A credential could not be loaded, decrypted or stored.
    #[error("credential {id:?}: {reason}")]
    Credential {
        /// Credential id.
        id: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The executable does not exist or is not executable.
    #[error("executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    /// Invalid or unsupported configuration.
    #[error("config: {0}")]
    Config(String),

    /// A helper process failed or a wire message was malformed.
    #[error("{what}: {source}")]
    Proto {
        /// Which exchange failed.
        what: &'static str,
        /// Underlying transport error.
        source: io::Error,
    },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An I/O error from filesystem or descriptor operations.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps a failed system call.
    pub const fn errno(op: &'static str, errno: nix::errno::Errno) -> Self {
        Self::Errno { op, errno }
    }

    /// Shorthand for a credential error.
    pub fn credential(id: &str, reason: impl fmt::Display) -> Self {
        Self::Credential {
            id: id.to_owned(),
            reason: reason.to_string(),
        }
    }

    /// Raw OS error number, if this error carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Errno { errno, .. } => Some(*errno as i32),
            Self::Io(e) | Self::Proto { source: e, .. } => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether the failure means "the kernel or enclosing container does not
    /// let us do this" rather than a genuine misconfiguration.
    ///
    /// Optional hardening stages downgrade such failures to a warning.
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self.raw_os_error(),
            Some(libc::ENOSYS | libc::EOPNOTSUPP | libc::EPERM | libc::EACCES)
        )
    }
}

/// Extension for attaching an operation name to a `nix` result.
pub(crate) trait ErrnoExt<T> {
    /// Maps the error into [`Error::Errno`] tagged with `op`.
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> ErrnoExt<T> for nix::Result<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|e| Error::errno(op, e))
    }
}

/// A fatal failure of one pipeline stage, classified by the exit status the
/// child terminates with.
#[derive(Debug, thiserror::Error)]
#[error("{status}: {source}")]
#[non_exhaustive]
pub struct StageError {
    /// Exit status the child process terminates with.
    pub status: ExitStatus,
    /// What went wrong.
    #[source]
    pub source: Error,
}

impl StageError {
    /// Classifies `source` with `status`.
    pub const fn new(status: ExitStatus, source: Error) -> Self {
        Self { status, source }
    }
}

/// Extension for classifying a crate result with an exit status.
pub(crate) trait StageExt<T> {
    /// Maps the error into a [`StageError`] with `status`.
    fn status(self, status: ExitStatus) -> std::result::Result<T, StageError>;
}

impl<T, E: Into<Error>> StageExt<T> for std::result::Result<T, E> {
    fn status(self, status: ExitStatus) -> std::result::Result<T, StageError> {
        self.map_err(|e| StageError::new(status, e.into()))
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::*;

    #[test]
    fn container_denials_are_ignorable() {
        assert!(Error::errno("seccomp", Errno::ENOSYS).is_ignorable());
        assert!(Error::errno("unshare", Errno::EPERM).is_ignorable());
        assert!(Error::Io(io::Error::from_raw_os_error(libc::EOPNOTSUPP)).is_ignorable());
    }

    #[test]
    fn misconfiguration_is_not_ignorable() {
        assert!(!Error::errno("open", Errno::ENOENT).is_ignorable());
        assert!(!Error::Config("bad".into()).is_ignorable());
        assert!(!Error::TooManyGroups { count: 70_000, max: 65_536 }.is_ignorable());
    }

    #[test]
    fn stage_error_displays_status_and_cause() {
        let err: std::result::Result<(), _> =
            Err::<(), _>(Error::Identity("unknown user \"ghost\"".into())).status(ExitStatus::User);
        let msg = err.unwrap_err().to_string();
        assert!(msg.starts_with("USER"));
        assert!(msg.contains("ghost"));
    }
}
