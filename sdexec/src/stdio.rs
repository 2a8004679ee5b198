//! Standard input, output and error of the executed program.
//!
//! Each stream resolves to a [`Target`] first and is installed onto its
//! descriptor number afterwards, so resolution is testable without touching
//! the test process's own 0/1/2.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::sys::termios::{self, LocalFlags, SetArg};
use nix::unistd::{Gid, Uid};

use crate::config::PipelineConfig;
use crate::context::{ExecContext, StdInput, StdOutput};
use crate::error::{StageError, StageExt};
use crate::params::{ExecFlags, ExecParameters};
use crate::status::ExitStatus;
use crate::{Error, Result, sys};

/// Mode of a terminal handed to a service.
const TTY_MODE: u32 = 0o620;

/// One of the three standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Stream {
    /// Descriptor 0.
    Stdin,
    /// Descriptor 1.
    Stdout,
    /// Descriptor 2.
    Stderr,
}

impl Stream {
    /// Descriptor number.
    pub const fn fd(self) -> RawFd {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    /// Exit status when setting the stream up fails.
    pub const fn exit_status(self) -> ExitStatus {
        match self {
            Self::Stdin => ExitStatus::Stdin,
            Self::Stdout => ExitStatus::Stdout,
            Self::Stderr => ExitStatus::Stderr,
        }
    }
}

/// What a stream is connected to.
#[derive(Debug)]
#[non_exhaustive]
pub enum Target {
    /// Leave the descriptor as inherited.
    Keep,
    /// Duplicate another standard descriptor.
    Dup(RawFd),
    /// Install this descriptor.
    Fd(OwnedFd),
}

impl Target {
    fn install(self, onto: RawFd) -> io::Result<()> {
        match self {
            Self::Keep => Ok(()),
            Self::Dup(src) => sys::dup2(src, onto),
            Self::Fd(fd) => sys::dup2(fd.as_raw_fd(), onto),
        }
    }
}

/// `SYSLOG_IDENTIFIER` default: the program's file name.
pub fn default_identifier(program: &Path) -> String {
    program
        .file_name()
        .map_or_else(|| program.to_string_lossy(), |n| n.to_string_lossy())
        .into_owned()
}

/// Header sent on a fresh journal stream connection: identifier, unit,
/// priority, level-prefix flag, then the syslog, kmsg and console forward
/// flags.
pub fn journal_header(ctx: &ExecContext, unit: &str, identifier: &str) -> String {
    format!(
        "{}\n{unit}\n{}\n{}\n0\n0\n0\n",
        ctx.syslog_identifier.as_deref().unwrap_or(identifier),
        ctx.syslog_priority,
        u8::from(ctx.syslog_level_prefix),
    )
}

/// Connects to the journal's stdout transport and sends the header. The
/// read side is shut down: the journal never answers.
pub fn connect_journal(socket: &Path, header: &str) -> io::Result<OwnedFd> {
    let mut stream = UnixStream::connect(socket)?;
    stream.shutdown(Shutdown::Read)?;
    stream.write_all(header.as_bytes())?;
    Ok(OwnedFd::from(stream))
}

fn open_null(write: bool) -> io::Result<OwnedFd> {
    let f = OpenOptions::new().read(!write).write(write).open("/dev/null")?;
    Ok(OwnedFd::from(f))
}

fn open_tty(path: &Path) -> io::Result<OwnedFd> {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
        .open(path)?;
    Ok(OwnedFd::from(f))
}

/// Opens an output file. `File` writes from offset 0 without truncating.
fn open_output_file(out: &StdOutput) -> io::Result<Option<OwnedFd>> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).mode(0o666).custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC);
    let path = match out {
        StdOutput::File(p) => p,
        StdOutput::Append(p) => {
            opts.append(true);
            p
        }
        StdOutput::Truncate(p) => {
            opts.truncate(true);
            p
        }
        _ => return Ok(None),
    };
    Ok(Some(OwnedFd::from(opts.open(path)?)))
}

/// Puts a terminal into a sane cooked mode and sends a full reset.
fn reset_terminal(fd: &OwnedFd) -> Result<()> {
    let mut t = termios::tcgetattr(fd.as_fd()).map_err(|e| Error::errno("tcgetattr", e))?;
    t.local_flags |= LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK;
    termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, &t).map_err(|e| Error::errno("tcsetattr", e))?;
    File::from(fd.try_clone()?).write_all(b"\x1bc")?;
    Ok(())
}

/// Resolves and installs the standard streams of one attempt.
#[derive(Debug)]
pub struct StdioSetup<'a> {
    /// Unit configuration.
    pub ctx: &'a ExecContext,
    /// Invocation wiring.
    pub params: &'a ExecParameters,
    /// Host paths.
    pub config: &'a PipelineConfig,
    /// Unit id.
    pub unit: &'a str,
    /// Fallback journal identifier.
    pub identifier: &'a str,
}

impl StdioSetup<'_> {
    /// Terminal used by `tty` routings.
    pub fn tty_path(&self) -> PathBuf {
        self.ctx.tty_path.clone().unwrap_or_else(|| self.config.console.clone())
    }

    /// Input routing after applying the invocation flags: without
    /// permission to take a terminal, stdin falls back to `/dev/null`.
    pub fn effective_input(&self) -> &StdInput {
        let input = &self.ctx.stdin;
        if input.is_tty() && !self.params.flags.contains(ExecFlags::APPLY_TTY_STDIN) {
            return &StdInput::Null;
        }
        input
    }

    fn socket_fd(&self) -> Result<OwnedFd> {
        match (self.params.n_socket_fds, self.params.fds.first()) {
            (1, Some(fd)) => Ok(fd.try_clone()?),
            (n, _) => Err(Error::Config(format!(
                "socket stdio needs exactly one socket descriptor, got {n}"
            ))),
        }
    }

    fn named_fd(&self, name: &str) -> Result<OwnedFd> {
        let idx = self
            .params
            .fd_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::Config(format!("no descriptor named {name:?}")))?;
        let fd = self
            .params
            .fds
            .get(idx)
            .ok_or_else(|| Error::Config(format!("descriptor {name:?} was not passed")))?;
        Ok(fd.try_clone()?)
    }

    /// Target of standard input.
    pub fn input_target(&self) -> Result<Target> {
        if let Some(fd) = &self.params.stdin_fd {
            return Ok(Target::Fd(fd.try_clone()?));
        }
        let fd = match self.effective_input() {
            StdInput::Null => open_null(false)?,
            StdInput::Tty | StdInput::TtyForce | StdInput::TtyFail => open_tty(&self.tty_path())?,
            StdInput::Socket => self.socket_fd()?,
            StdInput::Fd(name) => self.named_fd(name)?,
            StdInput::Data(text) => sys::memfd_with(c"stdin-data", text.as_bytes())?,
            StdInput::File(path) => OwnedFd::from(File::open(path)?),
        };
        Ok(Target::Fd(fd))
    }

    /// Target of standard output or error.
    pub fn output_target(&self, stream: Stream) -> Result<Target> {
        let (passed, out) = match stream {
            Stream::Stderr => (&self.params.stderr_fd, &self.ctx.stderr),
            _ => (&self.params.stdout_fd, &self.ctx.stdout),
        };
        if let Some(fd) = passed {
            return Ok(Target::Fd(fd.try_clone()?));
        }
        let stdin_is_tty = self.params.stdin_fd.is_none() && self.effective_input().is_tty();
        let target = match out {
            StdOutput::Inherit if stream == Stream::Stderr => Target::Dup(1),
            StdOutput::Inherit | StdOutput::Tty if stdin_is_tty => Target::Dup(0),
            StdOutput::Inherit => Target::Keep,
            StdOutput::Tty => Target::Fd(open_tty(&self.tty_path())?),
            StdOutput::Null => Target::Fd(open_null(true)?),
            StdOutput::Journal => {
                let header = journal_header(self.ctx, self.unit, self.identifier);
                Target::Fd(connect_journal(&self.config.journal_socket, &header)?)
            }
            StdOutput::Socket => Target::Fd(self.socket_fd()?),
            StdOutput::Fd(name) => Target::Fd(self.named_fd(name)?),
            other => match open_output_file(other)? {
                Some(fd) => Target::Fd(fd),
                None => Target::Keep,
            },
        };
        Ok(target)
    }

    fn setup_input(&self) -> Result<()> {
        let target = self.input_target()?;
        let input = self.effective_input();
        if self.params.stdin_fd.is_none()
            && input.is_tty()
            && let Target::Fd(fd) = &target
        {
            if self.ctx.tty_vhangup
                && let Err(e) = sys::vhangup(fd.as_raw_fd())
            {
                tracing::debug!(error = %e, "vhangup failed");
            }
            if self.ctx.tty_reset
                && let Err(e) = reset_terminal(fd)
            {
                tracing::debug!(error = %e, "terminal reset failed");
            }
            let force = matches!(input, StdInput::TtyForce);
            sys::set_controlling_tty(fd.as_raw_fd(), force)?;
        }
        target.install(0)?;
        Ok(())
    }

    /// Hands the terminal to `owner` with mode `0620`.
    fn chown_tty(&self, owner: (Uid, Gid)) -> Result<()> {
        let path = self.tty_path();
        std::os::unix::fs::chown(&path, Some(owner.0.as_raw()), None)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(TTY_MODE))?;
        Ok(())
    }

    /// Installs all three streams.
    ///
    /// `owner` is the target identity when it differs from the caller's and
    /// the caller may chown. Returns `dev:ino` of the journal stream, if one
    /// was connected.
    pub fn apply(&self, owner: Option<(Uid, Gid)>) -> std::result::Result<Option<(u64, u64)>, StageError> {
        self.setup_input().status(ExitStatus::Stdin)?;
        for stream in [Stream::Stdout, Stream::Stderr] {
            self.output_target(stream)
                .and_then(|t| Ok(t.install(stream.fd())?))
                .status(stream.exit_status())?;
        }
        if self.ctx.uses_tty()
            && let Some(owner) = owner
        {
            self.chown_tty(owner).status(ExitStatus::Chown)?;
        }

        let journal = if self.params.stderr_fd.is_none() && self.ctx.stderr == StdOutput::Journal {
            Some(2)
        } else if self.params.stdout_fd.is_none() && self.ctx.stdout == StdOutput::Journal {
            Some(1)
        } else {
            None
        };
        match journal {
            Some(fd) => Ok(Some(sys::dev_ino(fd).status(ExitStatus::Stdout)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    use super::*;

    fn setup<'a>(ctx: &'a ExecContext, params: &'a ExecParameters, config: &'a PipelineConfig) -> StdioSetup<'a> {
        StdioSetup {
            ctx,
            params,
            config,
            unit: "web.service",
            identifier: "web",
        }
    }

    fn read_all(fd: OwnedFd) -> String {
        let mut s = String::new();
        File::from(fd).read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn header_layout() {
        let ctx = ExecContext {
            syslog_priority: 4,
            syslog_level_prefix: false,
            ..ExecContext::default()
        };
        assert_eq!(journal_header(&ctx, "web.service", "web"), "web\nweb.service\n4\n0\n0\n0\n0\n");
        let ctx = ExecContext {
            syslog_identifier: Some("frontend".into()),
            ..ExecContext::default()
        };
        assert!(journal_header(&ctx, "web.service", "web").starts_with("frontend\nweb.service\n6\n1\n"));
        assert_eq!(default_identifier(Path::new("/usr/bin/nginx")), "nginx");
    }

    #[test]
    fn journal_receives_header() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("stdout");
        let listener = UnixListener::bind(&sock).unwrap();
        let fd = connect_journal(&sock, "x\nu\n6\n1\n0\n0\n0\n").unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        File::from(fd).write_all(b"hello\n").unwrap();
        let mut got = String::new();
        peer.read_to_string(&mut got).unwrap();
        assert_eq!(got, "x\nu\n6\n1\n0\n0\n0\nhello\n");
    }

    #[test]
    fn literal_stdin_is_readable() {
        let ctx = ExecContext {
            stdin: StdInput::Data("line one\n".into()),
            ..ExecContext::default()
        };
        let params = ExecParameters::new();
        let config = PipelineConfig::default();
        let Target::Fd(fd) = setup(&ctx, &params, &config).input_target().unwrap() else {
            panic!("expected a descriptor");
        };
        assert_eq!(read_all(fd), "line one\n");
    }

    #[test]
    fn tty_stdin_needs_permission() {
        let ctx = ExecContext {
            stdin: StdInput::TtyForce,
            ..ExecContext::default()
        };
        let mut params = ExecParameters::new();
        let config = PipelineConfig::default();
        assert!(setup(&ctx, &params, &config).effective_input().is_tty());
        params.flags = params.flags.without(ExecFlags::APPLY_TTY_STDIN);
        assert_eq!(setup(&ctx, &params, &config).effective_input(), &StdInput::Null);
    }

    #[test]
    fn socket_stdio_needs_exactly_one_socket() {
        let ctx = ExecContext {
            stdin: StdInput::Socket,
            ..ExecContext::default()
        };
        let mut params = ExecParameters::new();
        let config = PipelineConfig::default();
        assert!(matches!(setup(&ctx, &params, &config).input_target(), Err(Error::Config(_))));

        let (a, _b) = sys::socketpair_dgram().unwrap();
        params.fds.push(a);
        params.n_socket_fds = 1;
        assert!(matches!(setup(&ctx, &params, &config).input_target(), Ok(Target::Fd(_))));
    }

    #[test]
    fn named_descriptor_lookup() {
        let ctx = ExecContext {
            stdout: StdOutput::Fd("log".into()),
            ..ExecContext::default()
        };
        let (r, w) = sys::pipe().unwrap();
        let mut params = ExecParameters::new();
        params.fds.push(w);
        params.fd_names.push("log".into());
        let config = PipelineConfig::default();
        let Target::Fd(fd) = setup(&ctx, &params, &config).output_target(Stream::Stdout).unwrap() else {
            panic!("expected a descriptor");
        };
        File::from(fd).write_all(b"via name").unwrap();
        drop(params);
        assert_eq!(read_all(r), "via name");

        let ctx = ExecContext {
            stdout: StdOutput::Fd("missing".into()),
            ..ExecContext::default()
        };
        let params = ExecParameters::new();
        assert!(setup(&ctx, &params, &config).output_target(Stream::Stdout).is_err());
    }

    #[test]
    fn inherit_rules() {
        let ctx = ExecContext::default();
        let params = ExecParameters::new();
        let config = PipelineConfig::default();
        let s = setup(&ctx, &params, &config);
        assert!(matches!(s.output_target(Stream::Stdout).unwrap(), Target::Keep));
        assert!(matches!(s.output_target(Stream::Stderr).unwrap(), Target::Dup(1)));
    }

    #[test]
    fn file_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "0123456789").unwrap();

        let fd = open_output_file(&StdOutput::File(path.clone())).unwrap().unwrap();
        File::from(fd).write_all(b"ab").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ab23456789");

        let fd = open_output_file(&StdOutput::Append(path.clone())).unwrap().unwrap();
        File::from(fd).write_all(b"!").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ab23456789!");

        let fd = open_output_file(&StdOutput::Truncate(path.clone())).unwrap().unwrap();
        File::from(fd).write_all(b"new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }
}
