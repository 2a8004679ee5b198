//! The forked child: runs the planned stages in order and executes the
//! program.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sched::{CloneFlags, unshare};
use nix::sys::signal::{SigSet, SigmaskHow, sigprocmask};
use nix::sys::stat::{Mode, umask};
use nix::unistd::{AccessFlags, Gid, Uid, access, chdir, getpid, setsid, write};

use super::{Pipeline, Plan, Stage};
use crate::confirm::{self, Confirmation};
use crate::context::{ExecContext, RootSource, WorkingDirectory};
use crate::env::{self, Environment};
use crate::error::{ErrnoExt, StageError, StageExt};
use crate::identity::{self, DynamicCreds, IdentityTransition, ResolvedIdentity, Retain};
use crate::namespace::{self, PlanInputs, directories};
use crate::params::{ExecCommand, ExecFlags, ExecParameters};
use crate::runtime::{ExecRuntime, NamespaceStorage};
use crate::sandbox::{self, mac};
use crate::status::ExitStatus;
use crate::stdio::{self, StdioSetup};
use crate::{Error, Result, cgroup, credentials, limits, session, sys};

/// Search path for programs given by name.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin";

/// Resolves `program` to an executable file. Names without a `/` are
/// looked up in `search`.
pub fn find_executable(program: &Path, search: &str) -> Result<PathBuf> {
    let executable = |p: &Path| p.is_file() && access(p, AccessFlags::X_OK).is_ok();
    if program.as_os_str().as_bytes().contains(&b'/') {
        return if executable(program) {
            Ok(program.to_path_buf())
        } else {
            Err(Error::ExecutableNotFound(program.to_path_buf()))
        };
    }
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|p| executable(p))
        .ok_or_else(|| Error::ExecutableNotFound(program.to_path_buf()))
}

/// What a finished stage asks of the runner.
enum Flow {
    /// Go on with the next stage.
    Continue,
    /// Stop here and exit with this code.
    Exit(i32),
}

/// Results earlier stages hand to later ones.
#[derive(Default)]
struct State {
    identity: Option<ResolvedIdentity>,
    journal_stream: Option<(u64, u64)>,
    credentials_dir: Option<PathBuf>,
    session_env: Vec<(String, String)>,
    root: Option<PathBuf>,
    exec_fd: Option<RawFd>,
}

impl State {
    fn identity(&self) -> Result<&ResolvedIdentity> {
        self.identity
            .as_ref()
            .ok_or_else(|| Error::Identity("identity used before it was resolved".into()))
    }

    fn ids(&self) -> Result<(Uid, Gid)> {
        self.identity().map(|id| (id.uid, id.gid))
    }
}

/// One execution attempt inside the forked child.
pub(super) struct Attempt<'a> {
    pub(super) pipeline: Pipeline<'a>,
    pub(super) unit: &'a str,
    pub(super) command: &'a ExecCommand,
    pub(super) ctx: &'a ExecContext,
    pub(super) params: &'a ExecParameters,
    pub(super) runtime: Option<&'a ExecRuntime>,
    pub(super) dynamic: Option<&'a DynamicCreds>,
    pub(super) plan: &'a Plan,
}

impl Attempt<'_> {
    /// Runs every stage. Returns the exit code of the child; on success
    /// the process image has been replaced and this never returns.
    pub(super) fn run(&self) -> i32 {
        let mut state = State {
            exec_fd: self.params.exec_fd.as_ref().map(AsRawFd::as_raw_fd),
            ..State::default()
        };
        for &stage in &self.plan.stages {
            match self.stage(stage, &mut state) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(code)) => return code,
                Err(e) if stage.is_optional() && e.source.is_ignorable() => {
                    tracing::warn!(unit = self.unit, stage = stage.name(), error = %e.source, "skipped");
                }
                Err(e) => {
                    tracing::error!(
                        unit = self.unit,
                        stage = stage.name(),
                        status = %e.status,
                        error = %e.source,
                        "failed at step {}",
                        e.status.name()
                    );
                    return e.status.as_code();
                }
            }
        }
        ExitStatus::Exec.as_code()
    }

    fn stage(&self, stage: Stage, st: &mut State) -> std::result::Result<Flow, StageError> {
        match stage.exit_status() {
            Some(status) => self.simple(stage, st).status(status),
            None => self.classified(stage, st),
        }
    }

    /// Stages with a single exit status.
    fn simple(&self, stage: Stage, st: &mut State) -> Result<Flow> {
        let ctx = self.ctx;
        let surface = &self.plan.surface;
        match stage {
            Stage::CloseFds => self.close_fds()?,
            Stage::ResetSignals => {
                sys::reset_signal_handlers();
                sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None).op("sigprocmask")?;
                if ctx.ignore_sigpipe {
                    sys::ignore_signal(libc::SIGPIPE)?;
                }
            }
            Stage::Setsid => {
                setsid().op("setsid")?;
            }
            Stage::Confirm => return self.confirm(),
            Stage::ReportIdentity => self.report_identity(st)?,
            Stage::Cgroup => {
                if let Some(path) = &self.params.cgroup_path {
                    cgroup::attach(&self.pipeline.config.cgroup_root, path, getpid())?;
                }
            }
            Stage::OomAdjust => {
                if let Some(score) = ctx.oom_score_adjust {
                    limits::set_oom_score_adjust(score)?;
                }
            }
            Stage::Nice => {
                if let Some(nice) = ctx.nice {
                    limits::set_nice(nice)?;
                }
            }
            Stage::Personality => {
                if let Some(p) = ctx.personality {
                    sys::set_personality(p.persona())?;
                }
            }
            Stage::Credentials => {
                let stored = credentials::materialize(
                    ctx,
                    self.unit,
                    self.pipeline.config,
                    Some(st.ids()?),
                    self.pipeline.mounts,
                    false,
                )?;
                st.credentials_dir = stored.map(|m| m.dir);
            }
            Stage::Limits => limits::apply(&ctx.limits)?,
            Stage::PrivateUsers => {
                let (uid, gid) = st.ids()?;
                identity::setup_private_users(uid, gid)?;
            }
            Stage::PrivateNetwork => self.enter_namespace(
                self.runtime.and_then(|r| r.netns.as_ref()),
                CloneFlags::CLONE_NEWNET,
                "net",
            )?,
            Stage::PrivateIpc => self.enter_namespace(
                self.runtime.and_then(|r| r.ipcns.as_ref()),
                CloneFlags::CLONE_NEWIPC,
                "ipc",
            )?,
            Stage::ProtectHostname => unshare(CloneFlags::CLONE_NEWUTS).op("unshare")?,
            Stage::MountNamespace => {
                let inputs = PlanInputs {
                    directories: &self.plan.directories,
                    tmp_dirs: self.runtime.and_then(ExecRuntime::tmp_dirs),
                    credentials_dir: st.credentials_dir.as_deref(),
                    apply_root: self.params.flags.contains(ExecFlags::APPLY_CHROOT),
                };
                let ns = namespace::compile(ctx, &inputs);
                tracing::debug!(unit = self.unit, mounts = ns.mounts.len(), "building mount namespace");
                self.pipeline.namespaces.apply(&ns)?;
                st.root = ns.root;
            }
            Stage::Chroot => {
                let root = match (&st.root, &ctx.root) {
                    (Some(root), _) => root.clone(),
                    (None, Some(RootSource::Directory(dir))) => dir.clone(),
                    (None, _) => {
                        return Err(Error::Config("a root image needs a mount namespace".into()));
                    }
                };
                namespace::enter_root(&root)?;
            }
            Stage::PassFds => self.pass_fds(st)?,
            Stage::BoundingSet => {
                if let Some(keep) = surface.bounding_set {
                    sandbox::apply_bounding_set(keep, self.plan.facts.last_cap)?;
                }
            }
            Stage::WorkingDirectory => self.working_directory(st)?,
            Stage::AmbientCaps => sandbox::apply_ambient(surface.ambient)?,
            Stage::Securebits => sandbox::apply_securebits(surface.secure_bits)?,
            Stage::NoNewPrivileges => sys::set_no_new_privs()?,
            Stage::Restrict(r) => {
                if let Some((_, filter)) = surface.restrictions.iter().find(|(x, _)| *x == r) {
                    sandbox::load_filter(filter)?;
                }
            }
            Stage::SyscallFilter => {
                if let Some(filter) = &surface.syscall_filter {
                    sandbox::load_filter(filter)?;
                }
            }
            Stage::Exec => return self.exec(st),
            _ => {
                return Err(Error::Config(format!("stage {} is not classified", stage.name())));
            }
        }
        Ok(Flow::Continue)
    }

    /// Stages whose exit status depends on what failed.
    fn classified(&self, stage: Stage, st: &mut State) -> std::result::Result<Flow, StageError> {
        match stage {
            Stage::ResolveIdentity => {
                let suggested = directories::suggested_paths(&self.plan.directories);
                let id = identity::resolve(self.ctx, self.dynamic, &suggested, sys::ngroups_max())
                    .map_err(group_or_user)?;
                st.identity = Some(id);
            }
            Stage::Stdio => {
                let owner = st.ids().status(ExitStatus::Stdin)?;
                let identifier = self.identifier();
                st.journal_stream = self.stdio(&identifier).apply(Some(owner))?;
            }
            Stage::Directories => {
                let (uid, gid) = st.ids().status(ExitStatus::User)?;
                directories::prepare(&self.plan.directories, uid, gid)?;
            }
            Stage::Umask => {
                umask(Mode::from_bits_truncate(self.ctx.umask));
            }
            Stage::Session => self.open_session(st)?,
            Stage::ChangeIdentity => {
                let id = st.identity().status(ExitStatus::User)?;
                let surface = &self.plan.surface;
                let retain = Retain {
                    keep_caps: surface.keep_caps,
                    secure_bits: if self.plan.stages.contains(&Stage::Securebits) {
                        surface.secure_bits
                    } else {
                        0
                    },
                };
                let transition = IdentityTransition::plan(id, !surface.emulate_ambient, retain);
                if transition.is_noop() {
                    tracing::debug!(unit = self.unit, "identity unchanged");
                }
                transition.apply()?;
            }
            Stage::Mac => {
                if let Some(m) = &self.plan.surface.mac {
                    mac::apply(m).status(m.exit_status())?;
                }
            }
            _ => return self.simple(stage, st).status(ExitStatus::Exec),
        }
        Ok(Flow::Continue)
    }

    fn close_fds(&self) -> Result<()> {
        let p = self.params;
        let mut keep: Vec<RawFd> = p.fds.iter().map(AsRawFd::as_raw_fd).collect();
        keep.extend(
            [&p.exec_fd, &p.identity_fd, &p.stdin_fd, &p.stdout_fd, &p.stderr_fd]
                .into_iter()
                .flatten()
                .map(AsRawFd::as_raw_fd),
        );
        if let Some(rt) = self.runtime {
            for storage in [&rt.netns, &rt.ipcns].into_iter().flatten() {
                keep.extend(storage.raw_fds());
            }
        }
        sys::close_all_except(&keep)?;
        Ok(())
    }

    fn confirm(&self) -> Result<Flow> {
        let answer = confirm::ask_console(
            &self.pipeline.config.console,
            self.pipeline.manager,
            self.unit,
            self.command,
        )?;
        match answer {
            Confirmation::PretendSuccess => {
                tracing::info!(unit = self.unit, command = %self.command.command_line(), "skipped on console");
                Ok(Flow::Exit(0))
            }
            Confirmation::PretendFailure => Err(Error::Config("execution refused on console".into())),
            _ => Ok(Flow::Continue),
        }
    }

    fn report_identity(&self, st: &State) -> Result<()> {
        let Some(fd) = &self.params.identity_fd else {
            return Ok(());
        };
        let (uid, gid) = st.ids()?;
        let report = sdexec_proto::IdentityReport {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            unit_id: self.unit.to_owned(),
        };
        let buf = sdexec_proto::encode_datagram(&report).map_err(|source| Error::Proto {
            what: "identity report",
            source,
        })?;
        write(fd, &buf).op("write")?;
        Ok(())
    }

    fn identifier(&self) -> String {
        self.ctx
            .syslog_identifier
            .clone()
            .unwrap_or_else(|| stdio::default_identifier(&self.command.path))
    }

    fn stdio<'s>(&'s self, identifier: &'s str) -> StdioSetup<'s> {
        StdioSetup {
            ctx: self.ctx,
            params: self.params,
            config: self.pipeline.config,
            unit: self.unit,
            identifier,
        }
    }

    fn open_session(&self, st: &mut State) -> std::result::Result<(), StageError> {
        let Some(service) = &self.ctx.pam_name else {
            return Ok(());
        };
        let id = st.identity.as_mut().ok_or_else(|| {
            StageError::new(ExitStatus::Pam, Error::Identity("no identity for the session".into()))
        })?;
        let user = id.user_name.clone().unwrap_or_else(|| id.uid.to_string());
        let tty = self.ctx.uses_tty().then(|| self.stdio("").tty_path());
        let mut base = Environment::new();
        base.extend_assignments(&self.params.environment);
        let pairs: Vec<(String, String)> = base.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();

        let handle = self
            .pipeline
            .sessions
            .open(service, &user, tty.as_deref(), &pairs)
            .status(ExitStatus::Pam)?;
        let extra = handle.groups();
        if !extra.is_empty() {
            id.groups = identity::merge_groups(&[id.groups.as_slice(), extra.as_slice()], sys::ngroups_max()).status(ExitStatus::Group)?;
        }
        st.session_env = handle.environment();
        session::spawn_close_helper(handle, id.uid, id.gid).status(ExitStatus::Pam)?;
        Ok(())
    }

    fn enter_namespace(&self, stored: Option<&NamespaceStorage>, flag: CloneFlags, name: &str) -> Result<()> {
        match stored {
            Some(storage) => {
                let created = storage.enter(flag, name)?;
                tracing::debug!(unit = self.unit, namespace = name, created, "joined namespace");
            }
            None => unshare(flag).op("unshare")?,
        }
        Ok(())
    }

    /// Moves the passed descriptors to 3, 4, ... in order. Everything is
    /// first duplicated above the target range so no source is clobbered.
    fn pass_fds(&self, st: &mut State) -> Result<()> {
        let fds = &self.params.fds;
        let min = RawFd::try_from(3 + fds.len()).map_err(|_| Error::Config("too many descriptors".into()))?;
        let moved = fds
            .iter()
            .map(|fd| sys::dup_above(fd.as_raw_fd(), min))
            .collect::<std::io::Result<Vec<_>>>()?;
        if let Some(exec_fd) = st.exec_fd {
            st.exec_fd = Some(sys::dup_above(exec_fd, min)?);
        }
        for (target, fd) in (3..).zip(moved) {
            sys::dup2(fd, target)?;
            sys::set_cloexec(target, false)?;
            sys::close(fd);
        }
        Ok(())
    }

    fn working_directory(&self, st: &State) -> Result<()> {
        let dir = match &self.ctx.working_directory {
            Some(WorkingDirectory::Home) => st.identity()?.home.clone(),
            Some(WorkingDirectory::Path(p)) => p.clone(),
            None => return Ok(()),
        };
        match chdir(&dir) {
            Err(Errno::ENOENT) if self.ctx.working_directory_missing_ok => {
                tracing::debug!(dir = %dir.display(), "working directory missing, staying in /");
                chdir("/").op("chdir")
            }
            other => other.op("chdir"),
        }
    }

    fn environment(&self, st: &State) -> Result<Environment> {
        let ctx = self.ctx;
        let params = self.params;
        let id = st.identity()?;
        let with_user = ctx.user.is_some() || ctx.dynamic_user;
        let home = id.home.to_string_lossy();
        let shell = id.shell.to_string_lossy();
        let uid = id.uid.to_string();
        let tty = ctx.uses_tty().then(|| self.stdio("").tty_path());
        let tty = tty.as_ref().map(|t| t.to_string_lossy());
        let dirs = directories::environment(&self.plan.directories);
        let creds = st.credentials_dir.as_ref().map(|d| d.to_string_lossy());

        let mut vars = Environment::new();
        vars.extend_assignments(&params.environment);
        let generated = env::generated(&env::Generated {
            pid: getpid().as_raw(),
            n_fds: params.fds.len(),
            fd_names: &params.fd_names,
            watchdog_usec: if params.flags.contains(ExecFlags::SET_WATCHDOG) {
                params.watchdog_usec
            } else {
                0
            },
            user: with_user.then(|| id.user_name.as_deref().unwrap_or(&uid)),
            home: with_user.then_some(&*home),
            shell: with_user.then_some(&*shell),
            tty: tty.as_deref(),
            invocation_id: params.invocation_id.as_deref(),
            journal_stream: st.journal_stream,
            log_namespace: ctx.log_namespace.as_deref(),
            directories: &dirs,
            credentials_dir: creds.as_deref(),
        });
        vars.extend_pairs(&generated.iter().collect::<Vec<_>>());
        vars.extend_assignments(&ctx.environment);
        vars.extend_pairs(&st.session_env);
        Ok(vars)
    }

    fn exec(&self, st: &State) -> Result<Flow> {
        let vars = self.environment(st)?;
        let search = vars.get("PATH").unwrap_or(DEFAULT_PATH);
        let path = match find_executable(&self.command.path, search) {
            Ok(path) => path,
            Err(e) if self.command.flags.ignore_failure => {
                tracing::info!(unit = self.unit, error = %e, "executable missing, ignoring");
                return Ok(Flow::Exit(0));
            }
            Err(e) => return Err(e),
        };
        let argv = if self.command.flags.no_env_expand {
            self.command.argv.clone()
        } else {
            env::expand_argv(&self.command.argv, &vars)
        };
        let argv = argv.into_iter().map(CString::new).collect::<std::result::Result<Vec<_>, _>>()?;
        let envp = vars.to_envp()?;
        let cpath = CString::new(path.as_os_str().as_bytes())?;

        tracing::debug!(unit = self.unit, path = %path.display(), argc = argv.len(), "executing");
        notify_exec(st.exec_fd, b"1");
        let err = sys::execve(&cpath, &argv, &envp);
        notify_exec(st.exec_fd, b"0");
        Err(err.into())
    }
}

/// Too many groups has its own exit status.
fn group_or_user(e: Error) -> StageError {
    let status = if matches!(e, Error::TooManyGroups { .. }) {
        ExitStatus::Group
    } else {
        ExitStatus::User
    };
    StageError::new(status, e)
}

fn notify_exec(fd: Option<RawFd>, marker: &[u8]) {
    let Some(fd) = fd else {
        return;
    };
    // SAFETY: the exec descriptor stays open until the process image is
    // replaced or the child exits.
    #[allow(unsafe_code)]
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    if let Err(e) = write(fd.as_fd(), marker) {
        tracing::debug!(error = %e, "cannot write exec notification");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn absolute_paths_must_be_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            find_executable(&script, DEFAULT_PATH),
            Err(Error::ExecutableNotFound(_))
        ));
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_executable(&script, DEFAULT_PATH).unwrap(), script);
    }

    #[test]
    fn names_are_searched_in_order() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let tool = b.path().join("tool");
        fs::write(&tool, "").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        let search = format!("{}::{}", a.path().display(), b.path().display());
        assert_eq!(find_executable(Path::new("tool"), &search).unwrap(), tool);
        assert!(find_executable(Path::new("missing-tool"), &search).is_err());
    }

    #[test]
    fn group_overflow_is_classified_separately() {
        let e = group_or_user(Error::TooManyGroups { count: 2, max: 1 });
        assert_eq!(e.status, ExitStatus::Group);
        assert_eq!(group_or_user(Error::Identity("x".into())).status, ExitStatus::User);
    }
}
