//! The execution pipeline: an ordered list of setup stages run in a forked
//! child, ending in `execve`.
//!
//! [`Plan::build`] computes which stages apply to one attempt before
//! anything is forked, so the order can be inspected and tested. The child
//! then walks the list; see [`Pipeline::spawn`].

mod child;

use nix::unistd::{ForkResult, Pid, fork};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::context::ExecContext;
use crate::credentials::mount::{MountBackend, SystemMounts};
use crate::error::ErrnoExt;
use crate::identity::DynamicCreds;
use crate::manager::{FlagFileManager, Manager};
use crate::namespace::{self, LinuxNamespaceSetup, NamespaceSetup, PlanInputs, PreparedDirectory, directories};
use crate::params::{ExecCommand, ExecFlags, ExecParameters};
use crate::runtime::ExecRuntime;
use crate::sandbox::restrict::Restriction;
use crate::sandbox::{HostFacts, SandboxSurface};
use crate::session::{NoSessionManager, SessionManager};
use crate::status::ExitStatus;
use crate::{Error, Result, sys};

pub use self::child::find_executable;

/// One setup step of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Stage {
    /// Close inherited descriptors the program must not see.
    CloseFds,
    /// Reset signal dispositions and the signal mask.
    ResetSignals,
    /// Start a new session.
    Setsid,
    /// Ask on the console whether to go on.
    Confirm,
    /// Resolve user, group and supplementary groups.
    ResolveIdentity,
    /// Report the resolved ids upstream.
    ReportIdentity,
    /// Join the unit's control group.
    Cgroup,
    /// Connect standard input, output and error.
    Stdio,
    /// Adjust the OOM score.
    OomAdjust,
    /// Set the scheduling priority.
    Nice,
    /// Set the execution domain.
    Personality,
    /// Create the per-type directories.
    Directories,
    /// Materialize the credential store.
    Credentials,
    /// Set the file mode creation mask.
    Umask,
    /// Apply resource limits.
    Limits,
    /// Open the login session.
    Session,
    /// Enter a private user namespace.
    PrivateUsers,
    /// Enter the unit's network namespace.
    PrivateNetwork,
    /// Enter the unit's IPC namespace.
    PrivateIpc,
    /// Enter a private UTS namespace.
    ProtectHostname,
    /// Build the private mount namespace.
    MountNamespace,
    /// Change the root directory.
    Chroot,
    /// Move passed descriptors to 3 and up.
    PassFds,
    /// Drop capabilities from the bounding set.
    BoundingSet,
    /// Change groups, gid and uid.
    ChangeIdentity,
    /// Change to the working directory.
    WorkingDirectory,
    /// Raise ambient capabilities.
    AmbientCaps,
    /// Switch the MAC context for exec.
    Mac,
    /// Set securebits.
    Securebits,
    /// Set "no new privileges".
    NoNewPrivileges,
    /// Load one hardening filter.
    Restrict(Restriction),
    /// Load the main syscall filter.
    SyscallFilter,
    /// Replace the process image.
    Exec,
}

impl Stage {
    /// Name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::CloseFds => "close-fds",
            Self::ResetSignals => "reset-signals",
            Self::Setsid => "setsid",
            Self::Confirm => "confirm",
            Self::ResolveIdentity => "resolve-identity",
            Self::ReportIdentity => "report-identity",
            Self::Cgroup => "cgroup",
            Self::Stdio => "stdio",
            Self::OomAdjust => "oom-adjust",
            Self::Nice => "nice",
            Self::Personality => "personality",
            Self::Directories => "directories",
            Self::Credentials => "credentials",
            Self::Umask => "umask",
            Self::Limits => "limits",
            Self::Session => "session",
            Self::PrivateUsers => "private-users",
            Self::PrivateNetwork => "private-network",
            Self::PrivateIpc => "private-ipc",
            Self::ProtectHostname => "protect-hostname",
            Self::MountNamespace => "mount-namespace",
            Self::Chroot => "chroot",
            Self::PassFds => "pass-fds",
            Self::BoundingSet => "bounding-set",
            Self::ChangeIdentity => "change-identity",
            Self::WorkingDirectory => "working-directory",
            Self::AmbientCaps => "ambient-caps",
            Self::Mac => "mac",
            Self::Securebits => "securebits",
            Self::NoNewPrivileges => "no-new-privileges",
            Self::Restrict(r) => r.name(),
            Self::SyscallFilter => "syscall-filter",
            Self::Exec => "exec",
        }
    }

    /// Whether a failure the kernel or an enclosing container causes is
    /// downgraded to a warning.
    pub const fn is_optional(self) -> bool {
        matches!(self, Self::Restrict(_) | Self::SyscallFilter | Self::ProtectHostname)
    }

    /// Exit status of a fatal failure, for stages with a single one.
    pub const fn exit_status(self) -> Option<ExitStatus> {
        Some(match self {
            Self::CloseFds | Self::PassFds => ExitStatus::Fds,
            Self::ResetSignals => ExitStatus::SignalMask,
            Self::Setsid => ExitStatus::Setsid,
            Self::Confirm => ExitStatus::Confirm,
            Self::ReportIdentity | Self::PrivateUsers => ExitStatus::User,
            Self::Cgroup => ExitStatus::Cgroup,
            Self::OomAdjust => ExitStatus::OomAdjust,
            Self::Nice => ExitStatus::Nice,
            Self::Personality => ExitStatus::Personality,
            Self::Credentials => ExitStatus::Credentials,
            Self::Limits => ExitStatus::Limits,
            Self::PrivateNetwork => ExitStatus::Network,
            Self::PrivateIpc | Self::ProtectHostname | Self::MountNamespace => ExitStatus::Namespace,
            Self::Chroot => ExitStatus::Chroot,
            Self::BoundingSet | Self::AmbientCaps => ExitStatus::Capabilities,
            Self::WorkingDirectory => ExitStatus::Chdir,
            Self::Securebits => ExitStatus::Securebits,
            Self::NoNewPrivileges => ExitStatus::NoNewPrivileges,
            Self::Restrict(r) => r.exit_status(),
            Self::SyscallFilter => ExitStatus::Seccomp,
            Self::Exec => ExitStatus::Exec,
            Self::ResolveIdentity
            | Self::Stdio
            | Self::Directories
            | Self::Umask
            | Self::Session
            | Self::ChangeIdentity
            | Self::Mac => return None,
        })
    }
}

/// Everything decided about one attempt before forking.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Plan {
    /// Probed once; decides where the user namespace goes.
    pub facts: HostFacts,
    /// Capabilities, MAC and filters.
    pub surface: SandboxSurface,
    /// Per-type directories.
    pub directories: Vec<PreparedDirectory>,
    /// Stages, in execution order.
    pub stages: Vec<Stage>,
}

impl Plan {
    /// Plans running `command` under `ctx`. `confirm` says whether the
    /// console prompt is shown.
    pub fn build(
        ctx: &ExecContext,
        params: &ExecParameters,
        command: &ExecCommand,
        facts: HostFacts,
        confirm: bool,
    ) -> Result<Self> {
        let surface = SandboxSurface::build(ctx, command, facts)?;
        let dirs = if params.flags.contains(ExecFlags::CREATE_DIRECTORIES) {
            directories::plan(ctx, params)?
        } else {
            Vec::new()
        };
        let sandboxing = params.flags.contains(ExecFlags::APPLY_SANDBOXING) && !command.flags.full_privileges;
        let apply_root = params.flags.contains(ExecFlags::APPLY_CHROOT);
        let inputs = PlanInputs {
            directories: &dirs,
            apply_root,
            ..PlanInputs::default()
        };
        let mount_ns = sandboxing && namespace::needs_mount_namespace(ctx, &inputs);
        let private_users = sandboxing && ctx.private_users;

        let head = [
            (true, Stage::CloseFds),
            (true, Stage::ResetSignals),
            (true, Stage::Setsid),
            (confirm, Stage::Confirm),
            (true, Stage::ResolveIdentity),
            (params.identity_fd.is_some(), Stage::ReportIdentity),
            (params.cgroup_path.is_some(), Stage::Cgroup),
            (true, Stage::Stdio),
            (ctx.oom_score_adjust.is_some(), Stage::OomAdjust),
            (ctx.nice.is_some(), Stage::Nice),
            (ctx.personality.is_some(), Stage::Personality),
            (!dirs.is_empty(), Stage::Directories),
            (
                params.flags.contains(ExecFlags::WRITE_CREDENTIALS) && !ctx.credentials.is_empty(),
                Stage::Credentials,
            ),
            (true, Stage::Umask),
            (!ctx.limits.is_empty(), Stage::Limits),
            (ctx.pam_name.is_some(), Stage::Session),
            // Without privileges the user namespace has to come first to
            // grant the capabilities the other namespaces need.
            (private_users && !facts.privileged, Stage::PrivateUsers),
            (sandboxing && ctx.private_network, Stage::PrivateNetwork),
            (sandboxing && ctx.private_ipc, Stage::PrivateIpc),
            (sandboxing && ctx.protect_hostname, Stage::ProtectHostname),
            (mount_ns, Stage::MountNamespace),
            (private_users && facts.privileged, Stage::PrivateUsers),
            (apply_root && ctx.root.is_some(), Stage::Chroot),
            (!params.fds.is_empty(), Stage::PassFds),
            (sandboxing && surface.bounding_set.is_some(), Stage::BoundingSet),
            (!command.flags.full_privileges, Stage::ChangeIdentity),
            (ctx.working_directory.is_some(), Stage::WorkingDirectory),
            (!surface.ambient.is_empty(), Stage::AmbientCaps),
            (sandboxing && surface.mac.is_some(), Stage::Mac),
            (sandboxing && surface.secure_bits != 0, Stage::Securebits),
            (sandboxing && surface.no_new_privileges, Stage::NoNewPrivileges),
        ];
        let mut stages: Vec<Stage> = head.into_iter().filter_map(|(on, s)| on.then_some(s)).collect();
        if sandboxing {
            stages.extend(surface.restrictions.iter().map(|(r, _)| Stage::Restrict(*r)));
            if surface.syscall_filter.is_some() {
                stages.push(Stage::SyscallFilter);
            }
        }
        stages.push(Stage::Exec);

        Ok(Self {
            facts,
            surface,
            directories: dirs,
            stages,
        })
    }

    /// Checks that `runtime` provides what the planned stages take from it.
    ///
    /// A private `/tmp` is only ever bind-mounted from the shared runtime;
    /// without one the unit would silently see the host's.
    pub fn check_runtime(&self, ctx: &ExecContext, runtime: Option<&ExecRuntime>) -> Result<()> {
        if self.stages.contains(&Stage::MountNamespace)
            && ctx.private_tmp
            && runtime.and_then(ExecRuntime::tmp_dirs).is_none()
        {
            return Err(Error::Config("a private /tmp needs a shared runtime with temp directories".into()));
        }
        Ok(())
    }

    /// Mount plan of the attempt as far as it is known before forking.
    pub fn namespace(&self, ctx: &ExecContext, params: &ExecParameters) -> namespace::NamespacePlan {
        if !self.stages.contains(&Stage::MountNamespace) {
            return namespace::NamespacePlan::default();
        }
        namespace::compile(
            ctx,
            &PlanInputs {
                directories: &self.directories,
                apply_root: params.flags.contains(ExecFlags::APPLY_CHROOT),
                ..PlanInputs::default()
            },
        )
    }
}

/// Applicable stages of one attempt, in order.
pub fn plan_stages(
    ctx: &ExecContext,
    params: &ExecParameters,
    command: &ExecCommand,
    facts: HostFacts,
    confirm: bool,
) -> Result<Vec<Stage>> {
    Ok(Plan::build(ctx, params, command, facts, confirm)?.stages)
}

/// Collaborators of the pipeline.
#[derive(Clone, Copy)]
#[non_exhaustive]
pub struct Pipeline<'a> {
    /// Host paths.
    pub config: &'a PipelineConfig,
    /// Manager consulted for prompts.
    pub manager: &'a dyn Manager,
    /// Builds mount namespaces.
    pub namespaces: &'a dyn NamespaceSetup,
    /// Opens login sessions.
    pub sessions: &'a dyn SessionManager,
    /// Mounts the credential store.
    pub mounts: &'a dyn MountBackend,
}

impl std::fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("config", self.config).finish_non_exhaustive()
    }
}

impl<'a> Pipeline<'a> {
    /// Pipeline with explicit collaborators.
    pub fn new(
        config: &'a PipelineConfig,
        manager: &'a dyn Manager,
        namespaces: &'a dyn NamespaceSetup,
        sessions: &'a dyn SessionManager,
        mounts: &'a dyn MountBackend,
    ) -> Self {
        Self {
            config,
            manager,
            namespaces,
            sessions,
            mounts,
        }
    }

    /// Forks a child that runs every stage of the attempt and executes
    /// `command`. Returns the child's pid.
    ///
    /// Errors found while planning are returned directly; failures inside
    /// the child terminate it with the stage's [`ExitStatus`].
    pub fn spawn(
        &self,
        unit: &str,
        command: &ExecCommand,
        ctx: &ExecContext,
        params: &ExecParameters,
        runtime: Option<&ExecRuntime>,
        dynamic: Option<&DynamicCreds>,
    ) -> Result<Pid> {
        let facts = HostFacts::probe();
        let confirm = params.confirm_spawn && self.manager.confirm_spawn_enabled();
        let plan = Plan::build(ctx, params, command, facts, confirm)?;
        plan.check_runtime(ctx, runtime)?;
        tracing::debug!(
            unit,
            command = %command.command_line(),
            stages = plan.stages.len(),
            privileged = facts.privileged,
            "spawning"
        );

        // SAFETY: the child only runs the stages and then execs or `_exit`s.
        #[allow(unsafe_code)]
        let forked = unsafe { fork() }.op("fork")?;
        match forked {
            ForkResult::Child => {
                let attempt = child::Attempt {
                    pipeline: *self,
                    unit,
                    command,
                    ctx,
                    params,
                    runtime,
                    dynamic,
                    plan: &plan,
                };
                sys::exit_immediately(attempt.run())
            }
            ForkResult::Parent { child } => {
                tracing::debug!(unit, pid = child.as_raw(), "forked");
                Ok(child)
            }
        }
    }
}

/// Spawns `command` with the host's collaborators and the configuration
/// named by `$SDEXEC_CONFIG`.
pub fn spawn(
    unit: &str,
    command: &ExecCommand,
    ctx: &ExecContext,
    params: &ExecParameters,
    runtime: Option<&ExecRuntime>,
    dynamic: Option<&DynamicCreds>,
) -> Result<Pid> {
    let config = PipelineConfig::from_env()?;
    let manager = FlagFileManager::new(&config.confirm_disabled_flag);
    Pipeline::new(&config, &manager, &LinuxNamespaceSetup, &NoSessionManager, &SystemMounts)
        .spawn(unit, command, ctx, params, runtime, dynamic)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{Gid, Uid, User};

    use super::*;
    use crate::context::{
        CredentialSource, CredentialSpec, DirectoryConfig, DirectoryItem, DirectoryType, RootSource, SyscallAction,
        SyscallFilterRules,
    };
    use crate::credentials::{self, CredentialStore};
    use crate::env;
    use crate::identity::{self, DynamicUserPool};
    use crate::runtime::RuntimeRegistry;
    use crate::sys;

    fn cmd() -> ExecCommand {
        ExecCommand::new("/bin/true")
    }

    fn position(stages: &[Stage], s: Stage) -> usize {
        stages.iter().position(|x| *x == s).unwrap()
    }

    #[test]
    fn plain_unit_has_minimal_pipeline() {
        let stages = plan_stages(
            &ExecContext::default(),
            &ExecParameters::new(),
            &cmd(),
            HostFacts::unprivileged(),
            false,
        )
        .unwrap();
        assert_eq!(
            stages,
            [
                Stage::CloseFds,
                Stage::ResetSignals,
                Stage::Setsid,
                Stage::ResolveIdentity,
                Stage::Stdio,
                Stage::Umask,
                Stage::ChangeIdentity,
                Stage::Exec,
            ]
        );
    }

    #[test]
    fn scenario_fixed_user_without_namespaces() {
        let ctx = ExecContext {
            user: Some("nobody".into()),
            ..ExecContext::default()
        };
        let mut params = ExecParameters::new();
        params.cgroup_path = Some("/system.slice/a.service".into());
        let stages = plan_stages(&ctx, &params, &cmd(), HostFacts::root(), false).unwrap();
        assert!(!stages.contains(&Stage::MountNamespace));
        assert_eq!(stages.last(), Some(&Stage::Exec));
        assert!(position(&stages, Stage::ResolveIdentity) < position(&stages, Stage::Cgroup));
        assert!(position(&stages, Stage::Cgroup) < position(&stages, Stage::Stdio));

        if let Some(nobody) = User::from_name("nobody").unwrap() {
            let id = identity::resolve(&ctx, None, &[], sys::ngroups_max()).unwrap();
            assert_eq!(id.gid, nobody.gid);
        }
    }

    #[test]
    fn scenario_dynamic_user_state_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecContext {
            dynamic_user: true,
            directories: BTreeMap::from([(
                DirectoryType::State,
                DirectoryConfig {
                    mode: 0o750,
                    items: vec![DirectoryItem::new("db")],
                },
            )]),
            ..ExecContext::default()
        };
        let mut params = ExecParameters::new();
        params.prefixes.insert(DirectoryType::State, tmp.path().join("lib"));

        let plan = Plan::build(&ctx, &params, &cmd(), HostFacts::root(), false).unwrap();
        assert!(plan.stages.contains(&Stage::MountNamespace));
        assert!(position(&plan.stages, Stage::Directories) < position(&plan.stages, Stage::MountNamespace));

        let pool = DynamicUserPool::open(tmp.path().join("dynamic-uid")).unwrap();
        let creds = DynamicCreds::for_unit(pool, "db.service", None, None);
        let id = identity::resolve(
            &ctx,
            Some(&creds),
            &directories::suggested_paths(&plan.directories),
            sys::ngroups_max(),
        )
        .unwrap();
        assert!((identity::DYNAMIC_UID_MIN..=identity::DYNAMIC_UID_MAX).contains(&id.uid.as_raw()));
        assert_eq!(id.uid.as_raw(), id.gid.as_raw());

        // Ownership is left alone when the target is the caller.
        directories::prepare(&plan.directories, Uid::effective(), Gid::effective()).unwrap();
        let lib = tmp.path().join("lib");
        assert_eq!(fs::read_link(lib.join("db")).unwrap(), std::path::Path::new("private/db"));
        assert!(lib.join("private/db").is_dir());
        let mode = fs::metadata(lib.join("private")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        let vars = directories::environment(&plan.directories);
        let expected = lib.join("db").display().to_string();
        assert_eq!(vars, [("STATE_DIRECTORY".to_owned(), expected)]);

        let ns = plan.namespace(&ctx, &params);
        assert!(!ns.mounts.is_empty());
    }

    #[test]
    fn scenario_literal_beats_loaded_credential() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("token-file");
        fs::write(&file, "from-disk").unwrap();
        let ctx = ExecContext {
            credentials: vec![
                CredentialSpec {
                    id: "token".into(),
                    source: CredentialSource::Path(file),
                    encrypted: false,
                },
                CredentialSpec {
                    id: "token".into(),
                    source: CredentialSource::Literal("secret".into()),
                    encrypted: false,
                },
            ],
            ..ExecContext::default()
        };
        let stages = plan_stages(&ctx, &ExecParameters::new(), &cmd(), HostFacts::root(), false).unwrap();
        assert!(position(&stages, Stage::Credentials) < position(&stages, Stage::Exec));

        let store_dir = tmp.path().join("store");
        fs::create_dir(&store_dir).unwrap();
        let mut store = CredentialStore::new(&store_dir, None, false);
        credentials::fill(&mut store, &ctx, "a.service", &PipelineConfig::default()).unwrap();
        assert_eq!(store.ids().collect::<Vec<_>>(), ["token"]);
        assert_eq!(fs::read_to_string(store_dir.join("token")).unwrap(), "secret");
    }

    #[test]
    fn scenario_deny_list_filter_is_last() {
        let ctx = ExecContext {
            user: Some("nobody".into()),
            restrict_realtime: true,
            syscall_filter: Some(SyscallFilterRules {
                allow_list: false,
                syscalls: [("mount".to_owned(), None)].into(),
                error_number: Some(1),
            }),
            ..ExecContext::default()
        };
        let plan = Plan::build(&ctx, &ExecParameters::new(), &cmd(), HostFacts::root(), false).unwrap();
        let n = plan.stages.len();
        assert_eq!(plan.stages[n - 1], Stage::Exec);
        assert_eq!(plan.stages[n - 2], Stage::SyscallFilter);
        assert!(position(&plan.stages, Stage::NoNewPrivileges) < position(&plan.stages, Stage::Restrict(Restriction::Realtime)));

        let filter = plan.surface.syscall_filter.unwrap();
        assert_eq!(filter.default, SyscallAction::Allow);
        assert_eq!(filter.action_for(libc::SYS_mount), SyscallAction::Errno(1));
    }

    #[test]
    fn user_namespace_placement_follows_privilege() {
        let ctx = ExecContext {
            private_users: true,
            private_network: true,
            private_tmp: true,
            ..ExecContext::default()
        };
        let params = ExecParameters::new();
        let unpriv = plan_stages(&ctx, &params, &cmd(), HostFacts::unprivileged(), false).unwrap();
        assert!(position(&unpriv, Stage::PrivateUsers) < position(&unpriv, Stage::PrivateNetwork));
        let root = plan_stages(&ctx, &params, &cmd(), HostFacts::root(), false).unwrap();
        assert!(position(&root, Stage::MountNamespace) < position(&root, Stage::PrivateUsers));
        assert_eq!(root.iter().filter(|s| **s == Stage::PrivateUsers).count(), 1);
    }

    #[test]
    fn ordering_contracts() {
        let ctx = ExecContext {
            user: Some("nobody".into()),
            root: Some(RootSource::Directory("/srv/root".into())),
            private_devices: true,
            pam_name: Some("login".into()),
            limits: BTreeMap::from([(crate::limits::ResourceKind::Nofile, crate::limits::ResourceLimit::fixed(1024))]),
            working_directory: Some(crate::context::WorkingDirectory::Home),
            ..ExecContext::default()
        };
        let mut params = ExecParameters::new();
        params.confirm_spawn = true;
        let (a, _b) = sys::socketpair_dgram().unwrap();
        params.fds.push(a);
        let s = plan_stages(&ctx, &params, &cmd(), HostFacts::root(), true).unwrap();
        let at = |st| position(&s, st);
        assert!(at(Stage::CloseFds) < at(Stage::Confirm));
        assert!(at(Stage::Confirm) < at(Stage::ResolveIdentity));
        assert!(at(Stage::Limits) < at(Stage::Session));
        assert!(at(Stage::MountNamespace) < at(Stage::Chroot));
        assert!(at(Stage::Chroot) < at(Stage::ChangeIdentity));
        assert!(at(Stage::ChangeIdentity) < at(Stage::WorkingDirectory));
        assert!(at(Stage::PassFds) < at(Stage::Exec));
    }

    #[test]
    fn full_privileges_skip_sandboxing() {
        let ctx = ExecContext {
            private_tmp: true,
            no_new_privileges: true,
            restrict_realtime: true,
            ..ExecContext::default()
        };
        let mut command = cmd();
        command.flags.full_privileges = true;
        let s = plan_stages(&ctx, &ExecParameters::new(), &command, HostFacts::root(), false).unwrap();
        assert!(!s.contains(&Stage::MountNamespace));
        assert!(!s.contains(&Stage::NoNewPrivileges));
        assert!(!s.contains(&Stage::ChangeIdentity));
    }

    #[test]
    fn optional_stages_and_statuses() {
        assert!(Stage::SyscallFilter.is_optional());
        assert!(Stage::Restrict(Restriction::Clock).is_optional());
        assert!(!Stage::MountNamespace.is_optional());
        assert_eq!(
            Stage::Restrict(Restriction::AddressFamilies).exit_status(),
            Some(ExitStatus::AddressFamilies)
        );
        assert_eq!(Stage::Stdio.exit_status(), None);
        assert_eq!(serde_json::to_string(&Stage::MountNamespace).unwrap(), "\"mount-namespace\"");
    }

    #[test]
    fn private_tmp_requires_a_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecContext {
            private_tmp: true,
            ..ExecContext::default()
        };
        let plan = Plan::build(&ctx, &ExecParameters::new(), &cmd(), HostFacts::root(), false).unwrap();
        assert!(matches!(plan.check_runtime(&ctx, None), Err(Error::Config(_))));

        let registry = RuntimeRegistry::new(tmp.path());
        let runtime = registry.acquire("tmp.service", &ctx, true).unwrap().unwrap();
        plan.check_runtime(&ctx, Some(runtime.as_ref())).unwrap();

        let config = PipelineConfig::default();
        let manager = FlagFileManager::new(tmp.path().join("no-confirm"));
        let pipeline = Pipeline::new(&config, &manager, &LinuxNamespaceSetup, &NoSessionManager, &SystemMounts);
        assert!(pipeline.spawn("tmp.service", &cmd(), &ctx, &ExecParameters::new(), None, None).is_err());
        if let Some(cleanup) = registry.release(runtime, true) {
            cleanup.join().unwrap();
        }
    }

    /// Runs `/bin/true` as `nobody` under `ctx` and returns how the child
    /// ended. `None` unless running as root on a host with a `nobody` user.
    fn run_as_nobody(ctx: ExecContext, config: &PipelineConfig) -> Option<WaitStatus> {
        if !Uid::effective().is_root() || User::from_name("nobody").ok().flatten().is_none() {
            return None;
        }
        let ctx = ExecContext {
            user: Some("nobody".into()),
            ..ctx
        };
        let manager = FlagFileManager::new(config.confirm_disabled_flag.clone());
        let pipeline = Pipeline::new(config, &manager, &LinuxNamespaceSetup, &NoSessionManager, &SystemMounts);
        let pid = pipeline
            .spawn("nobody.service", &cmd(), &ctx, &ExecParameters::new(), None, None)
            .unwrap();
        Some(waitpid(pid, None).unwrap())
    }

    #[test]
    fn securebits_survive_the_switch_to_an_unprivileged_user() {
        let ctx = ExecContext {
            secure_bits: 1,
            ..ExecContext::default()
        };
        if let Some(status) = run_as_nobody(ctx, &PipelineConfig::default()) {
            assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
        }
    }

    #[test]
    fn private_users_with_unprivileged_target() {
        let ctx = ExecContext {
            private_users: true,
            ..ExecContext::default()
        };
        if let Some(status) = run_as_nobody(ctx, &PipelineConfig::default()) {
            assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
        }
    }

    #[test]
    fn literal_credential_on_a_real_store_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            credentials_root: tmp.path().join("credentials"),
            ..PipelineConfig::default()
        };
        let ctx = ExecContext {
            credentials: vec![CredentialSpec {
                id: "token".into(),
                source: CredentialSource::Literal("secret".into()),
                encrypted: false,
            }],
            ..ExecContext::default()
        };
        if let Some(status) = run_as_nobody(ctx, &config) {
            let store = config.credentials_dir("nobody.service");
            let written = fs::read_to_string(store.join("token"));
            credentials::mount::clear(&SystemMounts, &store).unwrap();
            assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
            assert_eq!(written.unwrap(), "secret");
        }
    }

    #[test]
    fn environment_contract() {
        let names = vec!["http".to_owned()];
        let dirs = vec![("STATE_DIRECTORY".to_owned(), "/var/lib/db".to_owned())];
        let generated = env::generated(&env::Generated {
            pid: 10,
            n_fds: 1,
            fd_names: &names,
            directories: &dirs,
            ..env::Generated::default()
        });
        assert_eq!(generated.get("LISTEN_FDNAMES"), Some("http"));
        assert_eq!(generated.get("STATE_DIRECTORY"), Some("/var/lib/db"));
    }
}
