//! `sdexec run`: spawn a unit's command and wait for it.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use colored::Colorize;
use nix::sys::wait::{WaitStatus, waitpid};
use rand::Rng;
use sdexec::credentials::mount::SystemMounts;
use sdexec::identity::{DynamicCreds, DynamicUserPool};
use sdexec::manager::FlagFileManager;
use sdexec::namespace::LinuxNamespaceSetup;
use sdexec::runtime::RuntimeRegistry;
use sdexec::session::NoSessionManager;
use sdexec::{ExecParameters, ExitStatus, Pipeline, PipelineConfig};
use sdexec_proto::IdentityReport;

use crate::unit::UnitFile;

/// Arguments for `sdexec run`.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Unit description (JSON).
    unit: PathBuf,

    /// Set an environment variable (KEY=value).
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,

    /// Ask on the console before executing.
    #[arg(long)]
    confirm: bool,

    /// Command and arguments, overriding the unit's command.
    #[arg(last = true)]
    pub(crate) command: Vec<String>,
}

/// Random 128-bit id in lowercase hex.
fn invocation_id() -> String {
    let id: u128 = rand::thread_rng().r#gen();
    format!("{id:032x}")
}

impl RunArgs {
    /// Spawns the unit and returns the child's exit code.
    pub fn run(self, config: &PipelineConfig) -> Result<i32> {
        let unit = UnitFile::load(&self.unit)?;
        let command = unit.command(&self.command)?;
        let ctx = &unit.context;

        let (report_rx, report_tx) = UnixDatagram::pair().context("identity socket")?;
        let (mut exec_rx, exec_tx) = std::io::pipe().context("exec notification pipe")?;

        let mut params = ExecParameters::new();
        params.invocation_id = Some(invocation_id());
        params.environment = unit.environment.iter().chain(&self.env).cloned().collect();
        params.confirm_spawn = self.confirm;
        params.identity_fd = Some(OwnedFd::from(report_tx));
        params.exec_fd = Some(OwnedFd::from(exec_tx));

        let registry = RuntimeRegistry::new(&config.private_tmp_root);
        let runtime = registry.acquire(&unit.name, ctx, true)?;
        let dynamic = if ctx.dynamic_user {
            let pool = DynamicUserPool::open(&config.dynamic_user_dir)?;
            Some(DynamicCreds::for_unit(pool, &unit.name, ctx.user.as_deref(), ctx.group.as_deref()))
        } else {
            None
        };

        let manager = FlagFileManager::new(&config.confirm_disabled_flag);
        let namespaces = LinuxNamespaceSetup::default();
        let sessions = NoSessionManager::default();
        let mounts = SystemMounts::default();
        let pipeline = Pipeline::new(config, &manager, &namespaces, &sessions, &mounts);
        let pid = pipeline
            .spawn(&unit.name, &command, ctx, &params, runtime.as_deref(), dynamic.as_ref())
            .with_context(|| format!("spawning {}", unit.name))?;
        tracing::info!(unit = %unit.name, pid = pid.as_raw(), command = %command.command_line(), "started");
        // Our copies of the child's descriptors; the exec pipe reaches EOF
        // once the child has exec'd or exited.
        drop(params);

        let mut marker = Vec::new();
        exec_rx.read_to_end(&mut marker).context("reading exec notification")?;
        let status = waitpid(pid, None).context("waiting for the child")?;

        let mut buf = [0u8; sdexec_proto::MAX_DATAGRAM];
        report_rx.set_nonblocking(true)?;
        if let Ok(n) = report_rx.recv(&mut buf) {
            let report: IdentityReport = sdexec_proto::decode_datagram(&buf[..n])?;
            tracing::info!(uid = report.uid, gid = report.gid, unit = %report.unit_id, "identity");
        }

        if let Some(rt) = runtime
            && let Some(cleanup) = registry.release(rt, true)
        {
            join_cleanup(&unit.name, cleanup);
        }
        if let Some(creds) = &dynamic
            && let Err(e) = creds.release()
        {
            tracing::warn!(error = %e, "cannot release dynamic user");
        }

        Ok(report_exit(status, marker.last() == Some(&b'1')))
    }
}

/// Waits for the temp directory cleanup. Returns whether it finished
/// without panicking.
fn join_cleanup(unit: &str, cleanup: JoinHandle<()>) -> bool {
    let ok = cleanup.join().is_ok();
    if !ok {
        tracing::warn!(unit, "private temp directory cleanup panicked");
    }
    ok
}

/// Prints how the child ended and returns the code to exit with.
fn report_exit(status: WaitStatus, executed: bool) -> i32 {
    match status {
        WaitStatus::Exited(_, 0) => 0,
        WaitStatus::Exited(_, code) => {
            match ExitStatus::from_code(code).filter(|_| !executed) {
                Some(step) => eprintln!(
                    "{} failed at step {}: {}",
                    "error:".red().bold(),
                    step.name().bold(),
                    step.describe()
                ),
                None => eprintln!("{} exited with code {code}", "error:".red().bold()),
            }
            code
        }
        WaitStatus::Signaled(_, sig, _) => {
            eprintln!("{} killed by {sig}", "error:".red().bold());
            128 + sig as i32
        }
        other => {
            tracing::warn!(status = ?other, "unexpected wait status");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    use super::*;

    #[test]
    fn invocation_ids_are_hex() {
        let id = invocation_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, invocation_id());
    }

    #[test]
    fn cleanup_panic_is_reported_not_propagated() {
        assert!(join_cleanup("a.service", std::thread::spawn(|| {})));
        assert!(!join_cleanup("a.service", std::thread::spawn(|| panic!("rmdir"))));
    }

    #[test]
    fn exit_codes_pass_through() {
        let pid = Pid::from_raw(1);
        assert_eq!(report_exit(WaitStatus::Exited(pid, 0), true), 0);
        assert_eq!(report_exit(WaitStatus::Exited(pid, 217), false), 217);
        assert_eq!(report_exit(WaitStatus::Signaled(pid, Signal::SIGTERM, false), true), 143);
    }
}
