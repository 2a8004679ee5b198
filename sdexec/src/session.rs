//! Login-session integration (PAM) behind a trait.
//!
//! The session is opened in the setup process. A helper forked right after
//! keeps it alive: it waits for `SIGTERM`, delivered as parent-death signal
//! when the service process exits, and only then closes the session. The
//! setup process drops its handle without closing.

use std::path::Path;

use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};
use nix::unistd::{ForkResult, Gid, Pid, Uid, fork, getpid, getppid, setgid, setuid};

use crate::error::ErrnoExt;
use crate::{Error, Result, sys};

/// An open login session.
///
/// Dropping a session must not close it.
pub trait Session {
    /// Variables the session adds to the environment.
    fn environment(&self) -> Vec<(String, String)>;
    /// Groups the session grants.
    fn groups(&self) -> Vec<Gid>;
    /// Closes the session.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Opens login sessions.
pub trait SessionManager {
    /// Opens a session of PAM service `service` for `user`.
    fn open(
        &self,
        service: &str,
        user: &str,
        tty: Option<&Path>,
        env: &[(String, String)],
    ) -> Result<Box<dyn Session>>;
}

/// Manager used when no PAM stack is available: every open fails.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct NoSessionManager;

impl SessionManager for NoSessionManager {
    fn open(&self, service: &str, user: &str, _: Option<&Path>, _: &[(String, String)]) -> Result<Box<dyn Session>> {
        Err(Error::Config(format!(
            "no session manager available to open PAM service {service:?} for {user:?}"
        )))
    }
}

fn sigterm() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set
}

/// Forks the helper owning `session`. It runs as `uid`/`gid` where allowed
/// and closes the session when the calling process dies.
pub fn spawn_close_helper(session: Box<dyn Session>, uid: Uid, gid: Gid) -> Result<Pid> {
    let mut old = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&sigterm()), Some(&mut old)).op("sigprocmask")?;
    let parent = getpid();

    // SAFETY: the helper only changes ids, waits for a signal and closes the
    // session before `_exit`.
    #[allow(unsafe_code)]
    let forked = unsafe { fork() }.op("fork");
    match forked {
        Ok(ForkResult::Child) => {
            let _ = sys::set_parent_death_signal(libc::SIGTERM);
            if getppid() == parent {
                if let Err(e) = setgid(gid).and_then(|()| setuid(uid)) {
                    tracing::debug!(error = %e, "session helper keeps its identity");
                }
                let _ = sigterm().wait();
            }
            let code = match session.close() {
                Ok(()) => 0,
                Err(_) => 1,
            };
            sys::exit_immediately(code);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(session);
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old), None).op("sigprocmask")?;
            tracing::debug!(helper = child.as_raw(), "session helper started");
            Ok(child)
        }
        Err(e) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old), None);
            Err(e)
        }
    }
}
