//! Private user namespace setup.
//!
//! A process cannot write its own `uid_map` from inside a fresh user
//! namespace without privileges it just gave up, so a helper that stays in
//! the parent namespace writes the maps for it:
//!
//! 1. fork the helper, which blocks on a [`ReadySignal`];
//! 2. `unshare(CLONE_NEWUSER)` in the main process and signal the helper;
//! 3. the helper writes `uid_map`, `setgroups` and `gid_map` of its parent,
//!    reporting any failure over a [`ResultChannel`](crate::channel);
//! 4. the main process reaps the helper and fails on anything but a clean
//!    exit.

use std::fs;

use nix::sched::{CloneFlags, unshare};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, fork, getpid};
use sdexec_proto::HelperError;

use crate::channel::{ReadySignal, ResultSender, result_channel};
use crate::error::ErrnoExt;
use crate::{Error, Result, sys};

/// Map content keeping `outer` and `inner` (which may be equal) mapped to
/// themselves; everything else becomes the overflow id.
pub fn uid_map(outer: u32, inner: u32) -> String {
    if outer == inner {
        format!("{inner} {inner} 1\n")
    } else {
        format!("{outer} {outer} 1\n{inner} {inner} 1\n")
    }
}

/// Whether `setgroups(2)` may be called in the current user namespace.
///
/// Kernels without `/proc/self/setgroups` always allow it.
pub fn setgroups_allowed() -> bool {
    match fs::read_to_string("/proc/self/setgroups") {
        Ok(state) => state.trim() != "deny",
        Err(_) => true,
    }
}

/// Kills and reaps the helper unless disarmed.
struct HelperGuard(Option<Pid>);

impl HelperGuard {
    fn disarm(&mut self) -> Option<Pid> {
        self.0.take()
    }
}

impl Drop for HelperGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
    }
}

/// Moves the calling process into a new user namespace in which `uid`/`gid`
/// (and the current ids) are mapped to themselves.
pub fn setup_private_users(uid: Uid, gid: Gid) -> Result<()> {
    let ouid = Uid::current().as_raw();
    let ogid = Gid::current().as_raw();
    let uid_content = uid_map(ouid, uid.as_raw());
    let gid_content = uid_map(ogid, gid.as_raw());

    let ready = ReadySignal::new()?;
    let (tx, rx) = result_channel()?;
    let parent = getpid();

    // SAFETY: the setup process is single-threaded; the helper only performs
    // file writes before exiting.
    #[allow(unsafe_code)]
    let fork_result = unsafe { fork() }.op("fork")?;
    match fork_result {
        ForkResult::Child => {
            drop(rx);
            let code = match write_maps(&ready, parent, &uid_content, &gid_content, tx) {
                Ok(()) => 0,
                Err(()) => 1,
            };
            sys::exit_immediately(code);
        }
        ForkResult::Parent { child } => {
            drop(tx);
            let mut guard = HelperGuard(Some(child));
            unshare(CloneFlags::CLONE_NEWUSER).op("unshare(CLONE_NEWUSER)")?;
            ready.notify()?;

            let reported = rx.recv().map_err(|source| Error::Proto {
                what: "user namespace helper",
                source,
            })?;
            let Some(pid) = guard.disarm() else {
                return Ok(());
            };
            let status = waitpid(pid, None).op("waitpid")?;
            if let Some(err) = reported {
                return Err(Error::Proto {
                    what: "user namespace helper",
                    source: std::io::Error::other(format!(
                        "{}: {}",
                        err.op,
                        std::io::Error::from_raw_os_error(err.errno)
                    )),
                });
            }
            if status != WaitStatus::Exited(pid, 0) {
                return Err(Error::Identity(format!(
                    "user namespace helper ended with {status:?}"
                )));
            }
            Ok(())
        }
    }
}

fn write_maps(
    ready: &ReadySignal,
    parent: Pid,
    uid_content: &str,
    gid_content: &str,
    tx: ResultSender,
) -> std::result::Result<(), ()> {
    let proc = format!("/proc/{parent}");
    let steps: [(&str, String, &str); 3] = [
        ("write uid_map", format!("{proc}/uid_map"), uid_content),
        ("write setgroups", format!("{proc}/setgroups"), "deny\n"),
        ("write gid_map", format!("{proc}/gid_map"), gid_content),
    ];
    if let Err(e) = ready.wait() {
        let _ = tx.send(&HelperError::new("wait for ready", e.raw_os_error().unwrap_or(0)));
        return Err(());
    }
    for (op, path, content) in steps {
        if let Err(e) = fs::write(&path, content) {
            // Kernels without setgroups control reject the file; the map
            // write that follows is what matters.
            if op == "write setgroups" && e.kind() == std::io::ErrorKind::NotFound {
                continue;
            }
            let _ = tx.send(&HelperError::new(op, e.raw_os_error().unwrap_or(0)));
            return Err(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_map_has_one_line() {
        assert_eq!(uid_map(0, 0), "0 0 1\n");
    }

    #[test]
    fn initial_namespace_allows_setgroups() {
        let initial = fs::read_to_string("/proc/self/uid_map")
            .is_ok_and(|m| m.split_whitespace().collect::<Vec<_>>() == ["0", "0", "4294967295"]);
        if initial {
            assert!(setgroups_allowed());
        }
    }

    #[test]
    fn distinct_ids_get_two_lines() {
        assert_eq!(uid_map(0, 61_184), "0 0 1\n61184 61184 1\n");
    }
}
