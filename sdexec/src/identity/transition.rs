//! The single process-identity change of an execution attempt.

use nix::unistd::{Gid, Uid, setgid, setgroups, setuid};

use super::ResolvedIdentity;
use super::userns;
use crate::error::{ErrnoExt, StageError, StageExt};
use crate::status::ExitStatus;
use crate::sys;

/// `SECBIT_KEEP_CAPS` from `<linux/securebits.h>`.
pub const SECBIT_KEEP_CAPS: u32 = 1 << 4;

/// One step of an [`IdentityTransition`], in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransitionStep {
    /// `PR_SET_KEEPCAPS(1)`.
    KeepCaps,
    /// `PR_SET_SECUREBITS`, including [`SECBIT_KEEP_CAPS`]. Needs
    /// `CAP_SETPCAP`, so it runs while the caller still has it.
    SecureBits(u32),
    /// `setgroups(2)`.
    SetGroups(Vec<Gid>),
    /// `setgid(2)`.
    SetGid(Gid),
    /// `setuid(2)`.
    SetUid(Uid),
}

/// The calling process, as far as planning a transition is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Caller {
    /// Real uid.
    pub uid: Uid,
    /// Effective uid.
    pub euid: Uid,
    /// Real gid.
    pub gid: Gid,
    /// Effective gid.
    pub egid: Gid,
    /// `setgroups(2)` is permitted in the current user namespace. A private
    /// user namespace has it denied.
    pub may_setgroups: bool,
}

impl Caller {
    /// The calling process.
    pub fn current() -> Self {
        Self {
            uid: Uid::current(),
            euid: Uid::effective(),
            gid: Gid::current(),
            egid: Gid::effective(),
            may_setgroups: userns::setgroups_allowed(),
        }
    }
}

/// What the transition has to preserve besides the ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Retain {
    /// Keep permitted capabilities across the uid change (ambient
    /// capabilities or securebits are requested).
    pub keep_caps: bool,
    /// Securebits the attempt ends up with; `0` for none.
    pub secure_bits: u32,
}

/// Planned identity change. Built once, applied once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTransition {
    /// Ordered steps.
    steps: Vec<TransitionStep>,
}

impl IdentityTransition {
    /// Plans the change from the calling process to `target`. Nothing is
    /// changed when `change_ids` is false.
    pub fn plan(target: &ResolvedIdentity, change_ids: bool, retain: Retain) -> Self {
        Self::plan_for(&Caller::current(), target, change_ids, retain)
    }

    /// Plans the change from `caller` to `target`.
    pub fn plan_for(caller: &Caller, target: &ResolvedIdentity, change_ids: bool, retain: Retain) -> Self {
        let mut steps = Vec::new();
        if !change_ids {
            return Self { steps };
        }
        let switching_user = target.uid != caller.uid || target.uid != caller.euid;
        if switching_user && !target.uid.is_root() {
            if retain.secure_bits != 0 {
                steps.push(TransitionStep::SecureBits(retain.secure_bits | SECBIT_KEEP_CAPS));
            } else if retain.keep_caps {
                steps.push(TransitionStep::KeepCaps);
            }
        }
        if caller.euid.is_root() {
            if caller.may_setgroups {
                steps.push(TransitionStep::SetGroups(target.groups.clone()));
            } else {
                tracing::debug!(groups = target.groups.len(), "setgroups denied, keeping supplementary groups");
            }
        }
        if target.gid != caller.gid || target.gid != caller.egid {
            steps.push(TransitionStep::SetGid(target.gid));
        }
        if switching_user {
            steps.push(TransitionStep::SetUid(target.uid));
        }
        Self { steps }
    }

    /// Planned steps.
    pub fn steps(&self) -> &[TransitionStep] {
        &self.steps
    }

    /// Whether nothing changes.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    /// Applies every step in order.
    pub fn apply(self) -> Result<(), StageError> {
        for step in self.steps {
            match step {
                TransitionStep::KeepCaps => {
                    sys::set_keep_caps(true).status(ExitStatus::User)?;
                }
                TransitionStep::SecureBits(bits) => {
                    sys::set_securebits(bits).status(ExitStatus::Securebits)?;
                }
                TransitionStep::SetGroups(groups) => {
                    setgroups(&groups).op("setgroups").status(ExitStatus::Group)?;
                }
                TransitionStep::SetGid(gid) => {
                    setgid(gid).op("setgid").status(ExitStatus::Group)?;
                }
                TransitionStep::SetUid(uid) => {
                    setuid(uid).op("setuid").status(ExitStatus::User)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(uid: u32, gid: u32) -> ResolvedIdentity {
        ResolvedIdentity {
            user_name: Some("svc".into()),
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
            groups: vec![Gid::from_raw(gid), Gid::from_raw(100)],
            home: "/".into(),
            shell: "/bin/sh".into(),
        }
    }

    fn root_caller(may_setgroups: bool) -> Caller {
        Caller {
            uid: Uid::from_raw(0),
            euid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            egid: Gid::from_raw(0),
            may_setgroups,
        }
    }

    fn position(t: &IdentityTransition, f: fn(&TransitionStep) -> bool) -> Option<usize> {
        t.steps().iter().position(f)
    }

    #[test]
    fn gid_precedes_uid_and_keepcaps_comes_first() {
        let retain = Retain {
            keep_caps: true,
            ..Retain::default()
        };
        let t = IdentityTransition::plan_for(&root_caller(true), &target(61_200, 61_200), true, retain);
        let keep = position(&t, |s| matches!(s, TransitionStep::KeepCaps)).unwrap();
        let groups = position(&t, |s| matches!(s, TransitionStep::SetGroups(_))).unwrap();
        let gid = position(&t, |s| matches!(s, TransitionStep::SetGid(_))).unwrap();
        let uid = position(&t, |s| matches!(s, TransitionStep::SetUid(_))).unwrap();
        assert!(keep < groups && groups < gid && gid < uid);
    }

    #[test]
    fn securebits_are_set_with_keep_caps_before_the_uid_change() {
        let retain = Retain {
            keep_caps: true,
            secure_bits: 1,
        };
        let t = IdentityTransition::plan_for(&root_caller(true), &target(65_534, 65_534), true, retain);
        assert_eq!(t.steps()[0], TransitionStep::SecureBits(1 | SECBIT_KEEP_CAPS));
        assert!(!t.steps().contains(&TransitionStep::KeepCaps));
        assert_eq!(t.steps().last(), Some(&TransitionStep::SetUid(Uid::from_raw(65_534))));
    }

    #[test]
    fn root_target_leaves_securebits_to_the_later_stage() {
        let retain = Retain {
            keep_caps: true,
            secure_bits: 1,
        };
        let caller = Caller {
            uid: Uid::from_raw(1000),
            ..root_caller(true)
        };
        let t = IdentityTransition::plan_for(&caller, &target(0, 0), true, retain);
        assert!(position(&t, |s| matches!(s, TransitionStep::SecureBits(_) | TransitionStep::KeepCaps)).is_none());
    }

    #[test]
    fn private_user_namespace_skips_setgroups() {
        let t = IdentityTransition::plan_for(&root_caller(false), &target(65_534, 65_534), true, Retain::default());
        assert!(position(&t, |s| matches!(s, TransitionStep::SetGroups(_))).is_none());
        assert_eq!(
            t.steps(),
            [
                TransitionStep::SetGid(Gid::from_raw(65_534)),
                TransitionStep::SetUid(Uid::from_raw(65_534))
            ]
        );
    }

    #[test]
    fn no_keepcaps_without_request() {
        let t = IdentityTransition::plan_for(&root_caller(true), &target(61_200, 61_200), true, Retain::default());
        assert!(!t.steps().contains(&TransitionStep::KeepCaps));
    }

    #[test]
    fn disabled_change_is_noop() {
        let retain = Retain {
            keep_caps: true,
            secure_bits: 1,
        };
        assert!(IdentityTransition::plan(&target(61_200, 61_200), false, retain).is_noop());
    }

    #[test]
    fn current_identity_is_noop_when_unprivileged() {
        if Uid::effective().is_root() {
            return;
        }
        let me = ResolvedIdentity::current();
        let retain = Retain {
            keep_caps: true,
            ..Retain::default()
        };
        let t = IdentityTransition::plan(&me, true, retain);
        assert!(t.is_noop());
        t.apply().unwrap();
    }
}
