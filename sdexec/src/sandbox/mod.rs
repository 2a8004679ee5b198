//! Sandboxing surface: capability sets, securebits, "no new privileges" and
//! the compiled syscall filters for one execution attempt.

pub mod caps;
pub mod mac;
pub mod restrict;
pub mod seccomp;
pub mod syscalls;

use nix::unistd::Uid;

use self::caps::{CAP_SETGID, CAP_SETPCAP, CAP_SETUID, CAP_SYS_ADMIN, CapabilitySet};
use self::restrict::Restriction;
use self::seccomp::SyscallFilter;
use crate::context::{ExecContext, MacContext};
use crate::params::ExecCommand;
use crate::{Result, sys};

/// Facts about the calling process, probed once per attempt before any
/// stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct HostFacts {
    /// Running with euid 0.
    pub privileged: bool,
    /// `CAP_SYS_ADMIN` is in the effective set.
    pub has_sys_admin: bool,
    /// The kernel supports ambient capabilities.
    pub ambient_supported: bool,
    /// Highest capability number the kernel knows.
    pub last_cap: u8,
}

impl HostFacts {
    /// Probes the calling process.
    pub fn probe() -> Self {
        let has_sys_admin = sys::capabilities()
            .is_ok_and(|s| CapabilitySet::from_bits(s.effective).contains(CAP_SYS_ADMIN));
        Self {
            privileged: Uid::effective().is_root(),
            has_sys_admin,
            ambient_supported: sys::ambient_supported(),
            last_cap: caps::last_cap(),
        }
    }

    /// Facts of an unprivileged process on a modern kernel.
    pub const fn unprivileged() -> Self {
        Self {
            privileged: false,
            has_sys_admin: false,
            ambient_supported: true,
            last_cap: 40,
        }
    }

    /// Facts of a root process on a modern kernel.
    pub const fn root() -> Self {
        Self {
            privileged: true,
            has_sys_admin: true,
            ambient_supported: true,
            last_cap: 40,
        }
    }
}

/// Everything the capability, MAC and seccomp stages apply.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SandboxSurface {
    /// Set `PR_SET_NO_NEW_PRIVS`.
    pub no_new_privileges: bool,
    /// Capabilities kept in the bounding set; `None` leaves it untouched.
    pub bounding_set: Option<CapabilitySet>,
    /// Ambient capabilities to raise after the uid change.
    pub ambient: CapabilitySet,
    /// Ambient capabilities are emulated: the uid is not changed and the
    /// program drops privileges itself.
    pub emulate_ambient: bool,
    /// Keep permitted capabilities across the uid change.
    pub keep_caps: bool,
    /// Securebits to set.
    pub secure_bits: u32,
    /// MAC context for the next exec.
    pub mac: Option<MacContext>,
    /// Hardening filters, in load order.
    pub restrictions: Vec<(Restriction, SyscallFilter)>,
    /// Main allow/deny filter, loaded last.
    pub syscall_filter: Option<SyscallFilter>,
}

impl SandboxSurface {
    /// A surface that changes nothing.
    pub const fn unrestricted() -> Self {
        Self {
            no_new_privileges: false,
            bounding_set: None,
            ambient: CapabilitySet::EMPTY,
            emulate_ambient: false,
            keep_caps: false,
            secure_bits: 0,
            mac: None,
            restrictions: Vec::new(),
            syscall_filter: None,
        }
    }

    /// Computes the surface for running `command` under `ctx`.
    ///
    /// Commands marked fully privileged get [`unrestricted`](Self::unrestricted).
    pub fn build(ctx: &ExecContext, command: &ExecCommand, facts: HostFacts) -> Result<Self> {
        if command.flags.full_privileges {
            return Ok(Self::unrestricted());
        }
        let emulate_ambient =
            command.flags.ambient_fallback && !facts.ambient_supported && !ctx.ambient_capabilities.is_empty();

        let bounding_set = ctx.capability_bounding_set.map(|set| {
            if emulate_ambient {
                set.with(CAP_SETPCAP).with(CAP_SETUID).with(CAP_SETGID)
            } else {
                set
            }
        });

        // Seccomp needs either CAP_SYS_ADMIN or no_new_privs; only a root
        // target of a process holding CAP_SYS_ADMIN keeps the former.
        let keeps_sys_admin = ctx.targets_root() && facts.has_sys_admin;
        let no_new_privileges = ctx.no_new_privileges || (ctx.uses_syscall_filters() && !keeps_sys_admin);

        Ok(Self {
            no_new_privileges,
            bounding_set,
            ambient: if emulate_ambient {
                CapabilitySet::EMPTY
            } else {
                ctx.ambient_capabilities
            },
            emulate_ambient,
            keep_caps: !ctx.ambient_capabilities.is_empty() || ctx.secure_bits != 0,
            secure_bits: ctx.secure_bits,
            mac: ctx.mac.clone(),
            restrictions: restrict::restrictions(ctx)?,
            syscall_filter: ctx.syscall_filter.as_ref().map(restrict::syscall_filter),
        })
    }
}

/// Drops every capability not in `keep` from the bounding set.
pub fn apply_bounding_set(keep: CapabilitySet, last_cap: u8) -> Result<()> {
    for cap in (0..=last_cap).filter(|c| !keep.contains(*c)) {
        match sys::bounding_drop(cap) {
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => break,
            other => other?,
        }
    }
    Ok(())
}

/// Makes `set` inheritable and raises it in the ambient set.
pub fn apply_ambient(set: CapabilitySet) -> Result<()> {
    if set.is_empty() {
        return Ok(());
    }
    let mut state = sys::capabilities()?;
    state.inheritable |= set.bits();
    sys::set_capabilities(state)?;
    for cap in set.iter() {
        sys::ambient_raise(cap)?;
    }
    Ok(())
}

/// Sets the final securebits.
///
/// After a switch to an unprivileged uid, `CAP_SETPCAP` survives only in
/// the permitted set; it is raised into the effective set first.
pub fn apply_securebits(bits: u32) -> Result<()> {
    if sys::securebits()? == bits {
        return Ok(());
    }
    let mut state = sys::capabilities()?;
    let effective = CapabilitySet::from_bits(state.effective);
    if !effective.contains(CAP_SETPCAP) && CapabilitySet::from_bits(state.permitted).contains(CAP_SETPCAP) {
        state.effective = effective.with(CAP_SETPCAP).bits();
        sys::set_capabilities(state)?;
    }
    sys::set_securebits(bits)?;
    Ok(())
}

/// Compiles and loads one filter.
pub fn load_filter(filter: &SyscallFilter) -> Result<()> {
    let program = filter.compile()?;
    sys::seccomp_load(&program)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SyscallAction, SyscallFilterRules};
    use crate::params::CommandFlags;

    fn cmd() -> ExecCommand {
        ExecCommand::new("/bin/true")
    }

    #[test]
    fn nnp_follows_filters_for_unprivileged_targets() {
        let ctx = ExecContext {
            user: Some("nobody".into()),
            restrict_realtime: true,
            ..ExecContext::default()
        };
        let s = SandboxSurface::build(&ctx, &cmd(), HostFacts::root()).unwrap();
        assert!(s.no_new_privileges);
        assert_eq!(s.restrictions.len(), 1);
    }

    #[test]
    fn root_target_with_sys_admin_needs_no_nnp() {
        let ctx = ExecContext {
            restrict_realtime: true,
            ..ExecContext::default()
        };
        let s = SandboxSurface::build(&ctx, &cmd(), HostFacts::root()).unwrap();
        assert!(!s.no_new_privileges);
        let s = SandboxSurface::build(&ctx, &cmd(), HostFacts::unprivileged()).unwrap();
        assert!(s.no_new_privileges);
    }

    #[test]
    fn explicit_nnp_is_kept() {
        let ctx = ExecContext {
            no_new_privileges: true,
            ..ExecContext::default()
        };
        assert!(SandboxSurface::build(&ctx, &cmd(), HostFacts::root()).unwrap().no_new_privileges);
    }

    #[test]
    fn ambient_emulation_widens_bounding_set() {
        let ctx = ExecContext {
            user: Some("nobody".into()),
            capability_bounding_set: Some(CapabilitySet::parse(&["CAP_NET_BIND_SERVICE"]).unwrap()),
            ambient_capabilities: CapabilitySet::parse(&["CAP_NET_BIND_SERVICE"]).unwrap(),
            ..ExecContext::default()
        };
        let mut command = cmd();
        command.flags = CommandFlags {
            ambient_fallback: true,
            ..CommandFlags::default()
        };
        let old_kernel = HostFacts {
            ambient_supported: false,
            ..HostFacts::root()
        };
        let s = SandboxSurface::build(&ctx, &command, old_kernel).unwrap();
        assert!(s.emulate_ambient);
        assert!(s.ambient.is_empty());
        let b = s.bounding_set.unwrap();
        for cap in [CAP_SETPCAP, CAP_SETUID, CAP_SETGID] {
            assert!(b.contains(cap));
        }

        let s = SandboxSurface::build(&ctx, &command, HostFacts::root()).unwrap();
        assert!(!s.emulate_ambient);
        assert!(s.keep_caps);
        assert!(!s.bounding_set.unwrap().contains(CAP_SETUID));
    }

    #[test]
    fn full_privileges_skip_everything() {
        let ctx = ExecContext {
            no_new_privileges: true,
            syscall_filter: Some(SyscallFilterRules::default()),
            ..ExecContext::default()
        };
        let mut command = cmd();
        command.flags.full_privileges = true;
        let s = SandboxSurface::build(&ctx, &command, HostFacts::root()).unwrap();
        assert!(!s.no_new_privileges);
        assert!(s.syscall_filter.is_none());
    }

    #[test]
    fn main_filter_is_compiled_from_rules() {
        let ctx = ExecContext {
            syscall_filter: Some(SyscallFilterRules {
                allow_list: false,
                syscalls: [("mount".to_owned(), None)].into(),
                error_number: Some(1),
            }),
            ..ExecContext::default()
        };
        let s = SandboxSurface::build(&ctx, &cmd(), HostFacts::root()).unwrap();
        let f = s.syscall_filter.unwrap();
        assert_eq!(f.default, SyscallAction::Allow);
        assert_eq!(f.action_for(libc::SYS_mount), SyscallAction::Errno(1));
    }
}
