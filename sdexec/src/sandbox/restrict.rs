//! Hardening filters, one independent seccomp program per category, and the
//! main allow/deny filter.

use std::collections::BTreeMap;

use serde::Serialize;

use super::seccomp::{
    AUDIT_ARCH_AARCH64, AUDIT_ARCH_ARM, AUDIT_ARCH_I386, AUDIT_ARCH_NATIVE, AUDIT_ARCH_X86_64,
    ArgCondition, SyscallFilter,
};
use super::syscalls;
use crate::context::{AddressFamilyRules, ExecContext, NamespaceType, SyscallAction, SyscallFilterRules};
use crate::status::ExitStatus;
use crate::{Error, Result};

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn errno(e: i32) -> SyscallAction {
    SyscallAction::Errno(e as u16)
}

const EPERM: SyscallAction = errno(libc::EPERM);

/// Syscalls every allow-list implicitly permits so that the program image
/// can still be replaced and the exec notification written.
const EXEC_MINIMUM: &[&str] = &["@default", "write", "close"];

/// `SCHED_RESET_ON_FORK`, OR-ed into scheduling policies.
const SCHED_RESET_ON_FORK: u32 = 0x4000_0000;

/// One hardening category. Loaded in [`Restriction::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Restriction {
    /// Only the listed ABIs may make syscalls.
    Architectures,
    /// Only the listed socket address families may be created.
    AddressFamilies,
    /// No realtime scheduling policies.
    Realtime,
    /// No setuid/setgid bits on created or chmod-ed files.
    SuidSgid,
    /// Only the listed namespace types may be created or joined.
    Namespaces,
    /// No `_sysctl(2)`.
    KernelTunables,
    /// No module loading or unloading.
    KernelModules,
    /// No kernel log buffer access.
    KernelLogs,
    /// No clock changes.
    Clock,
    /// No raw I/O port access.
    RawIo,
    /// Execution domain is fixed.
    Personality,
    /// No writable and executable mappings.
    MemoryDenyWriteExecute,
    /// Listed syscalls are audit-logged.
    SyscallLog,
}

impl Restriction {
    /// Every category, in load order.
    pub const ALL: [Self; 13] = [
        Self::Architectures,
        Self::AddressFamilies,
        Self::Realtime,
        Self::SuidSgid,
        Self::Namespaces,
        Self::KernelTunables,
        Self::KernelModules,
        Self::KernelLogs,
        Self::Clock,
        Self::RawIo,
        Self::Personality,
        Self::MemoryDenyWriteExecute,
        Self::SyscallLog,
    ];

    /// Short name for logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Architectures => "architectures",
            Self::AddressFamilies => "address-families",
            Self::Realtime => "realtime",
            Self::SuidSgid => "suid-sgid",
            Self::Namespaces => "namespaces",
            Self::KernelTunables => "kernel-tunables",
            Self::KernelModules => "kernel-modules",
            Self::KernelLogs => "kernel-logs",
            Self::Clock => "clock",
            Self::RawIo => "raw-io",
            Self::Personality => "personality",
            Self::MemoryDenyWriteExecute => "memory-deny-write-execute",
            Self::SyscallLog => "syscall-log",
        }
    }

    /// Exit status when loading the filter fails fatally.
    pub const fn exit_status(self) -> ExitStatus {
        match self {
            Self::AddressFamilies => ExitStatus::AddressFamilies,
            _ => ExitStatus::Seccomp,
        }
    }

    /// Filter for this category, or `None` when `ctx` does not ask for it.
    pub fn build(self, ctx: &ExecContext) -> Result<Option<SyscallFilter>> {
        Ok(match self {
            Self::Architectures if !ctx.syscall_architectures.is_empty() => {
                Some(architectures(&ctx.syscall_architectures)?)
            }
            Self::AddressFamilies => ctx.restrict_address_families.as_ref().and_then(address_families),
            Self::Realtime if ctx.restrict_realtime => Some(realtime()),
            Self::SuidSgid if ctx.restrict_suid_sgid => Some(suid_sgid()),
            Self::Namespaces => ctx.restrict_namespaces.as_deref().and_then(namespaces),
            Self::KernelTunables if ctx.protect_kernel_tunables => Some(deny(&["_sysctl"])),
            Self::KernelModules if ctx.protect_kernel_modules => Some(deny(&["@module"])),
            Self::KernelLogs if ctx.protect_kernel_logs => Some(deny(&["syslog"])),
            Self::Clock if ctx.protect_clock => Some(deny(&["@clock"])),
            Self::RawIo if ctx.private_devices => Some(deny(&["@raw-io"])),
            Self::Personality if ctx.lock_personality => Some(personality(
                ctx.personality.unwrap_or_default().persona(),
            )),
            Self::MemoryDenyWriteExecute if ctx.memory_deny_write_execute => Some(mdwe()),
            Self::SyscallLog if !ctx.syscall_log.is_empty() => Some(syscall_log(&ctx.syscall_log)),
            _ => None,
        })
    }
}

/// Every restriction `ctx` asks for, in load order.
pub fn restrictions(ctx: &ExecContext) -> Result<Vec<(Restriction, SyscallFilter)>> {
    let mut out = Vec::new();
    for r in Restriction::ALL {
        if let Some(f) = r.build(ctx)? {
            out.push((r, f));
        }
    }
    Ok(out)
}

/// The main filter. An allow-list denies everything not listed; a deny-list
/// allows everything not listed.
pub fn syscall_filter(rules: &SyscallFilterRules) -> SyscallFilter {
    let deny_action = rules.error_number.map_or(SyscallAction::KillProcess, SyscallAction::Errno);
    let mut actions: BTreeMap<i64, SyscallAction> = BTreeMap::new();

    // Groups first so that explicitly named syscalls override them.
    let (groups, names): (Vec<_>, Vec<_>) = rules.syscalls.iter().partition(|(n, _)| n.starts_with('@'));
    let mut filter = if rules.allow_list {
        for nr in EXEC_MINIMUM.iter().flat_map(|n| syscalls::expand(n)) {
            actions.insert(nr, SyscallAction::Allow);
        }
        for (name, _) in groups.into_iter().chain(names) {
            for nr in syscalls::expand(name) {
                actions.insert(nr, SyscallAction::Allow);
            }
        }
        SyscallFilter::new(deny_action)
    } else {
        for (name, errno) in groups.into_iter().chain(names) {
            let action = errno.map_or(deny_action, SyscallAction::Errno);
            for nr in syscalls::expand(name) {
                actions.insert(nr, action);
            }
        }
        SyscallFilter::new(SyscallAction::Allow)
    };
    for (nr, action) in actions {
        filter.add(nr, action);
    }
    filter
}

fn deny(names: &[&str]) -> SyscallFilter {
    let mut f = SyscallFilter::new(SyscallAction::Allow);
    for nr in names.iter().flat_map(|n| syscalls::expand(n)) {
        f.add(nr, EPERM);
    }
    f
}

fn arch_token(name: &str) -> Option<u32> {
    match name {
        "native" => Some(AUDIT_ARCH_NATIVE),
        "x86-64" => Some(AUDIT_ARCH_X86_64),
        "x86" => Some(AUDIT_ARCH_I386),
        "arm64" => Some(AUDIT_ARCH_AARCH64),
        "arm" => Some(AUDIT_ARCH_ARM),
        _ => None,
    }
}

fn architectures(names: &[String]) -> Result<SyscallFilter> {
    let mut tokens = Vec::new();
    for name in names {
        if name == "x32" {
            tracing::warn!("x32 calls are always filtered as a foreign ABI");
            continue;
        }
        let token = arch_token(name).ok_or_else(|| Error::Config(format!("unknown architecture {name:?}")))?;
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    if !tokens.contains(&AUDIT_ARCH_NATIVE) {
        return Err(Error::Config("the native architecture must be allowed".into()));
    }
    let mut f = SyscallFilter::new(SyscallAction::Allow).with_foreign(SyscallAction::KillProcess);
    f.secondary_arches = tokens.into_iter().filter(|&t| t != AUDIT_ARCH_NATIVE).collect();
    Ok(f)
}

/// Socket address family by name.
pub fn address_family(name: &str) -> Option<u32> {
    let n = match name {
        "AF_UNIX" | "AF_LOCAL" => libc::AF_UNIX,
        "AF_INET" => libc::AF_INET,
        "AF_INET6" => libc::AF_INET6,
        "AF_NETLINK" => libc::AF_NETLINK,
        "AF_PACKET" => libc::AF_PACKET,
        "AF_APPLETALK" => libc::AF_APPLETALK,
        "AF_X25" => libc::AF_X25,
        "AF_KEY" => libc::AF_KEY,
        "AF_CAN" => libc::AF_CAN,
        "AF_BLUETOOTH" => libc::AF_BLUETOOTH,
        "AF_ALG" => libc::AF_ALG,
        "AF_VSOCK" => libc::AF_VSOCK,
        "AF_XDP" => libc::AF_XDP,
        _ => return None,
    };
    u32::try_from(n).ok()
}

fn address_families(rules: &AddressFamilyRules) -> Option<SyscallFilter> {
    let values: Vec<u32> = rules
        .families
        .iter()
        .filter_map(|name| {
            let af = address_family(name);
            if af.is_none() {
                tracing::warn!(family = %name, "unknown address family, ignoring");
            }
            af
        })
        .collect();
    if !rules.allow_list && values.is_empty() {
        return None;
    }
    let condition = if rules.allow_list {
        ArgCondition::NotIn { arg: 0, values }
    } else {
        ArgCondition::In { arg: 0, values }
    };
    let mut f = SyscallFilter::new(SyscallAction::Allow);
    f.add_if(libc::SYS_socket, condition, errno(libc::EAFNOSUPPORT));
    Some(f)
}

#[allow(clippy::cast_sign_loss)]
fn realtime() -> SyscallFilter {
    let policies = [libc::SCHED_FIFO, libc::SCHED_RR, 6]
        .map(|p| p as u32)
        .into_iter()
        .flat_map(|p| [p, p | SCHED_RESET_ON_FORK])
        .collect();
    let mut f = SyscallFilter::new(SyscallAction::Allow);
    f.add_if(
        libc::SYS_sched_setscheduler,
        ArgCondition::In { arg: 1, values: policies },
        EPERM,
    );
    f.add(libc::SYS_sched_setattr, EPERM);
    f
}

#[allow(clippy::cast_sign_loss)]
fn suid_sgid() -> SyscallFilter {
    let mask = libc::S_ISUID | libc::S_ISGID;
    let mut f = SyscallFilter::new(SyscallAction::Allow);
    for (name, arg) in [
        ("chmod", 1),
        ("fchmod", 1),
        ("fchmodat", 2),
        ("creat", 1),
        ("mkdir", 1),
        ("mkdirat", 2),
        ("mknod", 1),
        ("mknodat", 2),
    ] {
        if let Some(nr) = syscalls::number(name) {
            f.add_if(nr, ArgCondition::MaskAny { arg, mask }, EPERM);
        }
    }
    for (name, flags, mode) in [("open", 1, 2), ("openat", 2, 3)] {
        let Some(nr) = syscalls::number(name) else { continue };
        let setid = ArgCondition::MaskAny { arg: mode, mask };
        let create = ArgCondition::MaskAny { arg: flags, mask: libc::O_CREAT as u32 };
        let tmpfile = ArgCondition::MaskAll { arg: flags, mask: libc::O_TMPFILE as u32 };
        f.add_if(nr, ArgCondition::All(vec![create, setid.clone()]), EPERM);
        f.add_if(nr, ArgCondition::All(vec![tmpfile, setid]), EPERM);
    }
    // openat2 keeps flags and mode in memory; make callers fall back to openat.
    f.add(libc::SYS_openat2, errno(libc::ENOSYS));
    f
}

fn namespaces(allowed: &[NamespaceType]) -> Option<SyscallFilter> {
    let mask = NamespaceType::ALL
        .into_iter()
        .filter(|t| !allowed.contains(t))
        .fold(0u32, |m, t| m | t.clone_flag());
    if mask == 0 {
        return None;
    }
    let mut f = SyscallFilter::new(SyscallAction::Allow);
    f.add_if(libc::SYS_unshare, ArgCondition::MaskAny { arg: 0, mask }, EPERM);
    f.add_if(libc::SYS_clone, ArgCondition::MaskAny { arg: 0, mask }, EPERM);
    f.add_if(libc::SYS_setns, ArgCondition::MaskAny { arg: 1, mask }, EPERM);
    f.add_if(libc::SYS_setns, ArgCondition::Eq { arg: 1, value: 0 }, EPERM);
    // clone3 passes its flags in memory; make callers fall back to clone.
    f.add(libc::SYS_clone3, errno(libc::ENOSYS));
    Some(f)
}

fn personality(persona: u32) -> SyscallFilter {
    let mut f = SyscallFilter::new(SyscallAction::Allow);
    f.add_if(
        libc::SYS_personality,
        ArgCondition::NotIn {
            arg: 0,
            values: vec![persona, 0xffff_ffff],
        },
        EPERM,
    );
    f
}

#[allow(clippy::cast_sign_loss)]
fn mdwe() -> SyscallFilter {
    let exec = libc::PROT_EXEC as u32;
    let write_exec = (libc::PROT_WRITE | libc::PROT_EXEC) as u32;
    let mut f = SyscallFilter::new(SyscallAction::Allow);
    f.add_if(libc::SYS_mmap, ArgCondition::MaskAll { arg: 2, mask: write_exec }, EPERM);
    f.add_if(libc::SYS_mprotect, ArgCondition::MaskAny { arg: 2, mask: exec }, EPERM);
    f.add_if(libc::SYS_pkey_mprotect, ArgCondition::MaskAny { arg: 2, mask: exec }, EPERM);
    f.add_if(libc::SYS_shmat, ArgCondition::MaskAny { arg: 2, mask: libc::SHM_EXEC as u32 }, EPERM);
    f
}

fn syscall_log(names: &[String]) -> SyscallFilter {
    let mut f = SyscallFilter::new(SyscallAction::Allow);
    for nr in names.iter().flat_map(|n| syscalls::expand(n)) {
        f.add(nr, SyscallAction::Log);
    }
    f
}

#[cfg(test)]
mod tests {
    use super::super::seccomp::ret_value;
    use super::super::seccomp::tests::{native, run};
    use super::*;

    fn ctx() -> ExecContext {
        ExecContext::default()
    }

    #[test]
    fn nothing_requested_means_no_filters() {
        assert!(restrictions(&ctx()).unwrap().is_empty());
    }

    #[test]
    fn restrictions_keep_load_order() {
        let c = ExecContext {
            memory_deny_write_execute: true,
            restrict_realtime: true,
            syscall_architectures: vec!["native".into()],
            protect_clock: true,
            ..ctx()
        };
        let kinds: Vec<_> = restrictions(&c).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            [
                Restriction::Architectures,
                Restriction::Realtime,
                Restriction::Clock,
                Restriction::MemoryDenyWriteExecute
            ]
        );
    }

    #[test]
    fn allow_list_defaults_to_deny() {
        let rules = SyscallFilterRules {
            allow_list: true,
            syscalls: [("read".to_owned(), None)].into(),
            error_number: Some(1),
        };
        let f = syscall_filter(&rules);
        assert_eq!(f.default, SyscallAction::Errno(1));
        assert_eq!(f.action_for(libc::SYS_read), SyscallAction::Allow);
        assert_eq!(f.action_for(libc::SYS_execve), SyscallAction::Allow);
        assert_eq!(f.action_for(libc::SYS_mount), SyscallAction::Errno(1));

        let kill = syscall_filter(&SyscallFilterRules {
            allow_list: true,
            ..SyscallFilterRules::default()
        });
        assert_eq!(kill.default, SyscallAction::KillProcess);
    }

    #[test]
    fn deny_list_defaults_to_allow_with_per_entry_errno() {
        let rules = SyscallFilterRules {
            allow_list: false,
            syscalls: [("mount".to_owned(), Some(13)), ("@swap".to_owned(), None)].into(),
            error_number: Some(1),
        };
        let f = syscall_filter(&rules);
        assert_eq!(f.default, SyscallAction::Allow);
        assert_eq!(f.action_for(libc::SYS_mount), SyscallAction::Errno(13));
        assert_eq!(f.action_for(libc::SYS_swapon), SyscallAction::Errno(1));
        assert_eq!(f.action_for(libc::SYS_read), SyscallAction::Allow);
    }

    #[test]
    fn named_entry_overrides_its_group() {
        let rules = SyscallFilterRules {
            allow_list: false,
            syscalls: [("@mount".to_owned(), None), ("mount".to_owned(), Some(38))].into(),
            error_number: Some(1),
        };
        let f = syscall_filter(&rules);
        assert_eq!(f.action_for(libc::SYS_mount), SyscallAction::Errno(38));
        assert_eq!(f.action_for(libc::SYS_umount2), SyscallAction::Errno(1));
    }

    #[test]
    fn address_family_allow_list() {
        let f = address_families(&AddressFamilyRules {
            allow_list: true,
            families: vec!["AF_UNIX".into(), "AF_INET".into()],
        })
        .unwrap();
        let p = f.compile().unwrap();
        let denied = ret_value(errno(libc::EAFNOSUPPORT));
        assert_eq!(native(&p, libc::SYS_socket, [1, 0, 0, 0, 0, 0]), ret_value(SyscallAction::Allow));
        assert_eq!(native(&p, libc::SYS_socket, [16, 0, 0, 0, 0, 0]), denied);
    }

    #[test]
    fn empty_address_family_deny_list_is_noop() {
        assert!(address_families(&AddressFamilyRules::default()).is_none());
    }

    #[test]
    fn architectures_kill_foreign_abi() {
        let f = architectures(&["native".into(), "x86".into()]).unwrap();
        let p = f.compile().unwrap();
        let allow = ret_value(SyscallAction::Allow);
        let kill = ret_value(SyscallAction::KillProcess);
        assert_eq!(native(&p, libc::SYS_read, [0; 6]), allow);
        if AUDIT_ARCH_NATIVE != AUDIT_ARCH_I386 {
            assert_eq!(run(&p, AUDIT_ARCH_I386, 3, [0; 6]), allow);
        }
        assert_eq!(run(&p, 0xdead_beef, 3, [0; 6]), kill);
        assert!(architectures(&["arm".into()]).is_err() || AUDIT_ARCH_NATIVE == AUDIT_ARCH_ARM);
        assert!(architectures(&["vax".into()]).is_err());
    }

    #[test]
    fn namespace_restriction_masks_disallowed_flags() {
        let f = namespaces(&[NamespaceType::Net]).unwrap();
        let p = f.compile().unwrap();
        let eperm = ret_value(EPERM);
        let allow = ret_value(SyscallAction::Allow);
        let newnet = u64::from(NamespaceType::Net.clone_flag());
        let newns = u64::from(NamespaceType::Mnt.clone_flag());
        assert_eq!(native(&p, libc::SYS_unshare, [newnet, 0, 0, 0, 0, 0]), allow);
        assert_eq!(native(&p, libc::SYS_unshare, [newns, 0, 0, 0, 0, 0]), eperm);
        assert_eq!(native(&p, libc::SYS_setns, [3, 0, 0, 0, 0, 0]), eperm);
        assert_eq!(native(&p, libc::SYS_clone3, [0; 6]), ret_value(errno(libc::ENOSYS)));
        assert!(namespaces(&NamespaceType::ALL).is_none());
    }

    #[test]
    fn realtime_policies_are_refused() {
        let p = realtime().compile().unwrap();
        let eperm = ret_value(EPERM);
        assert_eq!(native(&p, libc::SYS_sched_setscheduler, [0, 1, 0, 0, 0, 0]), eperm);
        assert_eq!(native(&p, libc::SYS_sched_setscheduler, [0, 0x4000_0002, 0, 0, 0, 0]), eperm);
        assert_eq!(
            native(&p, libc::SYS_sched_setscheduler, [0, 0, 0, 0, 0, 0]),
            ret_value(SyscallAction::Allow)
        );
    }

    #[test]
    fn write_execute_mappings_are_refused() {
        let p = mdwe().compile().unwrap();
        let rwx = (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64;
        let rw = (libc::PROT_READ | libc::PROT_WRITE) as u64;
        assert_eq!(native(&p, libc::SYS_mmap, [0, 4096, rwx, 0, 0, 0]), ret_value(EPERM));
        assert_eq!(native(&p, libc::SYS_mmap, [0, 4096, rw, 0, 0, 0]), ret_value(SyscallAction::Allow));
    }

    #[test]
    fn setid_files_cannot_be_created_through_open() {
        let p = suid_sgid().compile().unwrap();
        let eperm = ret_value(EPERM);
        let allow = ret_value(SyscallAction::Allow);
        let creat = (libc::O_CREAT | libc::O_WRONLY) as u64;
        let tmpfile = (libc::O_TMPFILE | libc::O_RDWR) as u64;
        let at = libc::AT_FDCWD as u64;

        assert_eq!(native(&p, libc::SYS_openat, [at, 0, creat, 0o4755, 0, 0]), eperm);
        assert_eq!(native(&p, libc::SYS_openat, [at, 0, creat, 0o2755, 0, 0]), eperm);
        assert_eq!(native(&p, libc::SYS_openat, [at, 0, tmpfile, 0o4700, 0, 0]), eperm);
        assert_eq!(native(&p, libc::SYS_openat, [at, 0, creat, 0o644, 0, 0]), allow);
        // Without O_CREAT the mode argument is garbage and must not matter.
        assert_eq!(native(&p, libc::SYS_openat, [at, 0, libc::O_RDONLY as u64, 0o4755, 0, 0]), allow);
        // O_DIRECTORY alone shares a bit with O_TMPFILE.
        assert_eq!(
            native(&p, libc::SYS_openat, [at, 0, libc::O_DIRECTORY as u64, 0o4755, 0, 0]),
            allow
        );
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(native(&p, libc::SYS_open, [0, creat, 0o6755, 0, 0, 0]), eperm);
            assert_eq!(native(&p, libc::SYS_open, [0, creat, 0o755, 0, 0, 0]), allow);
        }
        assert_eq!(native(&p, libc::SYS_openat2, [0; 6]), ret_value(errno(libc::ENOSYS)));
        assert_eq!(native(&p, libc::SYS_fchmod, [3, 0o4755, 0, 0, 0, 0]), eperm);
    }

    #[test]
    fn personality_is_locked() {
        let p = personality(0).compile().unwrap();
        assert_eq!(native(&p, libc::SYS_personality, [0xffff_ffff, 0, 0, 0, 0, 0]), ret_value(SyscallAction::Allow));
        assert_eq!(native(&p, libc::SYS_personality, [8, 0, 0, 0, 0, 0]), ret_value(EPERM));
    }
}
