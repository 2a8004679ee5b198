//! Seccomp-BPF filter compiler.
//!
//! A [`SyscallFilter`] is a default action plus an ordered list of rules,
//! each matching one syscall number and optionally one argument condition.
//! [`SyscallFilter::compile`] lowers it to classic BPF:
//!
//! ```text
//! ld  arch
//! jeq <secondary>  -> ret ALLOW          (per allowed secondary ABI)
//! jeq <native>     else ret <foreign>
//! ld  nr
//! jge 0x40000000   -> ret <foreign>      (x86-64 only: x32 calls)
//! { ld nr; jeq NR else next; <condition>; ret <action> }*
//! ret <default>
//! ```
//!
//! Only the low 32 bits of syscall arguments are inspected.

#![allow(clippy::missing_docs_in_private_items)]

use crate::context::SyscallAction;
use crate::sys::SockFilter;
use crate::{Error, Result};

const BPF_LD: u16 = 0x00;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_AND: u16 = 0x50;
const BPF_JA: u16 = 0x00;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
#[cfg(target_endian = "little")]
const OFFSET_ARGS: u32 = 16;
#[cfg(target_endian = "big")]
const OFFSET_ARGS: u32 = 20;

/// Kernel limit on program length (`BPF_MAXINSNS`).
pub const MAX_INSTRUCTIONS: usize = 4096;

/// Bit marking x32 syscall numbers on x86-64.
pub const X32_SYSCALL_BIT: u32 = 0x4000_0000;

/// `AUDIT_ARCH_X86_64`.
pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
/// `AUDIT_ARCH_I386`.
pub const AUDIT_ARCH_I386: u32 = 0x4000_0003;
/// `AUDIT_ARCH_AARCH64`.
pub const AUDIT_ARCH_AARCH64: u32 = 0xc000_00b7;
/// `AUDIT_ARCH_ARM`.
pub const AUDIT_ARCH_ARM: u32 = 0x4000_0028;

/// Audit token of the architecture this crate is built for.
#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH_NATIVE: u32 = AUDIT_ARCH_X86_64;
/// Audit token of the architecture this crate is built for.
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH_NATIVE: u32 = AUDIT_ARCH_AARCH64;

/// Seccomp return value for `action`.
pub const fn ret_value(action: SyscallAction) -> u32 {
    match action {
        SyscallAction::Allow => SECCOMP_RET_ALLOW,
        SyscallAction::Errno(e) => SECCOMP_RET_ERRNO | e as u32,
        SyscallAction::Log => SECCOMP_RET_LOG,
        SyscallAction::KillProcess => SECCOMP_RET_KILL_PROCESS,
    }
}

/// Condition on one syscall argument.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ArgCondition {
    /// `args[arg] == value`.
    Eq {
        /// Argument index.
        arg: u8,
        /// Expected value.
        value: u32,
    },
    /// `args[arg] & mask != 0`.
    MaskAny {
        /// Argument index.
        arg: u8,
        /// Bits of which any must be set.
        mask: u32,
    },
    /// `args[arg] & mask == mask`.
    MaskAll {
        /// Argument index.
        arg: u8,
        /// Bits that must all be set.
        mask: u32,
    },
    /// `args[arg]` is one of `values`.
    In {
        /// Argument index.
        arg: u8,
        /// Accepted values.
        values: Vec<u32>,
    },
    /// `args[arg]` is none of `values`.
    NotIn {
        /// Argument index.
        arg: u8,
        /// Rejected values.
        values: Vec<u32>,
    },
    /// Every inner condition holds.
    All(Vec<ArgCondition>),
}

/// One filter rule.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SyscallRule {
    /// Syscall number.
    pub nr: i64,
    /// Argument condition; `None` matches every call.
    pub condition: Option<ArgCondition>,
    /// What to do on a match.
    pub action: SyscallAction,
}

/// A syscall filter before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SyscallFilter {
    /// Action for calls no rule matches.
    pub default: SyscallAction,
    /// Action for calls made through a foreign ABI.
    pub foreign: SyscallAction,
    /// Foreign ABIs passed through unfiltered.
    pub secondary_arches: Vec<u32>,
    /// Rules, first match wins.
    pub rules: Vec<SyscallRule>,
}

impl SyscallFilter {
    /// Empty filter with `default` for every native call and foreign ABIs
    /// treated the same way.
    pub const fn new(default: SyscallAction) -> Self {
        Self {
            default,
            foreign: default,
            secondary_arches: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Sets the action for foreign ABIs.
    #[must_use]
    pub const fn with_foreign(mut self, action: SyscallAction) -> Self {
        self.foreign = action;
        self
    }

    /// Adds an unconditional rule.
    pub fn add(&mut self, nr: i64, action: SyscallAction) -> &mut Self {
        self.rules.push(SyscallRule {
            nr,
            condition: None,
            action,
        });
        self
    }

    /// Adds a conditional rule.
    pub fn add_if(&mut self, nr: i64, condition: ArgCondition, action: SyscallAction) -> &mut Self {
        self.rules.push(SyscallRule {
            nr,
            condition: Some(condition),
            action,
        });
        self
    }

    /// Adds an unconditional rule for each syscall `name` that exists on
    /// this architecture.
    pub fn add_named(&mut self, names: &[&str], action: SyscallAction) -> &mut Self {
        for nr in names.iter().filter_map(|n| super::syscalls::number(n)) {
            self.add(nr, action);
        }
        self
    }

    /// Action of the first unconditional rule for `nr`, or the default.
    pub fn action_for(&self, nr: i64) -> SyscallAction {
        self.rules
            .iter()
            .find(|r| r.nr == nr && r.condition.is_none())
            .map_or(self.default, |r| r.action)
    }

    /// Whether the filter lets every native call through unchanged.
    pub fn is_noop(&self) -> bool {
        self.default == SyscallAction::Allow
            && self.foreign == SyscallAction::Allow
            && self.rules.iter().all(|r| r.action == SyscallAction::Allow)
    }

    /// Lowers the filter to a BPF program.
    pub fn compile(&self) -> Result<Vec<SockFilter>> {
        let mut p = Vec::with_capacity(self.rules.len() * 3 + 8);

        p.push(stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
        for &arch in &self.secondary_arches {
            p.push(jump(BPF_JMP | BPF_JEQ | BPF_K, arch, 0, 1));
            p.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        }
        p.push(jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_NATIVE, 1, 0));
        p.push(stmt(BPF_RET | BPF_K, ret_value(self.foreign)));

        if cfg!(target_arch = "x86_64") {
            p.push(stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR));
            p.push(jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
            p.push(stmt(BPF_RET | BPF_K, ret_value(self.foreign)));
        }

        for rule in &self.rules {
            let body = rule_body(rule)?;
            let nr = u32::try_from(rule.nr).map_err(|_| Error::Config(format!("bad syscall number {}", rule.nr)))?;
            p.push(stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR));
            p.push(jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, offset(body.len())?));
            p.extend(body);
        }
        p.push(stmt(BPF_RET | BPF_K, ret_value(self.default)));

        if p.len() > MAX_INSTRUCTIONS {
            return Err(Error::Config(format!(
                "syscall filter needs {} instructions, limit is {MAX_INSTRUCTIONS}",
                p.len()
            )));
        }
        Ok(p)
    }
}

const fn stmt(code: u16, k: u32) -> SockFilter {
    SockFilter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

fn offset(n: usize) -> Result<u8> {
    u8::try_from(n).map_err(|_| Error::Config("syscall filter rule too large".into()))
}

/// Instructions following `jeq NR` for one rule. Falling off the end means
/// "no match"; every match ends in the rule's `ret`.
fn rule_body(rule: &SyscallRule) -> Result<Vec<SockFilter>> {
    let mut b = match &rule.condition {
        Some(cond) => condition_code(cond, 1)?,
        None => Vec::new(),
    };
    b.push(stmt(BPF_RET | BPF_K, ret_value(rule.action)));
    Ok(b)
}

/// Instructions checking `cond`. A match falls through to whatever follows;
/// a mismatch skips the `after` instructions that follow.
fn condition_code(cond: &ArgCondition, after: usize) -> Result<Vec<SockFilter>> {
    let load = |arg: u8| {
        if arg > 5 {
            return Err(Error::Config(format!("syscall argument {arg} out of range")));
        }
        Ok(stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS + 8 * u32::from(arg)))
    };
    let mut b = Vec::new();
    match cond {
        ArgCondition::Eq { arg, value } => {
            b.push(load(*arg)?);
            b.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *value, 0, offset(after)?));
        }
        ArgCondition::MaskAny { arg, mask } => {
            b.push(load(*arg)?);
            b.push(jump(BPF_JMP | BPF_JSET | BPF_K, *mask, 0, offset(after)?));
        }
        ArgCondition::MaskAll { arg, mask } => {
            b.push(load(*arg)?);
            b.push(stmt(BPF_ALU | BPF_AND | BPF_K, *mask));
            b.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *mask, 0, offset(after)?));
        }
        ArgCondition::In { arg, values } => {
            b.push(load(*arg)?);
            let m = values.len();
            for (j, v) in values.iter().enumerate() {
                b.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *v, offset(m - j)?, 0));
            }
            b.push(stmt(BPF_JMP | BPF_JA, u32::from(offset(after)?)));
        }
        ArgCondition::NotIn { arg, values } => {
            b.push(load(*arg)?);
            let m = values.len();
            for (j, v) in values.iter().enumerate() {
                b.push(jump(BPF_JMP | BPF_JEQ | BPF_K, *v, offset(m - 1 - j + after)?, 0));
            }
        }
        ArgCondition::All(conds) => {
            // Built back to front so each mismatch knows how far the end is.
            for c in conds.iter().rev() {
                let mut head = condition_code(c, b.len() + after)?;
                head.append(&mut b);
                b = head;
            }
        }
    }
    Ok(b)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Runs `program` against one simulated `seccomp_data`.
    pub(crate) fn run(program: &[SockFilter], arch: u32, nr: i64, args: [u64; 6]) -> u32 {
        let mut data = [0u8; 64];
        data[0..4].copy_from_slice(&(nr as u32).to_ne_bytes());
        data[4..8].copy_from_slice(&arch.to_ne_bytes());
        for (i, a) in args.iter().enumerate() {
            data[16 + 8 * i..24 + 8 * i].copy_from_slice(&a.to_ne_bytes());
        }
        let mut acc: u32 = 0;
        let mut pc = 0usize;
        loop {
            let ins = program[pc];
            pc += 1;
            match ins.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    let k = ins.k as usize;
                    acc = u32::from_ne_bytes(data[k..k + 4].try_into().unwrap());
                }
                c if c == BPF_ALU | BPF_AND | BPF_K => acc &= ins.k,
                c if c == BPF_JMP | BPF_JA => pc += ins.k as usize,
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    pc += usize::from(if acc == ins.k { ins.jt } else { ins.jf });
                }
                c if c == BPF_JMP | BPF_JGE | BPF_K => {
                    pc += usize::from(if acc >= ins.k { ins.jt } else { ins.jf });
                }
                c if c == BPF_JMP | BPF_JSET | BPF_K => {
                    pc += usize::from(if acc & ins.k != 0 { ins.jt } else { ins.jf });
                }
                c if c == BPF_RET | BPF_K => return ins.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    pub(crate) fn native(program: &[SockFilter], nr: i64, args: [u64; 6]) -> u32 {
        run(program, AUDIT_ARCH_NATIVE, nr, args)
    }

    const EPERM: SyscallAction = SyscallAction::Errno(1);

    #[test]
    fn default_applies_to_unmatched_calls() {
        let mut f = SyscallFilter::new(SyscallAction::Allow);
        f.add(libc::SYS_mount, EPERM);
        let p = f.compile().unwrap();
        assert_eq!(native(&p, libc::SYS_mount, [0; 6]), SECCOMP_RET_ERRNO | 1);
        assert_eq!(native(&p, libc::SYS_read, [0; 6]), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn foreign_arch_gets_foreign_action() {
        let f = SyscallFilter::new(SyscallAction::Allow).with_foreign(SyscallAction::KillProcess);
        let p = f.compile().unwrap();
        assert_eq!(run(&p, 0x1234_5678, libc::SYS_read, [0; 6]), SECCOMP_RET_KILL_PROCESS);
        assert_eq!(native(&p, libc::SYS_read, [0; 6]), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn secondary_arch_passes() {
        let mut f = SyscallFilter::new(SyscallAction::KillProcess);
        f.secondary_arches.push(AUDIT_ARCH_I386);
        let p = f.compile().unwrap();
        assert_eq!(run(&p, AUDIT_ARCH_I386, 5, [0; 6]), SECCOMP_RET_ALLOW);
        assert_eq!(run(&p, AUDIT_ARCH_ARM, 5, [0; 6]), SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn eq_and_masks() {
        let mut f = SyscallFilter::new(SyscallAction::Allow);
        f.add_if(libc::SYS_personality, ArgCondition::Eq { arg: 0, value: 8 }, EPERM);
        f.add_if(libc::SYS_fchmod, ArgCondition::MaskAny { arg: 1, mask: 0o6000 }, EPERM);
        f.add_if(libc::SYS_mmap, ArgCondition::MaskAll { arg: 2, mask: 0b110 }, EPERM);
        let p = f.compile().unwrap();

        let deny = SECCOMP_RET_ERRNO | 1;
        assert_eq!(native(&p, libc::SYS_personality, [8, 0, 0, 0, 0, 0]), deny);
        assert_eq!(native(&p, libc::SYS_personality, [0; 6]), SECCOMP_RET_ALLOW);
        assert_eq!(native(&p, libc::SYS_fchmod, [3, 0o4755, 0, 0, 0, 0]), deny);
        assert_eq!(native(&p, libc::SYS_fchmod, [3, 0o755, 0, 0, 0, 0]), SECCOMP_RET_ALLOW);
        assert_eq!(native(&p, libc::SYS_mmap, [0, 0, 0b111, 0, 0, 0]), deny);
        assert_eq!(native(&p, libc::SYS_mmap, [0, 0, 0b010, 0, 0, 0]), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn in_and_not_in() {
        let mut f = SyscallFilter::new(SyscallAction::Allow);
        f.add_if(libc::SYS_socket, ArgCondition::NotIn { arg: 0, values: vec![1, 2] }, EPERM);
        f.add_if(libc::SYS_sched_setscheduler, ArgCondition::In { arg: 1, values: vec![1, 2, 6] }, EPERM);
        let p = f.compile().unwrap();

        let deny = SECCOMP_RET_ERRNO | 1;
        for family in [1, 2] {
            assert_eq!(native(&p, libc::SYS_socket, [family, 0, 0, 0, 0, 0]), SECCOMP_RET_ALLOW);
        }
        assert_eq!(native(&p, libc::SYS_socket, [10, 0, 0, 0, 0, 0]), deny);
        for policy in [1, 2, 6] {
            assert_eq!(native(&p, libc::SYS_sched_setscheduler, [0, policy, 0, 0, 0, 0]), deny);
        }
        assert_eq!(native(&p, libc::SYS_sched_setscheduler, [0, 0, 0, 0, 0, 0]), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn all_requires_every_condition() {
        let mut f = SyscallFilter::new(SyscallAction::Allow);
        f.add_if(
            libc::SYS_openat,
            ArgCondition::All(vec![
                ArgCondition::MaskAny { arg: 2, mask: 0o100 },
                ArgCondition::In { arg: 3, values: vec![0o4755, 0o2755] },
            ]),
            EPERM,
        );
        f.add(libc::SYS_mount, EPERM);
        let p = f.compile().unwrap();

        let deny = SECCOMP_RET_ERRNO | 1;
        assert_eq!(native(&p, libc::SYS_openat, [0, 0, 0o100, 0o4755, 0, 0]), deny);
        assert_eq!(native(&p, libc::SYS_openat, [0, 0, 0o100, 0o755, 0, 0]), SECCOMP_RET_ALLOW);
        assert_eq!(native(&p, libc::SYS_openat, [0, 0, 0, 0o4755, 0, 0]), SECCOMP_RET_ALLOW);
        // A miss must land on the next rule, not inside it.
        assert_eq!(native(&p, libc::SYS_mount, [0; 6]), deny);
    }

    #[test]
    fn first_matching_rule_wins_and_misses_fall_through() {
        let mut f = SyscallFilter::new(SyscallAction::KillProcess);
        f.add_if(libc::SYS_socket, ArgCondition::Eq { arg: 0, value: 1 }, SyscallAction::Allow);
        f.add(libc::SYS_socket, EPERM);
        let p = f.compile().unwrap();
        assert_eq!(native(&p, libc::SYS_socket, [1, 0, 0, 0, 0, 0]), SECCOMP_RET_ALLOW);
        assert_eq!(native(&p, libc::SYS_socket, [2, 0, 0, 0, 0, 0]), SECCOMP_RET_ERRNO | 1);
        assert_eq!(native(&p, libc::SYS_read, [0; 6]), SECCOMP_RET_KILL_PROCESS);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x32_calls_are_foreign() {
        let f = SyscallFilter::new(SyscallAction::Allow).with_foreign(SyscallAction::Errno(38));
        let p = f.compile().unwrap();
        let x32_read = i64::from(X32_SYSCALL_BIT);
        assert_eq!(native(&p, x32_read, [0; 6]), SECCOMP_RET_ERRNO | 38);
    }

    #[test]
    fn oversized_program_is_rejected() {
        let mut f = SyscallFilter::new(SyscallAction::Allow);
        for _ in 0..MAX_INSTRUCTIONS {
            f.add(libc::SYS_read, EPERM);
        }
        assert!(matches!(f.compile(), Err(Error::Config(_))));
    }

    #[test]
    fn noop_detection() {
        assert!(SyscallFilter::new(SyscallAction::Allow).is_noop());
        let mut f = SyscallFilter::new(SyscallAction::Allow);
        f.add(libc::SYS_mount, EPERM);
        assert!(!f.is_noop());
        assert_eq!(f.action_for(libc::SYS_mount), EPERM);
        assert_eq!(f.action_for(libc::SYS_read), SyscallAction::Allow);
    }
}
