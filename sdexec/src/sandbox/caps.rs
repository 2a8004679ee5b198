//! Linux capability sets as 64-bit masks, with the name table from
//! `<linux/capability.h>`.

use std::fmt;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Capability names indexed by number.
const NAMES: [&str; 41] = [
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// `CAP_SETGID`.
pub const CAP_SETGID: u8 = 6;
/// `CAP_SETUID`.
pub const CAP_SETUID: u8 = 7;
/// `CAP_SETPCAP`.
pub const CAP_SETPCAP: u8 = 8;
/// `CAP_SYS_MODULE`.
pub const CAP_SYS_MODULE: u8 = 16;
/// `CAP_SYS_RAWIO`.
pub const CAP_SYS_RAWIO: u8 = 17;
/// `CAP_SYS_ADMIN`.
pub const CAP_SYS_ADMIN: u8 = 21;
/// `CAP_SYS_TIME`.
pub const CAP_SYS_TIME: u8 = 25;
/// `CAP_SYSLOG`.
pub const CAP_SYSLOG: u8 = 34;
/// `CAP_WAKE_ALARM`.
pub const CAP_WAKE_ALARM: u8 = 35;

/// Highest capability number the running kernel knows.
///
/// Falls back to the newest capability in the name table when
/// `/proc/sys/kernel/cap_last_cap` is unreadable.
pub fn last_cap() -> u8 {
    fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse::<u8>().ok())
        .filter(|&n| n < 64)
        .unwrap_or(40)
}

/// Looks up a capability by name. Accepts `CAP_` prefixed or bare names,
/// case-insensitively.
pub fn from_name(name: &str) -> Option<u8> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    };
    NAMES
        .iter()
        .position(|n| *n == full)
        .and_then(|i| u8::try_from(i).ok())
}

/// Name of capability `cap`, if known.
pub fn name(cap: u8) -> Option<&'static str> {
    NAMES.get(usize::from(cap)).copied()
}

/// A set of capabilities.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CapabilitySet(u64);

impl CapabilitySet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Builds a set from a raw mask.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw mask.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Every capability up to and including `last`.
    pub const fn all_up_to(last: u8) -> Self {
        if last >= 63 {
            Self(u64::MAX)
        } else {
            Self((1u64 << (last + 1)) - 1)
        }
    }

    /// Every capability the running kernel knows.
    pub fn all() -> Self {
        Self::all_up_to(last_cap())
    }

    /// Whether the set holds no capabilities.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `cap` is in the set.
    pub const fn contains(self, cap: u8) -> bool {
        cap < 64 && self.0 & (1 << cap) != 0
    }

    /// Returns the set with `cap` added.
    #[must_use]
    pub const fn with(self, cap: u8) -> Self {
        if cap < 64 { Self(self.0 | (1 << cap)) } else { self }
    }

    /// Returns the set with `cap` removed.
    #[must_use]
    pub const fn without(self, cap: u8) -> Self {
        if cap < 64 { Self(self.0 & !(1 << cap)) } else { self }
    }

    /// Union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Intersection of two sets.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Capability numbers in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0u8..64).filter(move |&c| self.contains(c))
    }

    /// Parses a list of names. A list whose first entry starts with `~`
    /// denotes the complement of the remaining names.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut invert = false;
        let mut set = Self::EMPTY;
        for (i, raw) in names.iter().enumerate() {
            let mut name = raw.as_ref().trim();
            if i == 0
                && let Some(rest) = name.strip_prefix('~')
            {
                invert = true;
                name = rest;
            }
            if name.is_empty() {
                continue;
            }
            let cap = from_name(name)
                .ok_or_else(|| Error::Config(format!("unknown capability {name:?}")))?;
            set = set.with(cap);
        }
        Ok(if invert {
            Self(!set.0).intersection(Self::all_up_to(40))
        } else {
            set
        })
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.iter().map(|c| name(c).unwrap_or("CAP_?")))
            .finish()
    }
}

impl TryFrom<Vec<String>> for CapabilitySet {
    type Error = Error;

    fn try_from(names: Vec<String>) -> Result<Self> {
        Self::parse(&names)
    }
}

impl From<CapabilitySet> for Vec<String> {
    fn from(set: CapabilitySet) -> Self {
        set.iter()
            .map(|c| name(c).map_or_else(|| format!("{c}"), str::to_owned))
            .collect()
    }
}
