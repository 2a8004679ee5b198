//! Resource limits, scheduling priority and OOM score.

use std::collections::BTreeMap;
use std::fs;

use nix::sys::resource::{Resource, setrlimit};
use serde::{Deserialize, Serialize};

use crate::error::ErrnoExt;
use crate::{Result, sys};

/// A `setrlimit(2)` resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ResourceKind {
    /// CPU time in seconds.
    Cpu,
    /// Largest file size.
    Fsize,
    /// Data segment size.
    Data,
    /// Stack size.
    Stack,
    /// Core file size.
    Core,
    /// Resident set size.
    Rss,
    /// Number of processes.
    Nproc,
    /// Number of open files.
    Nofile,
    /// Locked memory.
    Memlock,
    /// Address space size.
    As,
    /// File locks.
    Locks,
    /// Pending signals.
    Sigpending,
    /// POSIX message queue bytes.
    Msgqueue,
    /// Nice ceiling.
    Nice,
    /// Realtime priority ceiling.
    Rtprio,
    /// Realtime CPU time in microseconds.
    Rttime,
}

impl ResourceKind {
    const fn resource(self) -> Resource {
        match self {
            Self::Cpu => Resource::RLIMIT_CPU,
            Self::Fsize => Resource::RLIMIT_FSIZE,
            Self::Data => Resource::RLIMIT_DATA,
            Self::Stack => Resource::RLIMIT_STACK,
            Self::Core => Resource::RLIMIT_CORE,
            Self::Rss => Resource::RLIMIT_RSS,
            Self::Nproc => Resource::RLIMIT_NPROC,
            Self::Nofile => Resource::RLIMIT_NOFILE,
            Self::Memlock => Resource::RLIMIT_MEMLOCK,
            Self::As => Resource::RLIMIT_AS,
            Self::Locks => Resource::RLIMIT_LOCKS,
            Self::Sigpending => Resource::RLIMIT_SIGPENDING,
            Self::Msgqueue => Resource::RLIMIT_MSGQUEUE,
            Self::Nice => Resource::RLIMIT_NICE,
            Self::Rtprio => Resource::RLIMIT_RTPRIO,
            Self::Rttime => Resource::RLIMIT_RTTIME,
        }
    }
}

/// Soft and hard value of one limit. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ResourceLimit {
    /// Soft limit.
    pub soft: Option<u64>,
    /// Hard limit.
    pub hard: Option<u64>,
}

impl ResourceLimit {
    /// Same value for soft and hard.
    pub const fn fixed(value: u64) -> Self {
        Self {
            soft: Some(value),
            hard: Some(value),
        }
    }

    /// `(soft, hard)` as raw `rlim_t`, with the soft value clamped to the hard.
    pub fn raw(self) -> (libc::rlim_t, libc::rlim_t) {
        let conv = |v: Option<u64>| v.map_or(libc::RLIM_INFINITY, |v| v as libc::rlim_t);
        let hard = conv(self.hard);
        (conv(self.soft).min(hard), hard)
    }
}

/// Applies every limit in the table.
pub fn apply(limits: &BTreeMap<ResourceKind, ResourceLimit>) -> Result<()> {
    for (kind, limit) in limits {
        let (soft, hard) = limit.raw();
        tracing::debug!(?kind, soft, hard, "setrlimit");
        setrlimit(kind.resource(), soft, hard).op("setrlimit")?;
    }
    Ok(())
}

/// Sets the scheduling priority of the calling process.
pub fn set_nice(nice: i32) -> Result<()> {
    Ok(sys::set_nice(nice)?)
}

/// Writes `/proc/self/oom_score_adj`.
pub fn set_oom_score_adjust(score: i32) -> Result<()> {
    fs::write("/proc/self/oom_score_adj", format!("{score}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_is_clamped_to_hard() {
        let lim = ResourceLimit {
            soft: Some(4096),
            hard: Some(1024),
        };
        assert_eq!(lim.raw(), (1024, 1024));
    }

    #[test]
    fn missing_values_are_infinite() {
        assert_eq!(
            ResourceLimit::default().raw(),
            (libc::RLIM_INFINITY, libc::RLIM_INFINITY)
        );
        let lim = ResourceLimit {
            soft: Some(10),
            hard: None,
        };
        assert_eq!(lim.raw(), (10, libc::RLIM_INFINITY));
    }

    #[test]
    fn lowering_a_soft_limit_needs_no_privilege() {
        let (_, hard) = nix::sys::resource::getrlimit(Resource::RLIMIT_CORE).unwrap();
        let mut table = BTreeMap::new();
        table.insert(
            ResourceKind::Core,
            ResourceLimit {
                soft: Some(0),
                hard: (hard != libc::RLIM_INFINITY).then_some(hard),
            },
        );
        apply(&table).unwrap();
        let (soft, _) = nix::sys::resource::getrlimit(Resource::RLIMIT_CORE).unwrap();
        assert_eq!(soft, 0);
    }

    #[test]
    fn kinds_deserialize_as_map_keys() {
        let table: BTreeMap<ResourceKind, ResourceLimit> =
            serde_json::from_str(r#"{ "nofile": { "soft": 1024, "hard": 4096 } }"#).unwrap();
        assert_eq!(table[&ResourceKind::Nofile].hard, Some(4096));
    }
}
