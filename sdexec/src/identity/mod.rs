//! Identity resolution: turns user/group selectors into numeric ids and a
//! supplementary group list.

mod dynamic;
mod transition;
mod userns;

use std::ffi::CString;
use std::path::PathBuf;

use nix::unistd::{Gid, Group, Uid, User, getgrouplist};

pub use dynamic::{DYNAMIC_UID_MAX, DYNAMIC_UID_MIN, DynamicCreds, DynamicUserPool};
pub use transition::{Caller, IdentityTransition, Retain, SECBIT_KEEP_CAPS, TransitionStep};
pub use userns::{setgroups_allowed, setup_private_users, uid_map};

use crate::context::ExecContext;
use crate::error::ErrnoExt;
use crate::{Error, Result};

/// Shell given to users that must not log in.
const NOLOGIN: &str = "/usr/sbin/nologin";

/// Concrete identity the program will run under.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResolvedIdentity {
    /// User name, when a user was selected.
    pub user_name: Option<String>,
    /// Target uid.
    pub uid: Uid,
    /// Target primary gid.
    pub gid: Gid,
    /// Supplementary groups, deduplicated.
    pub groups: Vec<Gid>,
    /// Home directory.
    pub home: PathBuf,
    /// Login shell.
    pub shell: PathBuf,
}

impl ResolvedIdentity {
    /// Identity of the calling process with no user selected.
    pub fn current() -> Self {
        Self {
            user_name: None,
            uid: Uid::current(),
            gid: Gid::current(),
            groups: Vec::new(),
            home: "/".into(),
            shell: "/bin/sh".into(),
        }
    }
}

/// Resolves the identity selected by `ctx`.
///
/// `suggested` lists paths whose current owner is a good candidate uid for a
/// dynamic user; `ngroups_max` is the kernel group limit.
pub fn resolve(
    ctx: &ExecContext,
    dynamic: Option<&DynamicCreds>,
    suggested: &[PathBuf],
    ngroups_max: usize,
) -> Result<ResolvedIdentity> {
    let mut id = if ctx.dynamic_user {
        let creds = dynamic.ok_or_else(|| {
            Error::Identity("dynamic user requested but no allocator given".into())
        })?;
        let (uid, gid) = creds.realize(suggested)?;
        ResolvedIdentity {
            user_name: Some(creds.user_name().to_owned()),
            uid,
            gid,
            groups: Vec::new(),
            home: "/".into(),
            shell: NOLOGIN.into(),
        }
    } else if let Some(spec) = ctx.user.as_deref() {
        let mut id = lookup_user(spec)?;
        if let Some(group) = ctx.group.as_deref() {
            id.gid = lookup_group(group)?;
        }
        id
    } else {
        let mut id = ResolvedIdentity::current();
        if let Some(group) = ctx.group.as_deref() {
            id.gid = lookup_group(group)?;
        }
        id
    };

    let member_of = match id.user_name.as_deref() {
        Some(name) if !id.uid.is_root() && !ctx.dynamic_user => {
            let cname = CString::new(name)?;
            getgrouplist(&cname, id.gid).op("getgrouplist")?
        }
        _ => Vec::new(),
    };
    let declared = ctx
        .supplementary_groups
        .iter()
        .map(|g| lookup_group(g))
        .collect::<Result<Vec<_>>>()?;

    id.groups = merge_groups(&[&member_of, &declared], ngroups_max)?;
    tracing::debug!(
        uid = id.uid.as_raw(),
        gid = id.gid.as_raw(),
        groups = id.groups.len(),
        "identity resolved"
    );
    Ok(id)
}

/// Resolves a user by name or numeric uid.
///
/// `root` and `0` never touch NSS.
pub fn lookup_user(spec: &str) -> Result<ResolvedIdentity> {
    if matches!(spec, "root" | "0") {
        return Ok(ResolvedIdentity {
            user_name: Some("root".into()),
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            groups: Vec::new(),
            home: "/root".into(),
            shell: "/bin/sh".into(),
        });
    }
    let user = if let Ok(n) = spec.parse::<u32>() {
        match User::from_uid(Uid::from_raw(n)).op("getpwuid")? {
            Some(u) => u,
            None => {
                return Ok(ResolvedIdentity {
                    user_name: Some(spec.to_owned()),
                    uid: Uid::from_raw(n),
                    gid: Gid::from_raw(n),
                    groups: Vec::new(),
                    home: "/".into(),
                    shell: NOLOGIN.into(),
                });
            }
        }
    } else {
        User::from_name(spec)
            .op("getpwnam")?
            .ok_or_else(|| Error::Identity(format!("unknown user {spec:?}")))?
    };
    Ok(ResolvedIdentity {
        user_name: Some(user.name),
        uid: user.uid,
        gid: user.gid,
        groups: Vec::new(),
        home: user.dir,
        shell: user.shell,
    })
}

/// Resolves a group by name or numeric gid.
pub fn lookup_group(spec: &str) -> Result<Gid> {
    if matches!(spec, "root" | "0") {
        return Ok(Gid::from_raw(0));
    }
    if let Ok(n) = spec.parse::<u32>() {
        return Ok(Gid::from_raw(n));
    }
    Group::from_name(spec)
        .op("getgrnam")?
        .map(|g| g.gid)
        .ok_or_else(|| Error::Identity(format!("unknown group {spec:?}")))
}

/// Concatenates group lists, dropping duplicates and keeping first-seen
/// order.
///
/// Fails with [`Error::TooManyGroups`] instead of truncating.
pub fn merge_groups(sets: &[&[Gid]], max: usize) -> Result<Vec<Gid>> {
    let mut out: Vec<Gid> = Vec::new();
    for gid in sets.iter().flat_map(|s| s.iter()) {
        if !out.contains(gid) {
            out.push(*gid);
        }
    }
    if out.len() > max {
        return Err(Error::TooManyGroups {
            count: out.len(),
            max,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gids(v: &[u32]) -> Vec<Gid> {
        v.iter().copied().map(Gid::from_raw).collect()
    }

    #[test]
    fn merge_dedups_in_first_seen_order() {
        let a = gids(&[10, 20, 30]);
        let b = gids(&[30, 5, 10]);
        assert_eq!(merge_groups(&[&a, &b], 8).unwrap(), gids(&[10, 20, 30, 5]));
    }

    #[test]
    fn merge_is_idempotent() {
        let a = gids(&[1, 2, 3]);
        let once = merge_groups(&[&a, &a], 8).unwrap();
        let twice = merge_groups(&[&once, &once], 8).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_over_limit_fails_without_partial_result() {
        let a = gids(&[1, 2, 3]);
        let b = gids(&[4]);
        match merge_groups(&[&a, &b], 3) {
            Err(Error::TooManyGroups { count: 4, max: 3 }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(merge_groups(&[&a, &a], 3).unwrap().len(), 3);
    }

    #[test]
    fn root_resolves_without_nss() {
        let id = lookup_user("root").unwrap();
        assert!(id.uid.is_root());
        assert_eq!(id.home, PathBuf::from("/root"));
        assert_eq!(lookup_group("0").unwrap(), Gid::from_raw(0));
    }

    #[test]
    fn numeric_user_without_passwd_entry() {
        let id = lookup_user("4000123").unwrap();
        assert_eq!(id.uid.as_raw(), 4_000_123);
        assert_eq!(id.gid.as_raw(), 4_000_123);
    }

    #[test]
    fn unknown_names_are_identity_errors() {
        assert!(matches!(
            lookup_user("no-such-user-sdexec"),
            Err(Error::Identity(_))
        ));
        assert!(matches!(
            lookup_group("no-such-group-sdexec"),
            Err(Error::Identity(_))
        ));
    }

    #[test]
    fn nobody_gets_primary_group() {
        let Some(nobody) = User::from_name("nobody").unwrap() else {
            return;
        };
        let ctx = ExecContext {
            user: Some("nobody".into()),
            ..ExecContext::default()
        };
        let id = resolve(&ctx, None, &[], 65_536).unwrap();
        assert_eq!(id.uid, nobody.uid);
        assert_eq!(id.gid, nobody.gid);
    }

    #[test]
    fn declared_groups_are_merged() {
        let ctx = ExecContext {
            supplementary_groups: vec!["0".into(), "0".into(), "4000".into()],
            ..ExecContext::default()
        };
        let id = resolve(&ctx, None, &[], 65_536).unwrap();
        assert_eq!(id.groups, gids(&[0, 4000]));

        assert!(matches!(
            resolve(&ctx, None, &[], 1),
            Err(Error::TooManyGroups { .. })
        ));
    }

    #[test]
    fn dynamic_user_requires_allocator() {
        let ctx = ExecContext {
            dynamic_user: true,
            ..ExecContext::default()
        };
        assert!(matches!(
            resolve(&ctx, None, &[], 65_536),
            Err(Error::Identity(_))
        ));
    }
}
