//! Per-type managed directories (runtime, state, cache, logs,
//! configuration).
//!
//! Dynamic users get their state, cache and logs directories through a
//! `private/` indirection:
//!
//! ```text
//! /var/lib/private/      0700 root
//! /var/lib/private/db    owned by the dynamic uid
//! /var/lib/db -> private/db
//! ```
//!
//! The host sees the data behind a root-only parent, while the unit reaches
//! it through the symlink because its mount namespace replaces `private/`
//! with a permissive tmpfs holding only its own directories.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, chown, symlink};
use std::path::{Component, Path, PathBuf};

use nix::unistd::{Gid, Uid};

use super::{MountEntry, MountKind};
use crate::context::{DirectoryType, ExecContext};
use crate::error::{StageError, StageExt};
use crate::params::ExecParameters;
use crate::{Error, Result};

/// Name of the root-only parent of private directories.
const PRIVATE: &str = "private";

/// One directory the unit asked for, with its final host layout.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PreparedDirectory {
    /// Directory type.
    pub ty: DirectoryType,
    /// Prefix of the type, e.g. `/var/lib`.
    pub prefix: PathBuf,
    /// Path the unit uses and the environment exports.
    pub path: PathBuf,
    /// Where the data lives; equal to `path` unless private.
    pub physical: PathBuf,
    /// The `private/` parent, for private directories.
    pub private_root: Option<PathBuf>,
    /// Extra absolute symlinks pointing at `path`.
    pub symlinks: Vec<PathBuf>,
    /// Access mode.
    pub mode: u32,
    /// Only create; never fix up or export.
    pub only_create: bool,
}

impl PreparedDirectory {
    /// Whether the directory uses the `private/` indirection.
    pub const fn is_private(&self) -> bool {
        self.private_root.is_some()
    }
}

/// Relative paths only: no root, no `..`.
fn validate(rel: &Path) -> Result<()> {
    let ok = !rel.as_os_str().is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "directory {} must be relative and stay below its prefix",
            rel.display()
        )))
    }
}

/// Computes the layout of every configured directory without touching the
/// file system.
pub fn plan(ctx: &ExecContext, params: &ExecParameters) -> Result<Vec<PreparedDirectory>> {
    let mut out = Vec::new();
    for ty in DirectoryType::ALL {
        let Some(config) = ctx.directories.get(&ty) else {
            continue;
        };
        let prefix = params.prefix(ty);
        let private = ctx.dynamic_user && ty.supports_private();
        for item in &config.items {
            validate(&item.path)?;
            for link in &item.symlinks {
                validate(link)?;
            }
            let path = prefix.join(&item.path);
            let (physical, private_root) = if private {
                let root = prefix.join(PRIVATE);
                (root.join(&item.path), Some(root))
            } else {
                (path.clone(), None)
            };
            out.push(PreparedDirectory {
                ty,
                prefix: prefix.to_path_buf(),
                path,
                physical,
                private_root,
                symlinks: item.symlinks.iter().map(|l| prefix.join(l)).collect(),
                mode: config.mode,
                only_create: item.only_create,
            });
        }
    }
    Ok(out)
}

/// Paths whose owner makes a good uid suggestion for a dynamic user.
pub fn suggested_paths(dirs: &[PreparedDirectory]) -> Vec<PathBuf> {
    dirs.iter()
        .filter(|d| d.ty.supports_private())
        .map(|d| d.physical.clone())
        .collect()
}

/// `<TYPE>_DIRECTORY` variables: colon-joined exposed paths per type.
pub fn environment(dirs: &[PreparedDirectory]) -> Vec<(String, String)> {
    DirectoryType::ALL
        .into_iter()
        .filter_map(|ty| {
            let paths: Vec<String> = dirs
                .iter()
                .filter(|d| d.ty == ty && !d.only_create)
                .map(|d| d.path.to_string_lossy().into_owned())
                .collect();
            (!paths.is_empty()).then(|| (ty.env_name().to_owned(), paths.join(":")))
        })
        .collect()
}

/// Mount entries that make private directories reachable inside the
/// unit's mount namespace.
///
/// Each distinct `private/` parent is covered by a `0755` tmpfs and every
/// private directory is bound back onto its own path below it.
pub fn mount_entries(dirs: &[PreparedDirectory]) -> Vec<MountEntry> {
    let mut out: Vec<MountEntry> = Vec::new();
    for root in dirs.iter().filter_map(|d| d.private_root.as_ref()) {
        if !out.iter().any(|e| &e.destination == root) {
            out.push(MountEntry::tmpfs(root, "mode=0755"));
        }
    }
    for d in dirs {
        if d.is_private() {
            out.push(MountEntry::bind(&d.physical, &d.physical, false));
        } else {
            out.push(MountEntry::new(&d.physical, MountKind::ReadWrite));
        }
    }
    out
}

/// Symlink target for `path` pointing at `physical` below `private_root`,
/// relative to `path`'s parent.
fn private_link_target(path: &Path, private_root: &Path, physical: &Path) -> PathBuf {
    let prefix = private_root.parent().unwrap_or_else(|| Path::new("/"));
    let rel = path.strip_prefix(prefix).unwrap_or(path);
    let depth = rel.components().count().saturating_sub(1);
    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }
    target.push(PRIVATE);
    target.push(physical.strip_prefix(private_root).unwrap_or(physical));
    target
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_dir())
}

/// Points `link` at `target`, replacing a stale symlink.
fn ensure_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if is_symlink(link) {
        if fs::read_link(link)? == target {
            return Ok(());
        }
        fs::remove_file(link)?;
    }
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    symlink(target, link)
}

/// Creates `dir` (and missing parents). Returns whether it was created.
fn create_dir(dir: &Path, mode: u32) -> io::Result<bool> {
    if is_real_dir(dir) {
        return Ok(false);
    }
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent)?;
    }
    DirBuilder::new().mode(mode).create(dir)?;
    Ok(true)
}

/// Moves a plain directory into `private/` or back, whichever the current
/// layout calls for.
fn migrate(d: &PreparedDirectory) -> io::Result<()> {
    match &d.private_root {
        Some(_) => {
            if is_real_dir(&d.path) && !d.physical.exists() {
                if let Some(parent) = d.physical.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&d.path, &d.physical)?;
                tracing::info!(
                    from = %d.path.display(),
                    to = %d.physical.display(),
                    "moved directory into private area"
                );
            }
        }
        None => {
            let rel = d.path.strip_prefix(&d.prefix).unwrap_or(&d.path);
            let former = d.prefix.join(PRIVATE).join(rel);
            if is_symlink(&d.path) && is_real_dir(&former) {
                fs::remove_file(&d.path)?;
                fs::rename(&former, &d.path)?;
                tracing::info!(
                    from = %former.display(),
                    to = %d.path.display(),
                    "moved directory out of private area"
                );
            }
        }
    }
    Ok(())
}

fn prepare_one(d: &PreparedDirectory, uid: Uid, gid: Gid) -> Result<()> {
    if let Some(root) = &d.private_root {
        DirBuilder::new().recursive(true).mode(0o700).create(root)?;
        fs::set_permissions(root, fs::Permissions::from_mode(0o700))?;
    }
    migrate(d)?;

    let created = create_dir(&d.physical, d.mode)?;
    if created || !d.only_create {
        fs::set_permissions(&d.physical, fs::Permissions::from_mode(d.mode))?;
        // Configuration stays owned by the manager.
        if d.ty != DirectoryType::Configuration
            && (uid != Uid::effective() || gid != Gid::effective())
        {
            chown(&d.physical, Some(uid.as_raw()), Some(gid.as_raw()))?;
        }
    }

    if let Some(root) = &d.private_root {
        ensure_symlink(&private_link_target(&d.path, root, &d.physical), &d.path)?;
    }
    for link in &d.symlinks {
        ensure_symlink(&d.path, link)?;
    }
    Ok(())
}

/// Creates every directory, owned by `uid`/`gid`, failing with the exit
/// status of the first type that cannot be set up.
pub fn prepare(dirs: &[PreparedDirectory], uid: Uid, gid: Gid) -> std::result::Result<(), StageError> {
    for d in dirs {
        tracing::debug!(ty = ?d.ty, path = %d.path.display(), private = d.is_private(), "preparing directory");
        prepare_one(d, uid, gid).status(d.ty.exit_status())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DirectoryConfig, DirectoryItem};

    fn ctx_with(ty: DirectoryType, items: Vec<DirectoryItem>, dynamic: bool) -> ExecContext {
        let mut ctx = ExecContext {
            dynamic_user: dynamic,
            ..ExecContext::default()
        };
        ctx.directories.insert(
            ty,
            DirectoryConfig {
                mode: 0o750,
                items,
            },
        );
        ctx
    }

    fn params_at(ty: DirectoryType, prefix: &Path) -> ExecParameters {
        let mut p = ExecParameters::new();
        p.prefixes.insert(ty, prefix.to_path_buf());
        p
    }

    fn me() -> (Uid, Gid) {
        (Uid::effective(), Gid::effective())
    }

    #[test]
    fn dynamic_state_directory_goes_private() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx_with(DirectoryType::State, vec![DirectoryItem::new("db")], true);
        let params = params_at(DirectoryType::State, tmp.path());
        let dirs = plan(&ctx, &params).unwrap();
        let (uid, gid) = me();
        prepare(&dirs, uid, gid).unwrap();

        let private = tmp.path().join("private");
        let mode = fs::metadata(&private).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        assert!(tmp.path().join("private/db").is_dir());
        assert_eq!(fs::read_link(tmp.path().join("db")).unwrap(), Path::new("private/db"));

        let env = environment(&dirs);
        assert_eq!(env, [(
            "STATE_DIRECTORY".to_owned(),
            tmp.path().join("db").to_string_lossy().into_owned()
        )]);
    }

    #[test]
    fn nested_private_link_climbs_out() {
        let target = private_link_target(
            Path::new("/var/lib/a/b"),
            Path::new("/var/lib/private"),
            Path::new("/var/lib/private/a/b"),
        );
        assert_eq!(target, Path::new("../private/a/b"));
    }

    #[test]
    fn existing_directory_migrates_both_ways() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("db")).unwrap();
        fs::write(tmp.path().join("db/data"), "keep").unwrap();
        let (uid, gid) = me();

        let ctx = ctx_with(DirectoryType::State, vec![DirectoryItem::new("db")], true);
        let params = params_at(DirectoryType::State, tmp.path());
        prepare(&plan(&ctx, &params).unwrap(), uid, gid).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("private/db/data")).unwrap(), "keep");
        assert!(is_symlink(&tmp.path().join("db")));

        let ctx = ctx_with(DirectoryType::State, vec![DirectoryItem::new("db")], false);
        prepare(&plan(&ctx, &params).unwrap(), uid, gid).unwrap();
        assert!(is_real_dir(&tmp.path().join("db")));
        assert_eq!(fs::read_to_string(tmp.path().join("db/data")).unwrap(), "keep");
        assert!(!tmp.path().join("private/db").exists());
    }

    #[test]
    fn runtime_directories_never_go_private() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx_with(DirectoryType::Runtime, vec![DirectoryItem::new("svc")], true);
        let dirs = plan(&ctx, &params_at(DirectoryType::Runtime, tmp.path())).unwrap();
        assert!(!dirs[0].is_private());
        assert_eq!(mount_entries(&dirs)[0].kind, MountKind::ReadWrite);
    }

    #[test]
    fn only_create_is_not_exported_and_symlinks_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let mut item = DirectoryItem::new("logs");
        item.only_create = true;
        let mut linked = DirectoryItem::new("app");
        linked.symlinks = vec!["app-compat".into()];
        let ctx = ctx_with(DirectoryType::Logs, vec![item, linked], false);
        let dirs = plan(&ctx, &params_at(DirectoryType::Logs, tmp.path())).unwrap();
        let (uid, gid) = me();
        prepare(&dirs, uid, gid).unwrap();

        let env = environment(&dirs);
        assert_eq!(env.len(), 1);
        assert!(env[0].1.ends_with("/app"));
        assert!(!env[0].1.contains(':'));
        assert!(tmp.path().join("app-compat").is_dir());
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let ctx = ctx_with(DirectoryType::Cache, vec![DirectoryItem::new("../etc")], false);
        assert!(plan(&ctx, &ExecParameters::new()).is_err());
        let ctx = ctx_with(DirectoryType::Cache, vec![DirectoryItem::new("/abs")], false);
        assert!(plan(&ctx, &ExecParameters::new()).is_err());
    }

    #[test]
    fn private_mounts_cover_parent_once() {
        let ctx = ctx_with(
            DirectoryType::State,
            vec![DirectoryItem::new("a"), DirectoryItem::new("b")],
            true,
        );
        let dirs = plan(&ctx, &ExecParameters::new()).unwrap();
        let entries = mount_entries(&dirs);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].destination, Path::new("/var/lib/private"));
        assert!(matches!(entries[0].kind, MountKind::Tmpfs(_)));
        assert_eq!(entries[1].source.as_deref(), Some(Path::new("/var/lib/private/a")));
    }
}
