//! Per-unit resources shared by successive executions of the same unit.
//!
//! An [`ExecRuntime`] holds the private `/tmp` pair and the two storage
//! socket pairs used to hand the unit's network and IPC namespace from one
//! process to the next. [`RuntimeRegistry`] refcounts them by unit id.

use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use nix::sched::{CloneFlags, setns, unshare};

use crate::context::ExecContext;
use crate::error::ErrnoExt;
use crate::{Result, sys};

/// A socket pair parking one namespace descriptor between executions.
#[derive(Debug)]
pub struct NamespaceStorage {
    /// Receive side.
    rx: OwnedFd,
    /// Send side.
    tx: OwnedFd,
}

impl NamespaceStorage {
    /// Creates an empty storage.
    pub fn new() -> Result<Self> {
        let (rx, tx) = sys::socketpair_dgram()?;
        Ok(Self { rx, tx })
    }

    /// Joins the stored namespace of type `flag`, or creates one and
    /// stores it for the next execution. Returns whether a new namespace
    /// was created.
    pub fn enter(&self, flag: CloneFlags, proc_name: &str) -> Result<bool> {
        if let Some(ns) = sys::recv_fd(self.rx.as_fd())? {
            let joined = setns(&ns, flag).op("setns");
            sys::send_fd(self.tx.as_fd(), ns.as_fd())?;
            joined?;
            return Ok(false);
        }
        unshare(flag).op("unshare")?;
        let ns = fs::File::open(format!("/proc/self/ns/{proc_name}"))?;
        sys::send_fd(self.tx.as_fd(), ns.as_fd())?;
        Ok(true)
    }

    /// Both descriptors, for the descriptor sweep.
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.rx.as_raw_fd(), self.tx.as_raw_fd()]
    }
}

/// Shared per-unit resources.
#[derive(Debug)]
#[non_exhaustive]
pub struct ExecRuntime {
    /// Unit the runtime belongs to.
    pub unit: String,
    /// Private `/tmp` replacement.
    pub tmp_dir: Option<PathBuf>,
    /// Private `/var/tmp` replacement.
    pub var_tmp_dir: Option<PathBuf>,
    /// Network namespace storage.
    pub netns: Option<NamespaceStorage>,
    /// IPC namespace storage.
    pub ipcns: Option<NamespaceStorage>,
}

impl ExecRuntime {
    /// Creates the resources `ctx` needs, with temp directories below
    /// `tmp_root`. Returns `None` when it needs none.
    pub fn create(unit: &str, ctx: &ExecContext, tmp_root: &Path) -> Result<Option<Self>> {
        Self::create_with(unit, ctx, tmp_root, NamespaceStorage::new)
    }

    /// [`create`](Self::create) with the namespace storage constructor
    /// passed in. Temp directories made before a failure are removed.
    fn create_with(
        unit: &str,
        ctx: &ExecContext,
        tmp_root: &Path,
        storage: fn() -> Result<NamespaceStorage>,
    ) -> Result<Option<Self>> {
        if !ctx.private_tmp && !ctx.private_network && !ctx.private_ipc {
            return Ok(None);
        }
        let mut made = Vec::new();
        let built = make_parts(unit, ctx, tmp_root, storage, &mut made);
        match built {
            Ok((netns, ipcns)) => {
                let mut dirs = made.into_iter();
                Ok(Some(Self {
                    unit: unit.to_owned(),
                    tmp_dir: dirs.next(),
                    var_tmp_dir: dirs.next(),
                    netns,
                    ipcns,
                }))
            }
            Err(e) => {
                remove_roots(made.iter().filter_map(|d| d.parent()));
                Err(e)
            }
        }
    }

    /// The `/tmp`, `/var/tmp` pair, when private.
    pub fn tmp_dirs(&self) -> Option<(&Path, &Path)> {
        Some((self.tmp_dir.as_deref()?, self.var_tmp_dir.as_deref()?))
    }

    /// Temp directory roots (the parents holding the sticky `tmp/`).
    fn tmp_roots(&self) -> impl Iterator<Item = &Path> {
        [&self.tmp_dir, &self.var_tmp_dir]
            .into_iter()
            .flatten()
            .filter_map(|d| d.parent())
    }
}

/// `<root>/sdexec-private-<unit>-XXXXXX/tmp`: `0700` outside, sticky and
/// world-writable inside.
fn make_private_tmp(unit: &str, root: &Path) -> Result<PathBuf> {
    let outer = tempfile::Builder::new()
        .prefix(&format!("sdexec-private-{unit}-"))
        .tempdir_in(root)?;
    fs::set_permissions(outer.path(), fs::Permissions::from_mode(0o700))?;
    let inner = outer.path().join("tmp");
    fs::create_dir(&inner)?;
    fs::set_permissions(&inner, fs::Permissions::from_mode(0o1777))?;
    // Only kept once fully set up; an early return removes it on drop.
    let _ = outer.keep();
    Ok(inner)
}

/// Temp directories (pushed to `made` as they appear) and namespace
/// storages of a new runtime.
fn make_parts(
    unit: &str,
    ctx: &ExecContext,
    tmp_root: &Path,
    storage: fn() -> Result<NamespaceStorage>,
    made: &mut Vec<PathBuf>,
) -> Result<(Option<NamespaceStorage>, Option<NamespaceStorage>)> {
    if ctx.private_tmp {
        made.push(make_private_tmp(unit, tmp_root)?);
        made.push(make_private_tmp(unit, tmp_root)?);
    }
    let netns = ctx.private_network.then(storage).transpose()?;
    let ipcns = ctx.private_ipc.then(storage).transpose()?;
    Ok((netns, ipcns))
}

/// Removes private temp directory roots, logging what cannot be removed.
fn remove_roots<'a>(roots: impl IntoIterator<Item = &'a Path>) {
    for root in roots {
        if let Err(e) = fs::remove_dir_all(root) {
            tracing::warn!(path = %root.display(), error = %e, "cannot remove private temp directory");
        }
    }
}

/// Refcounted table entry.
#[derive(Debug)]
struct Entry {
    /// The shared runtime.
    runtime: Arc<ExecRuntime>,
    /// Outstanding acquisitions.
    refs: usize,
}

/// All live runtimes, by unit id.
#[derive(Debug)]
pub struct RuntimeRegistry {
    /// Where private temp directories are created.
    tmp_root: PathBuf,
    /// Entries; every refcount or temp-dir change happens under this lock.
    entries: Mutex<HashMap<String, Entry>>,
}

impl RuntimeRegistry {
    /// Empty registry creating temp directories below `tmp_root`.
    pub fn new(tmp_root: impl Into<PathBuf>) -> Self {
        Self {
            tmp_root: tmp_root.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the runtime of `unit`, creating it if `create` is set and
    /// `ctx` needs one.
    pub fn acquire(&self, unit: &str, ctx: &ExecContext, create: bool) -> Result<Option<Arc<ExecRuntime>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(unit) {
            entry.refs += 1;
            return Ok(Some(Arc::clone(&entry.runtime)));
        }
        if !create {
            return Ok(None);
        }
        let Some(runtime) = ExecRuntime::create(unit, ctx, &self.tmp_root)? else {
            return Ok(None);
        };
        let runtime = Arc::new(runtime);
        tracing::debug!(unit, tmp = ?runtime.tmp_dir, "runtime created");
        entries.insert(
            unit.to_owned(),
            Entry {
                runtime: Arc::clone(&runtime),
                refs: 1,
            },
        );
        Ok(Some(runtime))
    }

    /// Gives back one reference. The last release with `destroy` drops the
    /// runtime and removes its temp directories in the background.
    ///
    /// Returns the cleanup thread, if one was started.
    pub fn release(&self, runtime: Arc<ExecRuntime>, destroy: bool) -> Option<thread::JoinHandle<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let unit = runtime.unit.clone();
        let entry = entries.get_mut(&unit)?;
        if !Arc::ptr_eq(&entry.runtime, &runtime) {
            tracing::debug!(unit, "release of a runtime that was already replaced");
            return None;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 || !destroy {
            return None;
        }
        entries.remove(&unit);
        drop(entries);

        let roots: Vec<PathBuf> = runtime.tmp_roots().map(Path::to_path_buf).collect();
        // Storage sockets close with the last Arc.
        drop(runtime);
        if roots.is_empty() {
            return None;
        }
        tracing::debug!(unit, "removing private temp directories");
        Some(thread::spawn(move || remove_roots(roots.iter().map(PathBuf::as_path))))
    }

    /// Number of outstanding references to `unit`'s runtime.
    pub fn refs(&self, unit: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit)
            .map_or(0, |e| e.refs)
    }
}
