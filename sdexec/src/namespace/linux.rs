//! [`NamespaceSetup`] on the host kernel: `unshare`, `mount(2)` and
//! `symlink(2)`.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};

use super::{MountEntry, MountKind, NamespacePlan, NamespaceSetup};
use crate::error::ErrnoExt;
use crate::{Error, Result, sys};

/// File system types tried, in order, when mounting a root image.
const IMAGE_FS_TYPES: [&str; 5] = ["ext4", "erofs", "squashfs", "xfs", "btrfs"];

/// Device nodes copied into a private `/dev`.
const DEV_NODES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];

/// Default [`NamespaceSetup`].
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct LinuxNamespaceSetup;

/// `/proc/self/fd/N` for a pre-opened source.
fn fd_path(fd: &OwnedFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

/// Opens `path` with `O_PATH` so it stays reachable after being
/// overmounted.
fn open_path(path: &Path) -> io::Result<OwnedFd> {
    let f = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
        .open(path)?;
    Ok(OwnedFd::from(f))
}

fn bind(source: &Path, target: &Path, recursive: bool) -> Result<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>).op("mount(MS_BIND)")
}

fn remount(target: &Path, read_only: bool) -> Result<()> {
    remount_keeping(target, read_only, MsFlags::empty()).op("mount(MS_REMOUNT)")
}

fn remount_keeping(target: &Path, read_only: bool, keep: MsFlags) -> nix::Result<()> {
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | keep;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
}

/// A mount from `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountPoint {
    path: PathBuf,
    read_only: bool,
    /// Per-mount flags a bind remount must repeat or the kernel clears them.
    keep: MsFlags,
}

/// Mounts at or below `target`, in mountinfo order. A path mounted over
/// several times appears once, with the options of the topmost mount.
fn mounts_under(mountinfo: &str, target: &Path) -> Vec<MountPoint> {
    let mut out: Vec<MountPoint> = Vec::new();
    for line in mountinfo.lines() {
        let mut fields = line.split(' ');
        let (Some(point), Some(options)) = (fields.nth(4), fields.next()) else {
            continue;
        };
        let path = unescape_octal(point);
        if !path.starts_with(target) {
            continue;
        }
        let mut read_only = false;
        let mut keep = MsFlags::empty();
        for opt in options.split(',') {
            match opt {
                "ro" => read_only = true,
                "nosuid" => keep |= MsFlags::MS_NOSUID,
                "nodev" => keep |= MsFlags::MS_NODEV,
                "noexec" => keep |= MsFlags::MS_NOEXEC,
                "noatime" => keep |= MsFlags::MS_NOATIME,
                "nodiratime" => keep |= MsFlags::MS_NODIRATIME,
                "relatime" => keep |= MsFlags::MS_RELATIME,
                _ => {}
            }
        }
        let m = MountPoint { path, read_only, keep };
        match out.iter_mut().find(|o| o.path == m.path) {
            Some(seen) => *seen = m,
            None => out.push(m),
        }
    }
    out
}

/// Decodes the `\ooo` escapes mountinfo uses for blanks and backslashes.
fn unescape_octal(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(code) = field.get(i + 1..i + 4)
            && let Ok(b) = u8::from_str_radix(code, 8)
        {
            out.push(b);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Makes `target` read-only or writable and, with `recursive`, every mount
/// below it too. Mounts already in the requested state are left alone.
fn remount_tree(target: &Path, read_only: bool, recursive: bool) -> Result<()> {
    let top = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
    let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
    let mut mounts = mounts_under(&mountinfo, &top);
    if !recursive {
        mounts.retain(|m| m.path == top);
    }
    if mounts.is_empty() {
        return remount(target, read_only);
    }
    for m in mounts.iter().filter(|m| m.read_only != read_only) {
        match remount_keeping(&m.path, read_only, m.keep) {
            Ok(()) => {}
            // Hidden by a later overmount or unreachable for us.
            Err(e @ (Errno::ENOENT | Errno::EACCES)) if m.path != top => {
                tracing::debug!(path = %m.path.display(), error = %e, "skipping submount");
            }
            Err(e) => return Err(Error::errno("mount(MS_REMOUNT)", e)),
        }
    }
    Ok(())
}

fn mount_fs(fstype: &str, target: &Path, flags: MsFlags, options: Option<&str>) -> Result<()> {
    mount(Some(fstype), target, Some(fstype), flags, options).op("mount")
}

/// Creates a directory or empty file at `target` to mount onto.
fn make_mount_point(target: &Path, like_dir: bool) -> io::Result<()> {
    if target.exists() {
        return Ok(());
    }
    if like_dir {
        fs::create_dir_all(target)
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(target).map(drop)
    }
}

/// Covers `target` so that nothing below it can be reached: a read-only
/// `000` tmpfs for directories, a read-only `/dev/null` for anything else.
fn make_inaccessible(target: &Path, is_dir: bool, null: Option<&OwnedFd>) -> Result<()> {
    if is_dir {
        return mount_fs(
            "tmpfs",
            target,
            MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Some("mode=000"),
        );
    }
    let null = null.ok_or(Error::errno("open(/dev/null)", Errno::ENOENT))?;
    bind(&fd_path(null), target, false)?;
    remount(target, true)
}

/// Sources opened before any mount, by entry index.
fn open_sources(plan: &NamespacePlan) -> Result<Vec<Option<OwnedFd>>> {
    plan.mounts
        .iter()
        .map(|e| match (&e.kind, &e.source) {
            (MountKind::Bind, Some(src)) => match open_path(src) {
                Ok(fd) => Ok(Some(fd)),
                Err(err) if err.kind() == io::ErrorKind::NotFound && e.ignore_missing => Ok(None),
                Err(err) => Err(Error::Config(format!("bind source {}: {err}", src.display()))),
            },
            _ => Ok(None),
        })
        .collect()
}

fn private_dev(target: &Path, nodes: &[(&str, OwnedFd)]) -> Result<()> {
    mount_fs(
        "tmpfs",
        target,
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_STRICTATIME,
        Some("mode=0755"),
    )?;
    for (name, fd) in nodes {
        let node = target.join(name);
        File::create(&node)?;
        bind(&fd_path(fd), &node, false)?;
    }
    for dir in ["pts", "shm"] {
        fs::create_dir_all(target.join(dir))?;
    }
    fs::set_permissions(target.join("shm"), fs::Permissions::from_mode(0o1777))?;
    let links = [
        ("/proc/self/fd", "fd"),
        ("/proc/self/fd/0", "stdin"),
        ("/proc/self/fd/1", "stdout"),
        ("/proc/self/fd/2", "stderr"),
        ("pts/ptmx", "ptmx"),
    ];
    for (to, name) in links {
        symlink(to, target.join(name))?;
    }
    Ok(())
}

fn attach_image(image: &Path, target: &Path) -> Result<()> {
    let file = File::open(image)?;
    let device = sys::loop_attach(std::os::fd::AsFd::as_fd(&file))?;
    fs::create_dir_all(target)?;
    let flags = MsFlags::MS_RDONLY | MsFlags::MS_NODEV | MsFlags::MS_NOSUID;
    for fstype in IMAGE_FS_TYPES {
        match mount(Some(device.as_str()), target, Some(fstype), flags, None::<&str>) {
            Ok(()) => {
                tracing::debug!(image = %image.display(), device, fstype, "root image mounted");
                return Ok(());
            }
            Err(Errno::EINVAL | Errno::ENODEV) => {}
            Err(e) => return Err(Error::errno("mount(image)", e)),
        }
    }
    Err(Error::Config(format!(
        "{}: no supported file system found",
        image.display()
    )))
}

impl LinuxNamespaceSetup {
    fn apply_entry(
        plan: &NamespacePlan,
        entry: &MountEntry,
        source: Option<&OwnedFd>,
        dev_nodes: &[(&str, OwnedFd)],
        null: Option<&OwnedFd>,
    ) -> Result<()> {
        let target = plan.host_path(&entry.destination);
        let target_is_dir = fs::metadata(&target).map_or(true, |m| m.is_dir());

        match &entry.kind {
            MountKind::Bind => {
                let Some(fd) = source else {
                    return Ok(());
                };
                let source_is_dir = entry
                    .source
                    .as_deref()
                    .is_none_or(|s| fs::metadata(s).is_ok_and(|m| m.is_dir()));
                make_mount_point(&target, source_is_dir)?;
                bind(&fd_path(fd), &target, entry.recursive)?;
                if entry.read_only {
                    remount_tree(&target, true, entry.recursive)?;
                }
            }
            MountKind::ReadOnly | MountKind::ReadWrite => {
                bind(&target, &target, entry.recursive)?;
                remount_tree(&target, entry.kind == MountKind::ReadOnly, entry.recursive)?;
            }
            MountKind::Inaccessible => make_inaccessible(&target, target_is_dir, null)?,
            MountKind::Tmpfs(options) => {
                make_mount_point(&target, true)?;
                let opts = (!options.is_empty()).then_some(options.as_str());
                mount_fs("tmpfs", &target, MsFlags::MS_NOSUID | MsFlags::MS_NODEV, opts)?;
            }
            MountKind::PrivateDev => private_dev(&target, dev_nodes)?,
            MountKind::Proc(hidepid) => {
                let opts = hidepid.as_ref().map(|h| format!("hidepid={h}"));
                mount_fs(
                    "proc",
                    &target,
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                    opts.as_deref(),
                )?;
            }
        }
        Ok(())
    }
}

impl NamespaceSetup for LinuxNamespaceSetup {
    fn apply(&self, plan: &NamespacePlan) -> Result<()> {
        unshare(CloneFlags::CLONE_NEWNS).op("unshare(CLONE_NEWNS)")?;
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_SLAVE,
            None::<&str>,
        )
        .op("mount(MS_SLAVE)")?;

        if let (Some(image), Some(root)) = (&plan.root_image, &plan.root) {
            attach_image(image, root)?;
        }

        let sources = open_sources(plan)?;
        let dev_nodes: Vec<(&str, OwnedFd)> = if plan.mounts.iter().any(|e| e.kind == MountKind::PrivateDev) {
            DEV_NODES
                .iter()
                .filter_map(|n| open_path(&Path::new("/dev").join(n)).ok().map(|fd| (*n, fd)))
                .collect()
        } else {
            Vec::new()
        };
        let null = open_path(Path::new("/dev/null")).ok();

        for (entry, source) in plan.mounts.iter().zip(&sources) {
            let target = plan.host_path(&entry.destination);
            if entry.ignore_missing && entry.kind != MountKind::Bind && !target.exists() {
                tracing::debug!(path = %target.display(), "skipping missing optional mount");
                continue;
            }
            tracing::debug!(path = %target.display(), kind = ?entry.kind, "mounting");
            match Self::apply_entry(plan, entry, source.as_ref(), &dev_nodes, null.as_ref()) {
                Err(e) if entry.ignore_missing && e.raw_os_error() == Some(libc::ENOENT) => {
                    tracing::debug!(path = %target.display(), "optional mount target vanished");
                }
                other => other?,
            }
        }

        for link in &plan.symlinks {
            let at = plan.host_path(&link.link);
            match symlink(&link.target, &at) {
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                other => other?,
            }
        }
        Ok(())
    }
}

/// `chroot` into `root` and move to its top.
pub fn enter_root(root: &Path) -> Result<()> {
    nix::unistd::chroot(root).op("chroot")?;
    nix::unistd::chdir("/").op("chdir")
}
