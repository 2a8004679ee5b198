//! Backing for the credential store: a private, non-swappable mount when
//! possible, a plain directory otherwise.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use nix::mount::{MntFlags, MsFlags, mount, umount2};

use crate::error::ErrnoExt;
use crate::{Error, Result};

/// What ended up backing the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreBacking {
    /// A fresh `ramfs`: never swapped out.
    Ramfs,
    /// A fresh `tmpfs`.
    Tmpfs,
    /// The directory bind-mounted onto itself.
    Bind,
    /// The directory, unmounted.
    PlainDirectory,
}

impl StoreBacking {
    /// Whether the store is a mount point that can be made read-only.
    pub const fn is_mount(self) -> bool {
        !matches!(self, Self::PlainDirectory)
    }
}

/// Mount operations used by the store. Faked in tests.
pub trait MountBackend {
    /// Mounts a fresh file system of type `fstype` on `target`.
    fn mount_fs(&self, fstype: &str, target: &Path, options: &str) -> Result<()>;
    /// Bind-mounts `target` onto itself.
    fn bind_self(&self, target: &Path) -> Result<()>;
    /// Remounts `target` read-only.
    fn remount_read_only(&self, target: &Path) -> Result<()>;
    /// Lazily unmounts `target`.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// `mount(2)` on the host.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct SystemMounts;

/// Flags of every credential store mount.
fn store_flags() -> MsFlags {
    MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID
}

impl MountBackend for SystemMounts {
    fn mount_fs(&self, fstype: &str, target: &Path, options: &str) -> Result<()> {
        mount(Some(fstype), target, Some(fstype), store_flags(), Some(options)).op("mount")
    }

    fn bind_self(&self, target: &Path) -> Result<()> {
        mount(Some(target), target, None::<&str>, MsFlags::MS_BIND, None::<&str>).op("mount(MS_BIND)")?;
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | store_flags(),
            None::<&str>,
        )
        .op("mount(MS_REMOUNT)")
    }

    fn remount_read_only(&self, target: &Path) -> Result<()> {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | store_flags(),
            None::<&str>,
        )
        .op("mount(MS_RDONLY)")
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        umount2(target, MntFlags::MNT_DETACH).op("umount2")
    }
}

/// Whether a mount attempt may fall through to the next backing.
fn can_fall_back(e: &Error) -> bool {
    e.is_ignorable() || e.raw_os_error() == Some(libc::ENODEV)
}

/// Creates `dir` (mode `0700`) and mounts the best available backing on it.
///
/// Falls back ramfs, tmpfs, self bind mount, plain directory. With
/// `must_mount`, running out of mount options is an error.
pub fn prepare(backend: &dyn MountBackend, dir: &Path, must_mount: bool) -> Result<StoreBacking> {
    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

    let attempts: [(StoreBacking, &dyn Fn() -> Result<()>); 3] = [
        (StoreBacking::Ramfs, &|| backend.mount_fs("ramfs", dir, "mode=0700")),
        (StoreBacking::Tmpfs, &|| backend.mount_fs("tmpfs", dir, "mode=0700,nr_inodes=1024")),
        (StoreBacking::Bind, &|| backend.bind_self(dir)),
    ];
    for (backing, attempt) in attempts {
        match attempt() {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), ?backing, "credential store mounted");
                return Ok(backing);
            }
            Err(e) if can_fall_back(&e) => {
                tracing::debug!(?backing, error = %e, "credential store mount refused, falling back");
            }
            Err(e) => return Err(e),
        }
    }
    if must_mount {
        return Err(Error::Config(format!(
            "cannot mount credential store on {}",
            dir.display()
        )));
    }
    tracing::debug!(dir = %dir.display(), "credential store is a plain directory");
    Ok(StoreBacking::PlainDirectory)
}

/// Seals the store after the last credential is written: write bits
/// cleared in any case, then read-only when it is a mount.
///
/// The mode change has to come first; a read-only mount refuses `chmod`.
pub fn finish(backend: &dyn MountBackend, dir: &Path, backing: StoreBacking) -> Result<()> {
    clear_write_bits(dir)?;
    if backing.is_mount() {
        match backend.remount_read_only(dir) {
            Err(e) if e.is_ignorable() => {
                tracing::warn!(error = %e, "credential store stays writable");
            }
            other => other?,
        }
    }
    Ok(())
}

/// Drops every write bit of `path`, leaving ACL grants intact.
pub fn clear_write_bits(path: &Path) -> Result<()> {
    let mode = fs::metadata(path)?.permissions().mode() & 0o7777;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & !0o222))?;
    Ok(())
}

/// Removes a previous store at `dir`, unmounting it first if needed.
pub fn clear(backend: &dyn MountBackend, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    if let Err(e) = backend.unmount(dir)
        && !matches!(e.raw_os_error(), Some(libc::EINVAL | libc::ENOENT))
        && !e.is_ignorable()
    {
        return Err(e);
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    fs::remove_dir_all(dir)?;
    Ok(())
}
