//! Mount namespace compilation.
//!
//! Every file-system related option of an [`ExecContext`] becomes one
//! [`MountEntry`] in a single ordered list. The list is built without
//! touching the system, so it can be printed and tested; applying it is the
//! job of a [`NamespaceSetup`] implementation.

pub mod directories;
mod linux;

use std::path::{Path, PathBuf};

use serde::Serialize;

pub use self::directories::PreparedDirectory;
pub use self::linux::{LinuxNamespaceSetup, enter_root};
use crate::Result;
use crate::context::{ExecContext, ProtectHome, ProtectSystem, RootSource};

/// Where a disk image root is mounted inside the new namespace.
pub const IMAGE_ROOT: &str = "/run/sdexec/unit-root";

/// What a [`MountEntry`] does to its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum MountKind {
    /// Bind `source` onto the destination.
    Bind,
    /// Remount the destination read-only.
    ReadOnly,
    /// Keep the destination writable under a read-only parent.
    ReadWrite,
    /// Cover the destination with an empty, mode `000` node.
    Inaccessible,
    /// Mount a fresh tmpfs with these options.
    Tmpfs(String),
    /// Replace `/dev` with a minimal device tree.
    PrivateDev,
    /// Mount a fresh `/proc`, optionally with `hidepid=`.
    Proc(Option<String>),
}

/// One mount operation of the unit's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct MountEntry {
    /// Host path, for binds.
    pub source: Option<PathBuf>,
    /// Path inside the unit's view.
    pub destination: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
    /// Include submounts.
    pub recursive: bool,
    /// Skip silently when the source or destination does not exist.
    pub ignore_missing: bool,
    /// Operation.
    pub kind: MountKind,
}

impl MountEntry {
    /// Entry of `kind` on `destination`.
    pub fn new(destination: impl Into<PathBuf>, kind: MountKind) -> Self {
        Self {
            source: None,
            read_only: kind == MountKind::ReadOnly,
            destination: destination.into(),
            recursive: true,
            ignore_missing: false,
            kind,
        }
    }

    /// Recursive bind of `source` onto `destination`.
    pub fn bind(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            source: Some(source.into()),
            read_only,
            ..Self::new(destination, MountKind::Bind)
        }
    }

    /// tmpfs with `options` on `destination`.
    pub fn tmpfs(destination: impl Into<PathBuf>, options: &str) -> Self {
        Self::new(destination, MountKind::Tmpfs(options.to_owned()))
    }

    /// Marks the entry as optional.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.ignore_missing = true;
        self
    }

    /// Parses the `-/path` convention: a leading `-` marks the path optional.
    pub fn from_setting(path: &Path, kind: MountKind) -> Self {
        let text = path.to_string_lossy();
        match text.strip_prefix('-') {
            Some(rest) => Self::new(rest, kind).optional(),
            None => Self::new(path, kind),
        }
    }
}

/// A symlink created inside the unit's view after mounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct Symlink {
    /// What the link points to.
    pub target: PathBuf,
    /// The link itself.
    pub link: PathBuf,
}

/// The compiled file-system view of one execution attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct NamespacePlan {
    /// Directory the process will `chroot` into, after mounting.
    pub root: Option<PathBuf>,
    /// Disk image attached and mounted on [`root`](Self::root).
    pub root_image: Option<PathBuf>,
    /// Mount operations, parents before children.
    pub mounts: Vec<MountEntry>,
    /// Symlinks created after mounting.
    pub symlinks: Vec<Symlink>,
}

impl NamespacePlan {
    /// Whether any mount or symlink has to be set up.
    pub fn is_empty(&self) -> bool {
        self.root_image.is_none() && self.mounts.is_empty() && self.symlinks.is_empty()
    }

    /// `destination` as seen from the host while setting up, i.e. below
    /// the new root.
    pub fn host_path(&self, destination: &Path) -> PathBuf {
        match &self.root {
            Some(root) => root.join(destination.strip_prefix("/").unwrap_or(destination)),
            None => destination.to_path_buf(),
        }
    }
}

/// Per-attempt inputs that do not live in the [`ExecContext`].
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct PlanInputs<'a> {
    /// Managed directories.
    pub directories: &'a [PreparedDirectory],
    /// Private `/tmp` and `/var/tmp` from the shared runtime.
    pub tmp_dirs: Option<(&'a Path, &'a Path)>,
    /// Materialized credential store.
    pub credentials_dir: Option<&'a Path>,
    /// Apply the root directory or image.
    pub apply_root: bool,
}

/// Whether `ctx` needs a private mount namespace at all.
///
/// A plain root directory does not: a bare `chroot` suffices.
pub fn needs_mount_namespace(ctx: &ExecContext, inputs: &PlanInputs<'_>) -> bool {
    ctx.private_mounts
        || ctx.private_tmp
        || ctx.private_devices
        || ctx.protect_home != ProtectHome::No
        || ctx.protect_system != ProtectSystem::No
        || ctx.protect_proc.hidepid().is_some()
        || ctx.protect_kernel_tunables
        || ctx.protect_kernel_modules
        || ctx.protect_kernel_logs
        || ctx.protect_control_groups
        || !ctx.read_only_paths.is_empty()
        || !ctx.read_write_paths.is_empty()
        || !ctx.inaccessible_paths.is_empty()
        || !ctx.bind_mounts.is_empty()
        || !ctx.temporary_filesystems.is_empty()
        || inputs.directories.iter().any(PreparedDirectory::is_private)
        || (inputs.apply_root && matches!(ctx.root, Some(RootSource::Image(_))))
}

fn optional_all(paths: &[&str], kind: &MountKind) -> impl Iterator<Item = MountEntry> {
    paths.iter().map(move |p| MountEntry::new(*p, kind.clone()).optional())
}

/// Compiles the mount list of `ctx`.
pub fn compile(ctx: &ExecContext, inputs: &PlanInputs<'_>) -> NamespacePlan {
    let mut plan = NamespacePlan::default();
    if inputs.apply_root {
        match &ctx.root {
            Some(RootSource::Directory(dir)) => plan.root = Some(dir.clone()),
            Some(RootSource::Image(image)) => {
                plan.root = Some(IMAGE_ROOT.into());
                plan.root_image = Some(image.clone());
            }
            None => {}
        }
    }
    if !needs_mount_namespace(ctx, inputs) {
        return plan;
    }
    let m = &mut plan.mounts;

    match ctx.protect_system {
        ProtectSystem::No => {}
        ProtectSystem::Yes => m.extend(optional_all(&["/usr", "/boot", "/efi"], &MountKind::ReadOnly)),
        ProtectSystem::Full => m.extend(optional_all(&["/usr", "/boot", "/efi", "/etc"], &MountKind::ReadOnly)),
        ProtectSystem::Strict => {
            m.push(MountEntry::new("/", MountKind::ReadOnly));
            m.extend(optional_all(&["/dev", "/proc", "/sys"], &MountKind::ReadWrite));
        }
    }
    let home = ["/home", "/root", "/run/user"];
    match ctx.protect_home {
        ProtectHome::No => {}
        ProtectHome::Yes => m.extend(optional_all(&home, &MountKind::Inaccessible)),
        ProtectHome::ReadOnly => m.extend(optional_all(&home, &MountKind::ReadOnly)),
        ProtectHome::Tmpfs => m.extend(optional_all(&home, &MountKind::Tmpfs("mode=0755".into()))),
    }
    if ctx.protect_kernel_tunables {
        m.extend(optional_all(&["/proc/sys", "/proc/sysrq-trigger", "/sys"], &MountKind::ReadOnly));
    }
    if ctx.protect_kernel_modules {
        m.extend(optional_all(&["/lib/modules", "/usr/lib/modules"], &MountKind::Inaccessible));
    }
    if ctx.protect_kernel_logs {
        m.extend(optional_all(&["/proc/kmsg", "/dev/kmsg"], &MountKind::Inaccessible));
    }
    if ctx.protect_control_groups {
        m.push(MountEntry::new("/sys/fs/cgroup", MountKind::ReadOnly).optional());
    }
    if let Some(hidepid) = ctx.protect_proc.hidepid() {
        m.push(MountEntry::new("/proc", MountKind::Proc(Some(hidepid.to_owned()))));
    }
    if ctx.private_devices {
        m.push(MountEntry::new("/dev", MountKind::PrivateDev));
    }
    if ctx.private_tmp
        && let Some((tmp, var_tmp)) = inputs.tmp_dirs
    {
        m.push(MountEntry::bind(tmp, "/tmp", false));
        m.push(MountEntry::bind(var_tmp, "/var/tmp", false));
    }

    m.extend(ctx.read_only_paths.iter().map(|p| MountEntry::from_setting(p, MountKind::ReadOnly)));
    m.extend(ctx.read_write_paths.iter().map(|p| MountEntry::from_setting(p, MountKind::ReadWrite)));
    m.extend(ctx.inaccessible_paths.iter().map(|p| MountEntry::from_setting(p, MountKind::Inaccessible)));
    for b in &ctx.bind_mounts {
        let mut e = MountEntry::bind(&b.source, &b.destination, b.read_only);
        e.recursive = b.recursive;
        e.ignore_missing = b.ignore_missing;
        m.push(e);
    }
    m.extend(ctx.temporary_filesystems.iter().map(|t| MountEntry::tmpfs(&t.path, &t.options)));
    m.extend(directories::mount_entries(inputs.directories));
    if let Some(creds) = inputs.credentials_dir {
        m.push(MountEntry::bind(creds, creds, true));
    }

    // Parents first; equal depth keeps declaration order, so later
    // settings override earlier ones on the same path.
    m.sort_by_key(|e| e.destination.components().count());

    for d in inputs.directories {
        if let Some(root) = &d.private_root {
            plan.symlinks.push(Symlink {
                target: root.join(d.physical.strip_prefix(root).unwrap_or(&d.physical)),
                link: d.path.clone(),
            });
        }
        plan.symlinks.extend(d.symlinks.iter().map(|l| Symlink {
            target: d.path.clone(),
            link: l.clone(),
        }));
    }
    plan
}

/// Builds the unit's mount namespace from a plan.
pub trait NamespaceSetup {
    /// Enters a new mount namespace and applies `plan` in it. Does not
    /// `chroot`.
    fn apply(&self, plan: &NamespacePlan) -> Result<()>;
}
