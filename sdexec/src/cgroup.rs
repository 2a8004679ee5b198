//! Control-group migration on the unified hierarchy.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use nix::unistd::Pid;

use crate::{Error, Result};

/// Directory of `path` below `root`. `path` is relative to the hierarchy
/// root; a leading `/` is accepted, `..` is not.
pub fn group_dir(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut dir = root.to_path_buf();
    for c in path.components() {
        match c {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => dir.push(part),
            _ => {
                return Err(Error::Config(format!(
                    "control group path {} escapes the hierarchy",
                    path.display()
                )));
            }
        }
    }
    Ok(dir)
}

/// Moves `pid` into the group at `path`, creating it if needed.
pub fn attach(root: &Path, path: &Path, pid: Pid) -> Result<()> {
    let dir = group_dir(root, path)?;
    fs::create_dir_all(&dir)?;
    let mut procs = OpenOptions::new().write(true).open(dir.join("cgroup.procs"))?;
    procs.write_all(format!("{pid}\n").as_bytes())?;
    tracing::debug!(cgroup = %dir.display(), pid = pid.as_raw(), "attached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_writes_pid() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("system.slice/web.service");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cgroup.procs"), "").unwrap();

        attach(root.path(), Path::new("/system.slice/web.service"), Pid::from_raw(4242)).unwrap();
        assert_eq!(fs::read_to_string(dir.join("cgroup.procs")).unwrap(), "4242\n");
    }

    #[test]
    fn escaping_paths_are_rejected() {
        assert!(group_dir(Path::new("/sys/fs/cgroup"), Path::new("../etc")).is_err());
        assert_eq!(
            group_dir(Path::new("/sys/fs/cgroup"), Path::new("a.slice/b.service")).unwrap(),
            PathBuf::from("/sys/fs/cgroup/a.slice/b.service")
        );
    }
}
