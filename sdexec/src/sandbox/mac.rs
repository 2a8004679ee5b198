//! Mandatory-access-control label switches through `/proc/self/attr`.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::Result;
use crate::context::MacContext;

/// Candidate attribute files and the value to write, first existing one wins.
pub fn attr_writes(mac: &MacContext, proc_root: &Path) -> Vec<(PathBuf, String)> {
    let (label, _) = mac.label();
    let attr = proc_root.join("self/attr");
    match mac {
        MacContext::Selinux(_) => vec![(attr.join("exec"), label.to_owned())],
        MacContext::Apparmor(_) => {
            let value = format!("exec {label}");
            vec![(attr.join("apparmor/exec"), value.clone()), (attr.join("exec"), value)]
        }
        MacContext::Smack(_) => vec![(attr.join("current"), label.to_owned())],
    }
}

/// Applies `mac` for the next `execve`.
///
/// Returns `Ok(false)` when the failure is tolerated: the label carries the
/// `-` marker or the security module is not present at all.
pub fn apply(mac: &MacContext) -> Result<bool> {
    apply_at(mac, Path::new("/proc"))
}

fn apply_at(mac: &MacContext, proc_root: &Path) -> Result<bool> {
    let (label, tolerant) = mac.label();
    let mut last = io::Error::from(io::ErrorKind::NotFound);
    for (path, value) in attr_writes(mac, proc_root) {
        match OpenOptions::new().write(true).open(&path) {
            Ok(mut f) => match f.write_all(value.as_bytes()) {
                Ok(()) => {
                    tracing::debug!(label, path = %path.display(), "mac context set");
                    return Ok(true);
                }
                Err(e) => {
                    last = e;
                    break;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                last = e;
                break;
            }
        }
    }
    if tolerant || last.kind() == io::ErrorKind::NotFound {
        tracing::warn!(label, error = %last, "mac context not applied");
        return Ok(false);
    }
    Err(last.into())
}
