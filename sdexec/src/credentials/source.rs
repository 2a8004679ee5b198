//! Reading credential payloads from the file system and from sockets.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::{Error, Result, sys};

/// One payload ready for the store.
pub type Payload = (String, Vec<u8>);

/// Reads whatever `path` refers to for credential `id`.
///
/// Relative paths are looked up on the search path and silently skipped
/// when absent; a missing absolute path is an error.
pub fn read(
    id: &str,
    path: &Path,
    encrypted: bool,
    unit: &str,
    config: &PipelineConfig,
    limit: usize,
) -> Result<Vec<Payload>> {
    if path.is_absolute() {
        return read_absolute(id, path, unit, limit);
    }
    let search = if encrypted {
        &config.encrypted_credential_search_path
    } else {
        &config.credential_search_path
    };
    match search.iter().map(|d| d.join(path)).find(|p| p.exists()) {
        Some(found) => read_absolute(id, &found, unit, limit),
        None => {
            tracing::debug!(id, path = %path.display(), "credential not found on search path, skipping");
            Ok(Vec::new())
        }
    }
}

fn read_absolute(id: &str, path: &Path, unit: &str, limit: usize) -> Result<Vec<Payload>> {
    let meta = fs::metadata(path).map_err(|e| Error::credential(id, format!("{}: {e}", path.display())))?;
    let ft = meta.file_type();
    if ft.is_dir() {
        let mut out = Vec::new();
        mirror(id, unit, path, path, limit, &mut out)?;
        Ok(out)
    } else if ft.is_socket() {
        Ok(vec![(id.to_owned(), read_socket(id, path, unit, limit)?)])
    } else {
        let f = File::open(path)?;
        Ok(vec![(id.to_owned(), read_limited(id, f, limit)?)])
    }
}

/// Sub-credential id for `rel` below a directory loaded as `id`.
pub fn sub_id(id: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy().replace('/', "_");
    format!("{id}_{rel}")
}

fn mirror(id: &str, unit: &str, root: &Path, dir: &Path, limit: usize, out: &mut Vec<Payload>) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();
    for path in entries {
        let ft = fs::symlink_metadata(&path)?.file_type();
        let rel = path.strip_prefix(root).unwrap_or(&path);
        if ft.is_dir() {
            mirror(id, unit, root, &path, limit, out)?;
        } else if ft.is_file() {
            out.push((sub_id(id, rel), read_limited(id, File::open(&path)?, limit)?));
        } else if ft.is_socket() {
            out.push((sub_id(id, rel), read_socket(id, &path, unit, limit)?));
        }
    }
    Ok(())
}

/// Reads at most `limit` bytes; more is an error.
pub fn read_limited(id: &str, reader: impl Read, limit: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut data)?;
    if data.len() > limit {
        return Err(Error::credential(id, format!("larger than {limit} bytes")));
    }
    Ok(data)
}

/// Abstract address the client binds to, so the server can tell which
/// unit and credential it is serving.
pub fn peer_name(unit: &str, id: &str) -> String {
    format!("{:016x}/unit/{unit}/{id}", rand::random::<u64>())
}

fn read_socket(id: &str, path: &Path, unit: &str, limit: usize) -> Result<Vec<u8>> {
    let cpath = CString::new(path.as_os_str().as_bytes())?;
    let fd = sys::connect_unix_bound(&cpath, peer_name(unit, id).as_bytes())
        .map_err(|e| Error::credential(id, format!("{}: {e}", path.display())))?;
    sys::shutdown(fd.as_fd(), libc::SHUT_WR)?;
    read_limited(id, File::from(fd), limit)
}
