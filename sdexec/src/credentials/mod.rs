//! Per-execution credential store.
//!
//! Credentials are written into `<credentials_root>/<unit>` before the
//! program starts and exposed through `$CREDENTIALS_DIRECTORY`. Literal
//! values go in first; loaded values only fill ids that are still free.

pub mod encrypted;
pub mod mount;
pub mod source;

use std::collections::BTreeSet;
use std::ffi::CStr;
use std::fs;
use std::io::Write;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use self::mount::{MountBackend, StoreBacking};
use crate::config::PipelineConfig;
use crate::context::{CredentialSource, ExecContext};
use crate::{Error, Result, sys};

/// Upper bound on the sum of id and payload sizes in one store.
pub const CREDENTIALS_TOTAL_SIZE_MAX: usize = 1024 * 1024;
/// Upper bound on one payload.
pub const CREDENTIAL_SIZE_MAX: usize = 1024 * 1024;
/// Upper bound on one sealed payload as read from disk (base64 overhead).
pub const CREDENTIAL_ENCRYPTED_SIZE_MAX: usize = CREDENTIAL_SIZE_MAX / 3 * 4 + 4096;

/// POSIX ACL xattr name.
const ACL_XATTR: &CStr = c"system.posix_acl_access";

/// Serialized POSIX ACL (`posix_acl_xattr` v2) giving `uid` the
/// `user_perm` bits and leaving group and other empty.
pub fn acl_xattr(uid: Uid, owner_perm: u16, user_perm: u16) -> Vec<u8> {
    const UNDEFINED: u32 = u32::MAX;
    let entries: [(u16, u16, u32); 5] = [
        (0x01, owner_perm, UNDEFINED),
        (0x02, user_perm, uid.as_raw()),
        (0x04, 0, UNDEFINED),
        (0x10, user_perm, UNDEFINED),
        (0x20, 0, UNDEFINED),
    ];
    let mut out = Vec::with_capacity(4 + entries.len() * 8);
    out.extend_from_slice(&2u32.to_le_bytes());
    for (tag, perm, id) in entries {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&perm.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

/// Grants the owner identity access to `fd`: an ACL entry when supported,
/// otherwise `fchown` if `ownership_grant` allows it.
fn grant<F: AsFd>(fd: &F, owner: (Uid, Gid), owner_perm: u16, user_perm: u16, ownership_grant: bool) -> Result<()> {
    let acl = acl_xattr(owner.0, owner_perm, user_perm);
    match sys::fsetxattr(fd.as_fd(), ACL_XATTR, &acl) {
        Ok(()) => Ok(()),
        Err(e)
            if ownership_grant
                && matches!(
                    e.raw_os_error(),
                    Some(libc::EOPNOTSUPP | libc::ENOSYS | libc::EPERM | libc::EACCES)
                ) =>
        {
            std::os::unix::fs::fchown(fd, Some(owner.0.as_raw()), Some(owner.1.as_raw()))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Size-capped set of credentials being written into one directory.
#[derive(Debug)]
pub struct CredentialStore {
    /// Store directory.
    dir: PathBuf,
    /// Budget left, in bytes.
    remaining: usize,
    /// Ids written so far.
    ids: BTreeSet<String>,
    /// Identity that must be able to read the files, when not the caller.
    owner: Option<(Uid, Gid)>,
    /// Whether falling back to `fchown` is acceptable.
    ownership_grant: bool,
}

impl CredentialStore {
    /// Store writing into the existing directory `dir`.
    pub fn new(dir: impl Into<PathBuf>, owner: Option<(Uid, Gid)>, ownership_grant: bool) -> Self {
        let owner = owner.filter(|(uid, _)| *uid != Uid::effective());
        Self {
            dir: dir.into(),
            remaining: CREDENTIALS_TOTAL_SIZE_MAX,
            ids: BTreeSet::new(),
            owner,
            ownership_grant,
        }
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes still available.
    pub const fn remaining(&self) -> usize {
        self.remaining
    }

    /// Whether `id` has been written.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Written ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Gives the owner access to the store directory itself.
    pub fn grant_directory(&self) -> Result<()> {
        if let Some(owner) = self.owner {
            let dir = fs::File::open(&self.dir)?;
            grant(&dir, owner, 0o7, 0o5, self.ownership_grant)?;
        }
        Ok(())
    }

    /// Writes one credential.
    ///
    /// Rejected writes (bad id, duplicate, over budget) leave everything
    /// written before untouched.
    pub fn add(&mut self, id: &str, data: &[u8]) -> Result<()> {
        validate_id(id)?;
        if self.ids.contains(id) {
            return Err(Error::credential(id, "duplicate credential id"));
        }
        if data.len() > CREDENTIAL_SIZE_MAX {
            return Err(Error::credential(id, "payload too large"));
        }
        let cost = id.len() + data.len();
        if cost > self.remaining {
            return Err(Error::credential(
                id,
                format!("store full ({} bytes left, {cost} needed)", self.remaining),
            ));
        }

        let mut tmp = tempfile::Builder::new().prefix(".cred-").tempfile_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        if let Some(owner) = self.owner {
            grant(tmp.as_file(), owner, 0o6, 0o4, self.ownership_grant)?;
        }
        let target = self.dir.join(id);
        tmp.persist_noclobber(&target).map_err(|e| Error::Io(e.error))?;
        mount::clear_write_bits(&target)?;

        self.remaining -= cost;
        self.ids.insert(id.to_owned());
        tracing::debug!(id, size = data.len(), "credential written");
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 255
        && id != "."
        && id != ".."
        && !id.starts_with(".cred-")
        && !id.contains(['/', '\0']);
    if ok {
        Ok(())
    } else {
        Err(Error::credential(id, "invalid credential id"))
    }
}

/// Where the credentials of one attempt ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Materialized {
    /// Store directory, exported as `CREDENTIALS_DIRECTORY`.
    pub dir: PathBuf,
    /// What backs it.
    pub backing: StoreBacking,
    /// Ids written.
    pub ids: Vec<String>,
}

/// Builds the credential store of `unit` for `ctx`.
///
/// Returns `None` when the unit declares no credentials.
pub fn materialize(
    ctx: &ExecContext,
    unit: &str,
    config: &PipelineConfig,
    owner: Option<(Uid, Gid)>,
    backend: &dyn MountBackend,
    must_mount: bool,
) -> Result<Option<Materialized>> {
    if ctx.credentials.is_empty() {
        return Ok(None);
    }
    let dir = config.credentials_dir(unit);
    mount::clear(backend, &dir)?;
    let backing = mount::prepare(backend, &dir, must_mount)?;

    let mut store = CredentialStore::new(&dir, owner, backing.is_mount());
    store.grant_directory()?;
    fill(&mut store, ctx, unit, config)?;
    mount::finish(backend, &dir, backing)?;

    Ok(Some(Materialized {
        dir,
        backing,
        ids: store.ids().map(str::to_owned).collect(),
    }))
}

/// Writes every declared credential into `store`: literals first, then
/// loaded values for ids still free.
pub fn fill(store: &mut CredentialStore, ctx: &ExecContext, unit: &str, config: &PipelineConfig) -> Result<()> {
    let host_key = if ctx.credentials.iter().any(|c| c.encrypted) {
        fs::read(&config.host_key_path).ok()
    } else {
        None
    };

    for spec in &ctx.credentials {
        let CredentialSource::Literal(value) = &spec.source else {
            continue;
        };
        if store.contains(&spec.id) {
            continue;
        }
        let data = if spec.encrypted {
            encrypted::decrypt(&spec.id, value.as_bytes(), host_key.as_deref())?
        } else {
            value.as_bytes().to_vec()
        };
        store.add(&spec.id, &data)?;
    }

    for spec in &ctx.credentials {
        let CredentialSource::Path(path) = &spec.source else {
            continue;
        };
        if store.contains(&spec.id) {
            tracing::debug!(id = %spec.id, "credential already set, not loading");
            continue;
        }
        let limit = if spec.encrypted {
            CREDENTIAL_ENCRYPTED_SIZE_MAX
        } else {
            CREDENTIAL_SIZE_MAX.min(store.remaining())
        };
        for (id, data) in source::read(&spec.id, path, spec.encrypted, unit, config, limit)? {
            let data = if spec.encrypted {
                encrypted::decrypt(&spec.id, &data, host_key.as_deref())?
            } else {
                data
            };
            store.add(&id, &data)?;
        }
    }
    Ok(())
}
