//! Allocator for transient per-unit users.
//!
//! Allocations are recorded as two small files below the pool directory:
//! `uid/<n>` holding the owner name and `name/<name>` holding the number.
//! Every mutation happens under an exclusive `flock` on `.lock`, so several
//! setup processes may allocate concurrently.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{Gid, Group, Uid, User};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// First uid of the dynamic range.
pub const DYNAMIC_UID_MIN: u32 = 61_184;
/// Last uid of the dynamic range.
pub const DYNAMIC_UID_MAX: u32 = 65_519;

/// Shared allocator state directory.
#[derive(Debug, Clone)]
pub struct DynamicUserPool {
    /// Pool root.
    dir: PathBuf,
}

impl DynamicUserPool {
    /// Opens (or creates) the pool directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("uid"))?;
        fs::create_dir_all(dir.join("name"))?;
        Ok(Self { dir })
    }

    fn lock(&self) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(".lock"))?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| Error::errno("flock", e))
    }

    /// Number currently allocated to `name`, if any.
    pub fn lookup(&self, name: &str) -> Result<Option<u32>> {
        validate_name(name)?;
        match fs::read_to_string(self.dir.join("name").join(name)) {
            Ok(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Identity(format!("corrupt allocation record for {name:?}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the number allocated to `name`, allocating one if needed.
    ///
    /// Candidates, in order: the owner of each suggested path, a hash of the
    /// name, then a linear probe from the hash.
    pub fn realize(&self, name: &str, suggested: &[PathBuf]) -> Result<u32> {
        validate_name(name)?;
        let _guard = self.lock()?;

        if let Some(n) = self.lookup(name)? {
            if self.owner_of(n)?.as_deref() == Some(name) {
                return Ok(n);
            }
            tracing::warn!(name, uid = n, "stale dynamic user record, reallocating");
        }

        let from_paths = suggested
            .iter()
            .filter_map(|p| fs::symlink_metadata(p).ok())
            .map(|m| m.uid());
        let hashed = hash_start(name);
        let size = DYNAMIC_UID_MAX - DYNAMIC_UID_MIN + 1;
        let probe = (0..size).map(|i| DYNAMIC_UID_MIN + (hashed - DYNAMIC_UID_MIN + i) % size);

        for candidate in from_paths.chain(probe) {
            if self.is_free(candidate)? {
                self.claim(name, candidate)?;
                tracing::info!(name, uid = candidate, "allocated dynamic user");
                return Ok(candidate);
            }
        }
        Err(Error::Identity("dynamic user range exhausted".into()))
    }

    /// Drops the allocation of `name`. Missing records are not an error.
    pub fn release(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _guard = self.lock()?;
        if let Some(n) = self.lookup(name)? {
            remove_if_exists(&self.dir.join("uid").join(n.to_string()))?;
        }
        remove_if_exists(&self.dir.join("name").join(name))
    }

    fn owner_of(&self, n: u32) -> Result<Option<String>> {
        match fs::read_to_string(self.dir.join("uid").join(n.to_string())) {
            Ok(s) => Ok(Some(s.trim().to_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_free(&self, n: u32) -> Result<bool> {
        if !(DYNAMIC_UID_MIN..=DYNAMIC_UID_MAX).contains(&n) {
            return Ok(false);
        }
        if self.owner_of(n)?.is_some() {
            return Ok(false);
        }
        let in_passwd = User::from_uid(Uid::from_raw(n)).ok().flatten().is_some();
        let in_group = Group::from_gid(Gid::from_raw(n)).ok().flatten().is_some();
        Ok(!in_passwd && !in_group)
    }

    fn claim(&self, name: &str, n: u32) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.dir.join("uid").join(n.to_string()))?;
        writeln!(f, "{name}")?;
        fs::write(self.dir.join("name").join(name), format!("{n}\n"))?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn hash_start(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    let n = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    DYNAMIC_UID_MIN + n % (DYNAMIC_UID_MAX - DYNAMIC_UID_MIN + 1)
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 31
        && !name.starts_with(|c: char| c.is_ascii_digit() || c == '-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(Error::Identity(format!("invalid dynamic user name {name:?}")))
    }
}

/// Dynamic user (and group) assigned to one unit, realized lazily in the
/// setup process.
#[derive(Debug, Clone)]
pub struct DynamicCreds {
    /// Allocator.
    pool: DynamicUserPool,
    /// User name.
    user: String,
    /// Group name, when different from the user name.
    group: Option<String>,
}

impl DynamicCreds {
    /// Creds for `user`, with a primary group of the same name unless
    /// `group` names another one.
    pub fn new(pool: DynamicUserPool, user: impl Into<String>, group: Option<String>) -> Self {
        let user = user.into();
        let group = group.filter(|g| *g != user);
        Self { pool, user, group }
    }

    /// Creds derived from a unit id: `db.service` becomes user `db`.
    pub fn for_unit(pool: DynamicUserPool, unit: &str, user: Option<&str>, group: Option<&str>) -> Self {
        let base = unit.rsplit_once('.').map_or(unit, |(stem, _)| stem);
        let name: String = base
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .take(31)
            .collect();
        Self::new(pool, user.map_or(name, str::to_owned), group.map(str::to_owned))
    }

    /// User name.
    pub fn user_name(&self) -> &str {
        &self.user
    }

    /// Allocates or looks up the (uid, gid) pair.
    pub fn realize(&self, suggested: &[PathBuf]) -> Result<(Uid, Gid)> {
        let uid = self.pool.realize(&self.user, suggested)?;
        let gid = match &self.group {
            Some(g) => self.pool.realize(g, &[])?,
            None => uid,
        };
        Ok((Uid::from_raw(uid), Gid::from_raw(gid)))
    }

    /// Releases the allocations.
    pub fn release(&self) -> Result<()> {
        self.pool.release(&self.user)?;
        if let Some(g) = &self.group {
            self.pool.release(g)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> (tempfile::TempDir, DynamicUserPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DynamicUserPool::open(dir.path().join("dynamic-uid")).unwrap();
        (dir, pool)
    }

    #[test]
    fn allocation_is_stable_per_name() {
        let (_d, pool) = pool();
        let a = pool.realize("db", &[]).unwrap();
        assert!((DYNAMIC_UID_MIN..=DYNAMIC_UID_MAX).contains(&a));
        assert_eq!(pool.realize("db", &[]).unwrap(), a);
        assert_eq!(pool.lookup("db").unwrap(), Some(a));
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let (_d, pool) = pool();
        let a = pool.realize("web", &[]).unwrap();
        let b = pool.realize("worker", &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn release_frees_the_number() {
        let (_d, pool) = pool();
        let a = pool.realize("cache", &[]).unwrap();
        pool.release("cache").unwrap();
        assert_eq!(pool.lookup("cache").unwrap(), None);
        assert!(pool.is_free(a).unwrap() || User::from_uid(Uid::from_raw(a)).unwrap().is_some());
        pool.release("cache").unwrap();
    }

    #[test]
    fn suggested_path_outside_range_is_skipped() {
        let (d, pool) = pool();
        let state = d.path().join("state");
        fs::create_dir(&state).unwrap();
        let n = pool.realize("svc", &[state]).unwrap();
        assert!((DYNAMIC_UID_MIN..=DYNAMIC_UID_MAX).contains(&n));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let (_d, pool) = pool();
        assert!(pool.realize("", &[]).is_err());
        assert!(pool.realize("1234", &[]).is_err());
        assert!(pool.realize("../etc", &[]).is_err());
    }

    #[test]
    fn creds_share_number_for_same_named_group() {
        let (_d, pool) = pool();
        let creds = DynamicCreds::for_unit(pool, "db.service", None, None);
        assert_eq!(creds.user_name(), "db");
        let (uid, gid) = creds.realize(&[]).unwrap();
        assert_eq!(uid.as_raw(), gid.as_raw());
        creds.release().unwrap();
    }
}
