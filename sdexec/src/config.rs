//! Host-wide pipeline configuration: where stores, sockets and allocator
//! state live on this machine.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Environment variable naming a JSON [`PipelineConfig`] file.
pub const CONFIG_ENV: &str = "SDEXEC_CONFIG";

/// Paths the pipeline reads from or writes to outside the unit's own
/// declarations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct PipelineConfig {
    /// Directories searched for relative credential names, in order.
    pub credential_search_path: Vec<PathBuf>,
    /// Directories searched for relative encrypted credential names.
    pub encrypted_credential_search_path: Vec<PathBuf>,
    /// Parent of the per-unit credential stores.
    pub credentials_root: PathBuf,
    /// Host secret used to unwrap host-sealed credentials.
    pub host_key_path: PathBuf,
    /// State directory of the dynamic user allocator.
    pub dynamic_user_dir: PathBuf,
    /// Mount point of the unified control-group hierarchy.
    pub cgroup_root: PathBuf,
    /// Stream socket of the journal's stdout transport.
    pub journal_socket: PathBuf,
    /// Terminal used for confirmation prompts and `tty` stdio by default.
    pub console: PathBuf,
    /// Where per-unit private temp directories are created.
    pub private_tmp_root: PathBuf,
    /// Flag file whose presence disables confirmation prompts manager-wide.
    pub confirm_disabled_flag: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            credential_search_path: vec![
                "/etc/credstore".into(),
                "/run/credstore".into(),
                "/usr/lib/credstore".into(),
            ],
            encrypted_credential_search_path: vec![
                "/etc/credstore.encrypted".into(),
                "/run/credstore.encrypted".into(),
                "/usr/lib/credstore.encrypted".into(),
            ],
            credentials_root: "/run/credentials".into(),
            host_key_path: "/var/lib/systemd/credential.secret".into(),
            dynamic_user_dir: "/run/systemd/dynamic-uid".into(),
            cgroup_root: "/sys/fs/cgroup".into(),
            journal_socket: "/run/systemd/journal/stdout".into(),
            console: "/dev/console".into(),
            private_tmp_root: "/tmp".into(),
            confirm_disabled_flag: "/run/systemd/confirm_spawn_disabled".into(),
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON configuration file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Loads from `$SDEXEC_CONFIG` when set, otherwise returns the defaults.
    pub fn from_env() -> Result<Self> {
        match env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Store directory for one unit's credentials.
    pub fn credentials_dir(&self, unit: &str) -> PathBuf {
        self.credentials_root.join(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdexec.json");
        fs::write(&path, r#"{ "cgroup_root": "/tmp/cg" }"#).unwrap();

        let cfg = PipelineConfig::load(&path).unwrap();
        assert_eq!(cfg.cgroup_root, PathBuf::from("/tmp/cg"));
        assert_eq!(cfg.credentials_root, PathBuf::from("/run/credentials"));
        assert_eq!(cfg.credential_search_path.len(), 3);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(PipelineConfig::load(&path).is_err());
    }

    #[test]
    fn credentials_dir_is_per_unit() {
        let cfg = PipelineConfig::default();
        assert_eq!(
            cfg.credentials_dir("db.service"),
            PathBuf::from("/run/credentials/db.service")
        );
    }
}
