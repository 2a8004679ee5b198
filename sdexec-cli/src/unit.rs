//! Unit description files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use sdexec::{ExecCommand, ExecContext};
use serde::Deserialize;

/// A unit as read from JSON: an id, its execution context and the command
/// to run.
///
/// ```json
/// { "name": "web.service",
///   "context": { "user": "nobody", "private_tmp": true },
///   "exec": { "path": "/usr/bin/python3", "argv": ["python3", "-m", "http.server"] } }
/// ```
#[derive(Debug, Deserialize)]
pub struct UnitFile {
    /// Unit id.
    pub name: String,
    /// Execution context.
    #[serde(default)]
    pub context: ExecContext,
    /// Command to run, unless given on the command line.
    #[serde(default)]
    pub exec: Option<ExecCommand>,
    /// Extra `KEY=value` assignments passed as the base environment.
    #[serde(default)]
    pub environment: Vec<String>,
}

impl UnitFile {
    /// Reads `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let unit: Self =
            serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))?;
        if unit.name.is_empty() {
            bail!("{}: unit name is empty", path.display());
        }
        Ok(unit)
    }

    /// The command to run: `argv` from the command line when given,
    /// otherwise the unit's own.
    pub fn command(&self, argv: &[String]) -> Result<ExecCommand> {
        if let Some((program, args)) = argv.split_first() {
            let mut cmd = ExecCommand::new(program).args(args.iter().cloned());
            if let Some(own) = &self.exec {
                cmd.flags = own.flags;
            }
            return Ok(cmd);
        }
        self.exec
            .clone()
            .with_context(|| format!("unit {} has no command; pass one after --", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_unit_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web.json");
        fs::write(
            &path,
            r#"{ "name": "web.service",
                 "context": { "user": "nobody" },
                 "exec": { "path": "/bin/true", "argv": ["true"], "flags": { "ignore_failure": true } } }"#,
        )
        .unwrap();
        let unit = UnitFile::load(&path).unwrap();
        assert_eq!(unit.context.user.as_deref(), Some("nobody"));

        let own = unit.command(&[]).unwrap();
        assert_eq!(own.path, Path::new("/bin/true"));

        let argv = ["/bin/echo".to_owned(), "hi".to_owned()];
        let cmd = unit.command(&argv).unwrap();
        assert_eq!(cmd.argv, ["/bin/echo", "hi"]);
        assert!(cmd.flags.ignore_failure);
    }

    #[test]
    fn missing_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        fs::write(&path, r#"{ "name": "empty.service" }"#).unwrap();
        let unit = UnitFile::load(&path).unwrap();
        assert!(unit.command(&[]).is_err());

        fs::write(&path, r#"{ "name": "" }"#).unwrap();
        assert!(UnitFile::load(&path).is_err());
    }
}
