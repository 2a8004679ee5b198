//! The service manager as seen from one execution attempt.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::Result;

/// Manager-side state the pipeline consults.
pub trait Manager {
    /// Whether confirmation prompts are enabled manager-wide.
    fn confirm_spawn_enabled(&self) -> bool;
    /// Turns confirmation prompts off for all later spawns.
    fn disable_confirm_spawn(&self) -> Result<()>;
    /// Writes a dump of the manager state.
    fn dump_state(&self, out: &mut dyn Write) -> io::Result<()>;
    /// Writes the queued jobs.
    fn dump_jobs(&self, out: &mut dyn Write) -> io::Result<()>;
    /// Writes what the manager knows about `unit`.
    fn unit_info(&self, unit: &str, out: &mut dyn Write) -> io::Result<()>;
}

/// Stand-alone manager whose only shared state is a flag file disabling
/// confirmation prompts.
#[derive(Debug, Clone)]
pub struct FlagFileManager {
    /// Present when prompts are disabled.
    flag: PathBuf,
}

impl FlagFileManager {
    /// Manager keyed on `flag`.
    pub fn new(flag: impl Into<PathBuf>) -> Self {
        Self { flag: flag.into() }
    }
}

impl Manager for FlagFileManager {
    fn confirm_spawn_enabled(&self) -> bool {
        !self.flag.exists()
    }

    fn disable_confirm_spawn(&self) -> Result<()> {
        if let Some(parent) = self.flag.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.flag, b"")?;
        tracing::info!(flag = %self.flag.display(), "confirmation prompts disabled");
        Ok(())
    }

    fn dump_state(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Manager PID: {}", std::process::id())?;
        writeln!(
            out,
            "Confirm spawn: {}",
            if self.confirm_spawn_enabled() { "yes" } else { "no" }
        )
    }

    fn dump_jobs(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "No jobs.")
    }

    fn unit_info(&self, unit: &str, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Unit: {unit}")
    }
}
