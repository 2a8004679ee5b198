//! Interactive confirmation before a program is executed.

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use colored::Colorize;

use crate::manager::Manager;
use crate::params::ExecCommand;

/// Outcome of a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Confirmation {
    /// Run the program.
    Execute,
    /// Do not run it and report success.
    PretendSuccess,
    /// Do not run it and report failure.
    PretendFailure,
    /// Run it, and stop asking for later spawns.
    ContinueWithoutAsking,
}

impl Confirmation {
    /// Whether the program is executed.
    pub const fn executes(self) -> bool {
        matches!(self, Self::Execute | Self::ContinueWithoutAsking)
    }
}

const HELP: &str = "\
  c - continue, proceed without asking anymore
  D - dump, show the state of the unit
  f - fail, don't execute the command and pretend it failed
  h - help
  i - info, show a short summary of the unit
  j - jobs, show jobs that are in progress
  s - skip, don't execute the command and pretend it succeeded
  y - yes, execute the command
";

/// Asks whether to run `command` until a deciding key is given.
///
/// End of input counts as a refusal: the attempt fails without running.
pub fn ask<R: BufRead, W: Write>(
    input: &mut R,
    out: &mut W,
    manager: &dyn Manager,
    unit: &str,
    command: &ExecCommand,
) -> io::Result<Confirmation> {
    let mut line = String::new();
    loop {
        write!(
            out,
            "{} {}? [y, f, s - h for help] ",
            "Execute".bold(),
            command.command_line()
        )?;
        out.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(out)?;
            tracing::warn!(unit, "no answer on console, failing execution");
            return Ok(Confirmation::PretendFailure);
        }
        match line.trim().chars().next() {
            Some('y') => return Ok(Confirmation::Execute),
            Some('f') => {
                writeln!(out, "Failing execution.")?;
                return Ok(Confirmation::PretendFailure);
            }
            Some('s') => {
                writeln!(out, "Skipping execution.")?;
                return Ok(Confirmation::PretendSuccess);
            }
            Some('c') => {
                writeln!(out, "Continuing without asking again.")?;
                if let Err(e) = manager.disable_confirm_spawn() {
                    tracing::warn!(error = %e, "cannot disable confirmation prompts");
                }
                return Ok(Confirmation::ContinueWithoutAsking);
            }
            Some('D') => manager.dump_state(out)?,
            Some('i') => {
                writeln!(out, "  Unit:    {unit}")?;
                writeln!(out, "  Command: {}", command.command_line())?;
                writeln!(out, "  Path:    {}", command.path.display())?;
                manager.unit_info(unit, out)?;
            }
            Some('j') => manager.dump_jobs(out)?,
            Some('h') => out.write_all(HELP.as_bytes())?,
            _ => writeln!(out, "{}", "Unknown answer, h for help.".yellow())?,
        }
    }
}

/// Asks on the terminal at `console`.
///
/// A console that cannot be opened counts as a refusal.
pub fn ask_console(
    console: &Path,
    manager: &dyn Manager,
    unit: &str,
    command: &ExecCommand,
) -> io::Result<Confirmation> {
    let tty = match OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
        .open(console)
    {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(console = %console.display(), error = %e, "cannot open console, failing execution");
            return Ok(Confirmation::PretendFailure);
        }
    };
    let mut out = tty.try_clone()?;
    ask(&mut BufReader::new(tty), &mut out, manager, unit, command)
}
