//! CLI for the sdexec service execution pipeline.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod plan;
mod run;
mod unit;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use sdexec::{ExitStatus, PipelineConfig};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "SDEXEC_LOG";

#[derive(Parser)]
#[command(name = "sdexec", version, about = "Run programs the way a service manager does")]
struct Cli {
    /// Host configuration file (JSON). Defaults to `$SDEXEC_CONFIG`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn a unit's command and wait for it.
    Run(run::RunArgs),

    /// Show the stages, mounts and filters an attempt would apply.
    Plan(plan::PlanArgs),

    /// List the exit-status codes, or decode one.
    ExitStatus {
        /// Code to decode.
        code: Option<i32>,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for listing commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().dispatch() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("sdexec: {e:#}");
            std::process::exit(1);
        }
    }
}

impl Cli {
    /// Runs the subcommand; returns the process exit code.
    fn dispatch(self) -> Result<i32> {
        match self.command {
            Command::Run(args) => args.run(&load_config(self.config)?),
            Command::Plan(args) => args.show().map(|()| 0),
            Command::ExitStatus { code, format } => exit_status(code, format).map(|()| 0),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "sdexec", &mut std::io::stdout());
                Ok(0)
            }
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(&path).with_context(|| format!("loading {}", path.display())),
        None => PipelineConfig::from_env().context("loading configuration from $SDEXEC_CONFIG"),
    }
}

fn exit_status(code: Option<i32>, format: OutputFormat) -> Result<()> {
    let list: Vec<ExitStatus> = match code {
        Some(code) => {
            let status = ExitStatus::from_code(code)
                .with_context(|| format!("{code} is not a pipeline exit status"))?;
            vec![status]
        }
        None => ExitStatus::ALL.to_vec(),
    };

    if format == OutputFormat::Json {
        let rows: Vec<_> = list
            .iter()
            .map(|s| serde_json::json!({ "code": s.as_code(), "name": s.name(), "description": s.describe() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<5} {:<22} {}", "CODE".bold(), "NAME".bold(), "DESCRIPTION".bold());
    for s in list {
        println!("{:<5} {:<22} {}", s.as_code(), s.name(), s.describe());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_trailing_command() {
        let cli = Cli::try_parse_from(["sdexec", "run", "web.json", "--", "/bin/echo", "-n", "hi"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.command, ["/bin/echo", "-n", "hi"]);
    }

    #[test]
    fn parses_plan_format_and_global_config() {
        let cli =
            Cli::try_parse_from(["sdexec", "plan", "web.json", "--format", "json", "--config", "/etc/sdexec.json"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/sdexec.json")));
        assert!(matches!(cli.command, Command::Plan(ref a) if a.format == OutputFormat::Json));
    }

    #[test]
    fn exit_status_code_is_optional() {
        let cli = Cli::try_parse_from(["sdexec", "exit-status", "217"]).unwrap();
        assert!(matches!(cli.command, Command::ExitStatus { code: Some(217), .. }));
        assert!(Cli::try_parse_from(["sdexec", "exit-status"]).is_ok());
        assert!(Cli::try_parse_from(["sdexec", "frobnicate"]).is_err());
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert!(exit_status(Some(1), OutputFormat::Table).is_err());
        assert!(exit_status(Some(203), OutputFormat::Json).is_ok());
    }
}
