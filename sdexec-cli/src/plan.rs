//! `sdexec plan`: show what an attempt would do without forking.

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;
use sdexec::namespace::MountKind;
use sdexec::sandbox::seccomp::SyscallFilter;
use sdexec::{ExecParameters, HostFacts, Plan};
use serde_json::json;

use crate::OutputFormat;
use crate::unit::UnitFile;

/// Privileges to plan for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Privileges {
    /// Probe the calling process.
    #[default]
    Probe,
    /// A root service manager.
    Root,
    /// An unprivileged user manager.
    User,
}

impl Privileges {
    fn facts(self) -> HostFacts {
        match self {
            Self::Probe => HostFacts::probe(),
            Self::Root => HostFacts::root(),
            Self::User => HostFacts::unprivileged(),
        }
    }
}

/// Arguments for `sdexec plan`.
#[derive(clap::Args)]
pub struct PlanArgs {
    /// Unit description (JSON).
    unit: PathBuf,

    /// Privileges to plan for.
    #[arg(long = "as", default_value = "probe")]
    privileges: Privileges,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub(crate) format: OutputFormat,
}

fn filter_summary(name: &str, filter: &SyscallFilter) -> serde_json::Value {
    json!({
        "name": name,
        "default": filter.default,
        "rules": filter.rules.len(),
    })
}

/// Kebab-case variant name, without payload.
fn kind_label(kind: &MountKind) -> String {
    match serde_json::to_value(kind) {
        Ok(serde_json::Value::String(name)) => name,
        Ok(serde_json::Value::Object(map)) => map.keys().next().cloned().unwrap_or_default(),
        _ => String::new(),
    }
}

impl PlanArgs {
    /// Prints the plan.
    pub fn show(self) -> Result<()> {
        let unit = UnitFile::load(&self.unit)?;
        let command = unit.command(&[])?;
        let params = ExecParameters::new();
        let plan = Plan::build(&unit.context, &params, &command, self.privileges.facts(), false)
            .with_context(|| format!("planning {}", unit.name))?;
        let ns = plan.namespace(&unit.context, &params);

        let mut filters: Vec<_> = plan
            .surface
            .restrictions
            .iter()
            .map(|(r, f)| filter_summary(r.name(), f))
            .collect();
        if let Some(f) = &plan.surface.syscall_filter {
            filters.push(filter_summary("syscall-filter", f));
        }

        if self.format == OutputFormat::Json {
            let obj = json!({
                "unit": unit.name,
                "stages": plan.stages,
                "namespace": ns,
                "filters": filters,
            });
            println!("{}", serde_json::to_string_pretty(&obj)?);
            return Ok(());
        }

        println!("{} {}", "unit:".bold(), unit.name);
        println!("{:<4} {:<26} {}", "#".bold(), "STAGE".bold(), "ON FAILURE".bold());
        for (i, stage) in plan.stages.iter().enumerate() {
            let status = stage.exit_status().map_or("(varies)", |s| s.name());
            println!("{:<4} {:<26} {}", i + 1, stage.name(), status);
        }

        if !ns.is_empty() {
            println!();
            if let Some(root) = &ns.root {
                println!("{} {}", "root:".bold(), root.display());
            }
            println!("{:<10} {:<4} {:<40} {}", "KIND".bold(), "RO".bold(), "DESTINATION".bold(), "SOURCE".bold());
            for m in &ns.mounts {
                let source = m.source.as_ref().map_or_else(|| "-".to_owned(), |s| s.display().to_string());
                let ro = if m.read_only { "yes" } else { "" };
                println!("{:<10} {:<4} {:<40} {}", kind_label(&m.kind), ro, m.destination.display(), source);
            }
            for link in &ns.symlinks {
                println!("{:<10} {:<4} {:<40} {}", "symlink", "", link.link.display(), link.target.display());
            }
        }

        if !filters.is_empty() {
            println!();
            println!("{:<26} {:<14} {}", "FILTER".bold(), "DEFAULT".bold(), "RULES".bold());
            for f in &filters {
                println!("{:<26} {:<14} {}", f["name"].as_str().unwrap_or("?"), f["default"], f["rules"]);
            }
        }
        Ok(())
    }
}
