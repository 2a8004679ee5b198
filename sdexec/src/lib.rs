//! Service execution and sandboxing pipeline.
//!
//! `sdexec` turns a declarative [`ExecContext`] plus per-invocation
//! [`ExecParameters`] into a running, sandboxed process: it forks, walks an
//! ordered list of setup [stages](pipeline::Stage) in the child (identity,
//! standard streams, directories, credentials, namespaces, capabilities,
//! seccomp) and finally calls `execve`. A stage that fails terminates the
//! child with a stable [`ExitStatus`] code the caller decodes.
//!
//! # Quick start
//!
//! ```no_run
//! use sdexec::{ExecCommand, ExecContext, ExecParameters};
//!
//! let ctx: ExecContext = serde_json::from_str(r#"{ "user": "nobody", "private_tmp": true }"#)?;
//! let cmd = ExecCommand::new("/usr/bin/sleep").args(["10"]);
//! let pid = sdexec::spawn("sleep.service", &cmd, &ctx, &ExecParameters::new(), None, None)?;
//! # let _ = pid;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Only Linux is supported.

pub mod cgroup;
mod channel;
pub mod config;
pub mod confirm;
pub mod context;
pub mod credentials;
pub mod env;
mod error;
pub mod identity;
pub mod limits;
pub mod manager;
pub mod namespace;
pub mod params;
pub mod pipeline;
pub mod runtime;
pub mod sandbox;
pub mod session;
pub mod status;
pub mod stdio;
mod sys;

pub use config::PipelineConfig;
pub use context::ExecContext;
pub use error::{Error, Result, StageError};
pub use params::{ExecCommand, ExecFlags, ExecParameters};
pub use pipeline::{Pipeline, Plan, Stage, plan_stages, spawn};
pub use sandbox::HostFacts;
pub use status::ExitStatus;
