//! CLI subcommand implementations.

pub mod rebuild;
pub mod run;
pub mod sessions;
pub mod vault;

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::cli::TargetArgs;
use crate::config::Config;
use crate::workspace;

/// Resolve the project directory from the CLI argument or the cwd,
/// canonicalized so directory-scoped workspaces and project keys are
/// stable.
pub fn resolve_project_dir(arg: &Option<PathBuf>) -> Result<PathBuf> {
    let dir = match arg {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("project directory {} does not exist", dir.display()))
}

/// Resolve the workspace name for a target, honoring the -w override.
pub fn resolve_workspace_name(cfg: &Config, target: &TargetArgs) -> Result<String> {
    let project_dir = resolve_project_dir(&target.project_dir)?;
    let active = workspace::resolve(
        cfg,
        &project_dir,
        target.workspace.as_deref().unwrap_or(""),
    )?;
    Ok(active
        .map(|a| a.workspace.name)
        .unwrap_or_else(|| "default".to_string()))
}
