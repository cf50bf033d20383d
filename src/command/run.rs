//! `exitbox run`: build, wire up, and enter a sandboxed agent session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use tracing::info;

use crate::cli::TargetArgs;
use crate::runtime::CliRuntime;
use crate::sandbox::{self, SandboxOptions};
use crate::{agent, config, ipc, vault, workspace};

use super::resolve_project_dir;

/// How long one interactive approval covers subsequent reads of the key.
const APPROVAL_GRANT_TTL: Duration = Duration::from_secs(300);

pub fn execute(target: TargetArgs, resume: bool, allow: Vec<String>) -> Result<()> {
    let cfg = config::load_or_default();
    cfg.validate()?;
    let allowlist = config::load_allowlist_or_default();
    let rt = CliRuntime::detect();
    let project_dir = resolve_project_dir(&target.project_dir)?;
    let override_name = target.workspace.as_deref().unwrap_or("");

    let active = workspace::resolve(&cfg, &project_dir, override_name)?;
    let workspace_name = active
        .as_ref()
        .map(|a| a.workspace.name.clone())
        .unwrap_or_default();

    // Open the vault up front when this workspace uses one, so secrets
    // are servable over IPC for the whole session.
    let vault_enabled = active
        .as_ref()
        .map(|a| a.workspace.vault.enabled)
        .unwrap_or(false);
    let store = if vault_enabled && vault::is_initialized(&workspace_name) {
        let password = super::vault::prompt_password(&format!(
            "Vault password for workspace '{}': ",
            workspace_name
        ))?;
        Some(Arc::new(
            vault::open(&workspace_name, &password)
                .context("failed to unlock the workspace vault")?,
        ))
    } else {
        None
    };

    let opts = SandboxOptions {
        workspace_override: override_name.to_string(),
        auto_resume: resume,
        extra_domains: allow,
        force_rebuild: false,
        vault: store,
        approve: Some(approval_prompt()),
    };

    println!(
        "Starting {} in {}",
        style(agent::display_name(&target.agent)).cyan(),
        style(project_dir.display()).dim()
    );

    let mut sandbox = sandbox::prepare(&rt, &cfg, &allowlist, &target.agent, &project_dir, opts)?;
    info!(id = %sandbox.id, "sandbox prepared");

    let run_result = sandbox.start(&rt, &cfg);
    let stop_result = sandbox.stop(&rt);

    run_result?;
    stop_result
}

/// Synchronous host-side approval for one vault read: ask on the
/// controlling terminal, granting a TTL on "always".
fn approval_prompt() -> Arc<ipc::ApprovalFn> {
    Arc::new(|sandbox_id: &str, key: &str| {
        let term = console::Term::stderr();
        let prompt = format!(
            "Sandbox {} requests vault secret {}. Allow? [y/N/a(lways)] ",
            style(sandbox_id).dim(),
            style(key).yellow()
        );
        if term.write_str(&prompt).is_err() {
            return None;
        }
        match term.read_line() {
            Ok(answer) => match answer.trim().to_ascii_lowercase().as_str() {
                "a" | "always" => Some(APPROVAL_GRANT_TTL),
                "y" | "yes" => Some(Duration::ZERO),
                _ => None,
            },
            Err(_) => None,
        }
    })
}
