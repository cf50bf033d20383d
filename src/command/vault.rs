//! `exitbox vault`: encrypted secret management for workspaces.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use console::{Term, style};

use crate::cli::VaultCommands;
use crate::cmd::Cmd;
use crate::{config, vault, workspace};

pub fn execute(command: VaultCommands) -> Result<()> {
    match command {
        VaultCommands::Init { workspace } => init(&resolve_vault_workspace(workspace)?),
        VaultCommands::Set { workspace, key } => set(&resolve_vault_workspace(workspace)?, &key),
        VaultCommands::Get { workspace, key } => get(&resolve_vault_workspace(workspace)?, &key),
        VaultCommands::List { workspace } => list(&resolve_vault_workspace(workspace)?),
        VaultCommands::Delete { workspace, key } => {
            delete(&resolve_vault_workspace(workspace)?, &key)
        }
        VaultCommands::Import { workspace, file } => {
            import(&resolve_vault_workspace(workspace)?, &file)
        }
        VaultCommands::Edit { workspace } => edit(&resolve_vault_workspace(workspace)?),
        VaultCommands::Status { workspace } => status(&resolve_vault_workspace(workspace)?),
        VaultCommands::Destroy { workspace, force } => {
            destroy(&resolve_vault_workspace(workspace)?, force)
        }
    }
}

/// The workspace a vault command targets: the -w flag, or whatever the
/// resolver picks for the current directory.
fn resolve_vault_workspace(flag: Option<String>) -> Result<String> {
    if let Some(name) = flag {
        return Ok(name);
    }
    let cfg = config::load_or_default();
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let active = workspace::resolve(&cfg, &cwd, "")?;
    Ok(active
        .map(|a| a.workspace.name)
        .unwrap_or_else(|| "default".to_string()))
}

/// Read a line with terminal echo disabled.
pub fn prompt_password(prompt: &str) -> Result<String> {
    let term = Term::stderr();
    term.write_str(prompt)?;
    term.read_secure_line().context("failed to read password")
}

fn require_initialized(ws: &str) -> Result<()> {
    if !vault::is_initialized(ws) {
        bail!(
            "no vault for workspace '{}'. Run 'exitbox vault init -w {}' first",
            ws,
            ws
        );
    }
    Ok(())
}

fn init(ws: &str) -> Result<()> {
    if vault::is_initialized(ws) {
        bail!("vault already initialized for workspace '{}'", ws);
    }

    let password = prompt_password("Enter vault password: ")?;
    if password.is_empty() {
        bail!("password cannot be empty");
    }
    let confirm = prompt_password("Confirm vault password: ")?;
    if password != confirm {
        bail!("passwords do not match");
    }

    crate::spinner::with_spinner("Initializing vault", || vault::init(ws, &password))?;

    // Flip the vault on in the workspace config so runs pick it up.
    let mut cfg = config::load_or_default();
    if let Some(item) = cfg.workspaces.items.iter_mut().find(|w| w.name == ws) {
        item.vault.enabled = true;
        if let Err(e) = config::save_config(&cfg) {
            eprintln!("warning: failed to save config: {}", e);
        }
    }

    println!(
        "{} vault initialized for workspace '{}'",
        style("✔").green(),
        ws
    );
    Ok(())
}

fn set(ws: &str, key: &str) -> Result<()> {
    require_initialized(ws)?;
    let password = prompt_password("Enter vault password: ")?;
    // The value is prompted with echo off so it never lands in shell
    // history or process listings.
    let value = prompt_password(&format!("Enter value for {}: ", key))?;
    if value.is_empty() {
        bail!("value cannot be empty");
    }

    vault::quick_set(ws, &password, key, &value)?;
    println!("{} set '{}' in vault for workspace '{}'", style("✔").green(), key, ws);
    Ok(())
}

fn get(ws: &str, key: &str) -> Result<()> {
    require_initialized(ws)?;
    let password = prompt_password("Enter vault password: ")?;
    let value = vault::quick_get(ws, &password, key)?;
    println!("{}", value);
    Ok(())
}

fn list(ws: &str) -> Result<()> {
    require_initialized(ws)?;
    let password = prompt_password("Enter vault password: ")?;
    let keys = vault::quick_list(ws, &password)?;
    if keys.is_empty() {
        println!("Vault is empty");
        return Ok(());
    }
    for key in keys {
        println!("{}", key);
    }
    Ok(())
}

fn delete(ws: &str, key: &str) -> Result<()> {
    require_initialized(ws)?;
    let password = prompt_password("Enter vault password: ")?;
    vault::quick_delete(ws, &password, key)?;
    println!(
        "{} deleted '{}' from vault for workspace '{}'",
        style("✔").green(),
        key,
        ws
    );
    Ok(())
}

fn import(ws: &str, file: &Path) -> Result<()> {
    require_initialized(ws)?;
    let password = prompt_password("Enter vault password: ")?;
    vault::import_env_file(ws, &password, file)?;
    println!(
        "{} imported {} into vault for workspace '{}'",
        style("✔").green(),
        file.display(),
        ws
    );
    Ok(())
}

/// Export the vault to a private temp file, run $EDITOR, and replace the
/// vault's contents with whatever comes back.
fn edit(ws: &str) -> Result<()> {
    require_initialized(ws)?;
    let password = prompt_password("Enter vault password: ")?;

    let store = vault::open(ws, &password)?;
    let entries = store.all()?;

    let mut tmp = tempfile::Builder::new()
        .prefix("exitbox-vault-")
        .suffix(".env")
        .tempfile()
        .context("failed to create temp file")?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.write_all(vault::export_env_format(&entries).as_bytes())?;
    tmp.flush()?;

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = Cmd::new(&editor)
        .arg(tmp.path().display().to_string())
        .run_interactive()?;
    if !status.success() {
        bail!("editor exited with an error, vault unchanged");
    }

    let edited = std::fs::read_to_string(tmp.path())?;
    let parsed = vault::parse_env_file(&edited);
    store.replace_all(&parsed)?;

    println!(
        "{} vault for workspace '{}' now holds {} secrets",
        style("✔").green(),
        ws,
        parsed.len()
    );
    Ok(())
}

fn status(ws: &str) -> Result<()> {
    if vault::is_initialized(ws) {
        println!("Vault for workspace '{}': {}", ws, style("initialized").green());
    } else {
        println!("Vault for workspace '{}': {}", ws, style("not initialized").dim());
    }
    Ok(())
}

fn destroy(ws: &str, force: bool) -> Result<()> {
    require_initialized(ws)?;
    if !force {
        let term = Term::stderr();
        term.write_str(&format!(
            "Permanently delete the vault for workspace '{}'? Type the workspace name to confirm: ",
            ws
        ))?;
        let answer = term.read_line()?;
        if answer.trim() != ws {
            bail!("confirmation did not match, aborting");
        }
    }

    vault::destroy(ws)?;

    let mut cfg = config::load_or_default();
    if let Some(item) = cfg.workspaces.items.iter_mut().find(|w| w.name == ws) {
        item.vault.enabled = false;
        let _ = config::save_config(&cfg);
    }

    println!("{} vault destroyed for workspace '{}'", style("✔").green(), ws);
    Ok(())
}
