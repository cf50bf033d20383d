//! `exitbox sessions`: list and remove stored sessions.

use anyhow::Result;
use console::style;

use crate::cli::SessionsCommands;
use crate::{config, session};

use super::{resolve_project_dir, resolve_workspace_name};

pub fn execute(command: SessionsCommands) -> Result<()> {
    match command {
        SessionsCommands::List { target } => {
            let cfg = config::load_or_default();
            let workspace = resolve_workspace_name(&cfg, &target)?;
            let project_dir = resolve_project_dir(&target.project_dir)?;

            let names = session::list_names(&workspace, &target.agent, &project_dir)?;
            if names.is_empty() {
                println!("No stored sessions for this project");
                return Ok(());
            }
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }
        SessionsCommands::Rm { target, selector } => {
            let cfg = config::load_or_default();
            let workspace = resolve_workspace_name(&cfg, &target)?;
            let project_dir = resolve_project_dir(&target.project_dir)?;

            let (name, found) =
                session::resolve_selector(&workspace, &target.agent, &project_dir, &selector)?;
            if !found {
                anyhow::bail!("no session matches '{}'", selector);
            }

            let removed = session::remove_by_name(&workspace, &target.agent, &project_dir, &name)?;
            if !removed {
                anyhow::bail!("no session named '{}'", name);
            }
            println!("{} removed session '{}'", style("✔").green(), name);
            Ok(())
        }
    }
}
