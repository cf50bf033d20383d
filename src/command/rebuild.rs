//! `exitbox rebuild`: force-rebuild the image stack for a project.

use anyhow::Result;
use console::style;

use crate::cli::TargetArgs;
use crate::runtime::CliRuntime;
use crate::{config, image};

use super::resolve_project_dir;

pub fn execute(target: TargetArgs) -> Result<()> {
    let cfg = config::load_or_default();
    cfg.validate()?;
    let rt = CliRuntime::detect();
    let project_dir = resolve_project_dir(&target.project_dir)?;

    image::build_project(
        &rt,
        &cfg,
        &target.agent,
        &project_dir,
        target.workspace.as_deref().unwrap_or(""),
        true,
    )?;
    image::squid::build_squid(&rt, true)?;

    println!(
        "{} images rebuilt for {}",
        style("✔").green(),
        style(&target.agent).cyan()
    );
    Ok(())
}
