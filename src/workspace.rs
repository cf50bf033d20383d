//! Active-workspace resolution.
//!
//! The chain, first match wins: explicit override, directory-scoped
//! workspace whose directory prefixes the project dir (longest prefix,
//! ties by catalog order), the catalog's active selection, the configured
//! default, the first catalog entry.

use std::path::Path;

use anyhow::Result;

use crate::config::{Config, Workspace, WorkspaceScope};

/// The resolved workspace plus the scope it was selected under.
/// Directory-scoped selections must not leak across projects, so the
/// scope travels with the result.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveWorkspace {
    pub workspace: Workspace,
    pub scope: WorkspaceScope,
}

/// Resolve the active workspace for a project directory.
///
/// Returns `Ok(None)` when the catalog is empty and nothing was requested.
/// An unknown override is an error listing the valid names.
pub fn resolve(
    cfg: &Config,
    project_dir: &Path,
    override_name: &str,
) -> Result<Option<ActiveWorkspace>> {
    // 1. Explicit override wins unconditionally.
    if !override_name.is_empty() {
        return match cfg.workspaces.find(override_name) {
            Some(ws) => Ok(Some(ActiveWorkspace {
                workspace: ws.clone(),
                scope: ws.scope,
            })),
            None => anyhow::bail!(
                "unknown workspace '{}' (valid: {})",
                override_name,
                cfg.workspaces.names().join(", ")
            ),
        };
    }

    // 2. Directory-scoped workspace covering the project dir. Longest
    //    directory prefix wins; ties keep the earlier catalog entry.
    let mut best: Option<(&Workspace, usize)> = None;
    for ws in &cfg.workspaces.items {
        if ws.scope != WorkspaceScope::Directory {
            continue;
        }
        let Some(dir) = ws.directory.as_deref() else {
            continue;
        };
        if dir_covers(Path::new(dir), project_dir) {
            let len = dir.len();
            if best.is_none_or(|(_, best_len)| len > best_len) {
                best = Some((ws, len));
            }
        }
    }
    if let Some((ws, _)) = best {
        return Ok(Some(ActiveWorkspace {
            workspace: ws.clone(),
            scope: WorkspaceScope::Directory,
        }));
    }

    // 3. The catalog's active selection, if it still names an item.
    if !cfg.workspaces.active.is_empty()
        && let Some(ws) = cfg.workspaces.find(&cfg.workspaces.active)
    {
        return Ok(Some(ActiveWorkspace {
            workspace: ws.clone(),
            scope: ws.scope,
        }));
    }

    // 4. The configured default.
    if let Some(ws) = cfg.workspaces.find(&cfg.settings.default_workspace) {
        return Ok(Some(ActiveWorkspace {
            workspace: ws.clone(),
            scope: ws.scope,
        }));
    }

    // 5. First catalog entry, if any.
    Ok(cfg.workspaces.items.first().map(|ws| ActiveWorkspace {
        workspace: ws.clone(),
        scope: ws.scope,
    }))
}

/// Component-wise prefix check: `/a/b` covers `/a/b` and `/a/b/c`,
/// but not `/a/bc`.
fn dir_covers(dir: &Path, project_dir: &Path) -> bool {
    project_dir.starts_with(dir)
}
