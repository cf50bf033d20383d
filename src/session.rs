//! Persistent session and resume-token state, keyed by
//! (workspace, agent, project).
//!
//! Layout: `<data>/profiles/global/<workspace>/<agent>/projects/<project_key>/`
//! holds a `sessions/` tree (one subdirectory per session, with a `.name`
//! label file and optional agent-native state), an optional
//! `.active-session` pointer, and the `.resume-token` file written when an
//! interactive run ends.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::config;
use crate::project;

const NAME_FILE: &str = ".name";
const ACTIVE_FILE: &str = ".active-session";
const RESUME_TOKEN_FILE: &str = ".resume-token";

/// The project-scoped resume directory for a workspace/agent.
pub fn project_resume_dir(workspace: &str, agent: &str, project_dir: &Path) -> PathBuf {
    config::data_dir()
        .join("profiles")
        .join("global")
        .join(workspace)
        .join(agent)
        .join("projects")
        .join(project::folder_key(project_dir))
}

/// The project-scoped sessions directory.
pub fn project_sessions_dir(workspace: &str, agent: &str, project_dir: &Path) -> PathBuf {
    project_resume_dir(workspace, agent, project_dir).join("sessions")
}

fn read_session_name(session_dir: &Path) -> Option<String> {
    let raw = fs::read_to_string(session_dir.join(NAME_FILE)).ok()?;
    let name = raw.trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

/// All named sessions for a workspace/agent/project: whitespace-trimmed,
/// empties and duplicates dropped, sorted ascending.
pub fn list_names(workspace: &str, agent: &str, project_dir: &Path) -> Result<Vec<String>> {
    let sessions_dir = project_sessions_dir(workspace, agent, project_dir);
    let entries = match fs::read_dir(&sessions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("read sessions dir"),
    };

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = read_session_name(&entry.path()) else {
            continue;
        };
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out.sort();
    Ok(out)
}

/// Remove every stored instance of a named session. When something was
/// removed and the active-session pointer named it, the pointer goes too.
/// Returns whether at least one session directory was removed.
pub fn remove_by_name(
    workspace: &str,
    agent: &str,
    project_dir: &Path,
    session_name: &str,
) -> Result<bool> {
    let session_name = session_name.trim();
    if session_name.is_empty() {
        bail!("session name cannot be empty");
    }

    let sessions_dir = project_sessions_dir(workspace, agent, project_dir);
    let entries = match fs::read_dir(&sessions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).context("read sessions dir"),
    };

    let mut removed = false;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if read_session_name(&entry.path()).as_deref() != Some(session_name) {
            continue;
        }
        fs::remove_dir_all(entry.path())
            .with_context(|| format!("remove session '{}'", session_name))?;
        removed = true;
    }

    if removed {
        let active_file =
            project_resume_dir(workspace, agent, project_dir).join(ACTIVE_FILE);
        if let Ok(raw) = fs::read_to_string(&active_file)
            && raw.trim() == session_name
        {
            let _ = fs::remove_file(&active_file);
        }
    }
    Ok(removed)
}

/// Resolve a session selector to its canonical session name.
///
/// Tried in order: exact session name, exact directory id, unique
/// directory-id prefix. Multiple prefix matches are an error; no match
/// resolves to `(String::new(), false)`.
pub fn resolve_selector(
    workspace: &str,
    agent: &str,
    project_dir: &Path,
    selector: &str,
) -> Result<(String, bool)> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Ok((String::new(), false));
    }

    let sessions_dir = project_sessions_dir(workspace, agent, project_dir);
    let entries = match fs::read_dir(&sessions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((String::new(), false));
        }
        Err(e) => return Err(e).context("read sessions dir"),
    };

    let mut prefix_matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().to_string();
        let Some(name) = read_session_name(&entry.path()) else {
            continue;
        };
        if name == selector || dir_name == selector {
            return Ok((name, true));
        }
        if dir_name.starts_with(selector) {
            prefix_matches.push(name);
        }
    }

    match prefix_matches.len() {
        0 => Ok((String::new(), false)),
        1 => Ok((prefix_matches.remove(0), true)),
        _ => bail!("session id prefix '{}' is ambiguous", selector),
    }
}

// ── Resume tokens ───────────────────────────────────────────────────────

/// Path of the resume-token file inside a resume directory.
pub fn resume_token_path(resume_dir: &Path) -> PathBuf {
    resume_dir.join(RESUME_TOKEN_FILE)
}

/// Persist a captured resume token.
pub fn write_resume_token(resume_dir: &Path, token: &str) -> Result<()> {
    fs::create_dir_all(resume_dir)
        .with_context(|| format!("Failed to create {}", resume_dir.display()))?;
    fs::write(resume_token_path(resume_dir), token).context("write resume token")?;
    debug!(dir = %resume_dir.display(), "resume token written");
    Ok(())
}

/// The stored resume token, if any. Whitespace is trimmed; an empty file
/// counts as no token.
pub fn read_resume_token(resume_dir: &Path) -> Option<String> {
    let raw = fs::read_to_string(resume_token_path(resume_dir)).ok()?;
    let token = raw.trim().to_string();
    if token.is_empty() { None } else { Some(token) }
}

/// Drop the stored token (auto-resume turned off).
pub fn clear_resume_token(resume_dir: &Path) {
    let _ = fs::remove_file(resume_token_path(resume_dir));
}
