//! Project-directory keys and image naming.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Folder-safe key for a project directory, stable across invocations for
/// the same absolute path. Combines a readable slug of the last path
/// component with a short hash of the full path, so `/a/app` and `/b/app`
/// get distinct keys.
pub fn folder_key(project_dir: &Path) -> String {
    let slug: String = project_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let digest = Sha256::digest(project_dir.to_string_lossy().as_bytes());
    format!("{}-{}", slug, &hex::encode(digest)[..8])
}

/// Tag for a workspace-parameterized project image.
pub fn image_name(agent: &str, project_dir: &Path, workspace_hash: &str) -> String {
    format!(
        "exitbox-{}-{}:{}",
        agent,
        folder_key(project_dir),
        workspace_hash
    )
}
