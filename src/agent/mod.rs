//! Agent registry: the coding agents ExitBox can run.
//!
//! Agents are opaque processes; the registry only knows how to install
//! them into an image (with checksum verification), which credential
//! paths to mount, and how to resume a previous conversation.

mod claude;
mod codex;
mod opencode;

use std::path::{Path, PathBuf};

pub use claude::Claude;
pub use codex::Codex;
pub use opencode::OpenCode;

/// Canonical agent names, in registry order.
pub const AGENT_NAMES: &[&str] = &["claude", "codex", "opencode"];

/// A bind mount into the agent container.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// One supported coding agent.
pub trait Agent: Send + Sync + std::fmt::Debug {
    /// Canonical lowercase name ("claude").
    fn name(&self) -> &'static str;

    /// Human-readable name ("Claude Code").
    fn display_name(&self) -> &'static str;

    /// Release artifact name for the current architecture.
    fn binary_name(&self) -> String;

    /// The command executed inside the container.
    fn command(&self) -> &'static str {
        self.name()
    }

    /// Dockerfile instructions that download and install the agent binary.
    /// The snippet MUST verify a SHA-256 checksum before the artifact is
    /// executed or installed; on mismatch the build fails and the download
    /// is deleted.
    fn dockerfile_install(&self, version: &str) -> String;

    /// Credential/config bind mounts, sourced from the per-agent config
    /// directory on the host and targeted at the container user's home.
    fn container_mounts(&self, cfg_dir: &Path) -> Vec<Mount>;

    /// CLI arguments that resume a previous conversation from a captured
    /// token. Empty token means no resume.
    fn resume_args(&self, token: &str) -> Vec<String>;

    /// Extract a resume token from terminal scrollback, per this agent's
    /// convention. Returns None when nothing resumable was printed.
    fn resume_token_from_scrollback(&self, scrollback: &str) -> Option<String>;
}

/// Look up an agent by canonical name.
pub fn get(name: &str) -> Option<Box<dyn Agent>> {
    match name {
        "claude" => Some(Box::new(Claude)),
        "codex" => Some(Box::new(Codex)),
        "opencode" => Some(Box::new(OpenCode)),
        _ => None,
    }
}

/// Look up an agent or fail with the list of valid names.
pub fn get_or_err(name: &str) -> anyhow::Result<Box<dyn Agent>> {
    get(name).ok_or_else(|| {
        anyhow::anyhow!(
            "unknown agent '{}' (valid: {})",
            name,
            AGENT_NAMES.join(", ")
        )
    })
}

pub fn is_valid(name: &str) -> bool {
    AGENT_NAMES.contains(&name)
}

/// Human-readable name for an agent, falling back to the input.
pub fn display_name(name: &str) -> String {
    get(name)
        .map(|a| a.display_name().to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Map the build architecture to the (x64-ish, arm64-ish) pair used in
/// release artifact names, picking the matching element.
pub(crate) fn arch_select(x64: &'static str, arm64: &'static str) -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => arm64,
        _ => x64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names() {
        assert_eq!(display_name("claude"), "Claude Code");
        assert_eq!(display_name("codex"), "OpenAI Codex");
        assert_eq!(display_name("opencode"), "OpenCode");
        assert_eq!(display_name("unknown"), "unknown");
    }

    #[test]
    fn validity() {
        assert!(is_valid("claude"));
        assert!(is_valid("codex"));
        assert!(is_valid("opencode"));
        assert!(!is_valid("Claude"));
        assert!(!is_valid(""));
        assert!(!is_valid("gemini"));
    }

    #[test]
    fn registry_returns_all_names() {
        assert_eq!(AGENT_NAMES.len(), 3);
        for name in AGENT_NAMES {
            let agent = get(name).expect("registered agent");
            assert_eq!(agent.name(), *name);
        }
    }

    #[test]
    fn registry_unknown_is_none() {
        assert!(get("nonexistent").is_none());
        let err = get_or_err("nonexistent").unwrap_err();
        assert!(err.to_string().contains("claude, codex, opencode"));
    }

    #[test]
    fn install_snippets_verify_checksums() {
        for name in AGENT_NAMES {
            let agent = get(name).unwrap();
            let snippet = agent.dockerfile_install("");
            assert!(
                snippet.contains("sha256sum"),
                "{} install must verify a SHA-256 checksum",
                name
            );
            assert!(snippet.contains(agent.command()));
        }
    }

    #[test]
    fn mounts_target_container_home() {
        for name in AGENT_NAMES {
            let agent = get(name).unwrap();
            for mount in agent.container_mounts(Path::new("/cfg")) {
                assert!(
                    mount.target.starts_with("/home/user/"),
                    "{} mount target {} escapes the container home",
                    name,
                    mount.target
                );
            }
        }
    }

    #[test]
    fn empty_token_yields_no_resume_args() {
        for name in AGENT_NAMES {
            let agent = get(name).unwrap();
            assert!(agent.resume_args("").is_empty());
        }
    }
}
