//! Claude Code agent.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use super::{Agent, Mount, arch_select};

#[derive(Debug)]
pub struct Claude;

/// Matches `--resume <tok>` or `-r <tok>` as printed by the CLI on exit.
/// Kept narrow: token charset is the id alphabet Claude actually emits.
fn resume_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)(?:--resume|-r)\s+([A-Za-z0-9_-]+)").unwrap())
}

impl Agent for Claude {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn binary_name(&self) -> String {
        format!(
            "claude-{}",
            arch_select("linux-x64-musl", "linux-arm64-musl")
        )
    }

    fn dockerfile_install(&self, version: &str) -> String {
        let platform = arch_select("linux-x64-musl", "linux-arm64-musl");
        let version_expr = if version.is_empty() {
            r#"$(wget -qO- "${BASE_URL}/stable")"#.to_string()
        } else {
            version.to_string()
        };
        format!(
            r#"RUN set -e && \
    BASE_URL="https://storage.googleapis.com/claude-code-dist-86c565f3-f756-42ad-8dfa-d59b1c096819/claude-code-releases" && \
    VERSION="{version_expr}" && \
    CHECKSUM="$(wget -qO- "${{BASE_URL}}/${{VERSION}}/manifest.json" | jq -r '.platforms["{platform}"].checksum')" && \
    test -n "$CHECKSUM" && \
    wget -q -O /tmp/claude "${{BASE_URL}}/${{VERSION}}/{platform}/claude" && \
    (echo "${{CHECKSUM}}  /tmp/claude" | sha256sum -c - || {{ rm -f /tmp/claude; exit 1; }}) && \
    install -m 0755 /tmp/claude /usr/local/bin/claude && \
    rm -f /tmp/claude
"#
        )
    }

    fn container_mounts(&self, cfg_dir: &Path) -> Vec<Mount> {
        vec![
            Mount {
                source: cfg_dir.join(".claude"),
                target: "/home/user/.claude".to_string(),
                read_only: false,
            },
            Mount {
                source: cfg_dir.join(".claude.json"),
                target: "/home/user/.claude.json".to_string(),
                read_only: false,
            },
            Mount {
                source: cfg_dir.join(".config"),
                target: "/home/user/.config".to_string(),
                read_only: false,
            },
        ]
    }

    fn resume_args(&self, token: &str) -> Vec<String> {
        if token.is_empty() {
            return Vec::new();
        }
        vec!["--resume".to_string(), token.to_string()]
    }

    fn resume_token_from_scrollback(&self, scrollback: &str) -> Option<String> {
        resume_re()
            .captures(scrollback)
            .map(|caps| caps[1].to_string())
    }
}
