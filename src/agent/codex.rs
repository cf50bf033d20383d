//! OpenAI Codex agent.

use std::path::Path;

use super::{Agent, Mount, arch_select};

#[derive(Debug)]
pub struct Codex;

impl Agent for Codex {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn display_name(&self) -> &'static str {
        "OpenAI Codex"
    }

    fn binary_name(&self) -> String {
        format!(
            "codex-{}.tar.gz",
            arch_select("x86_64-unknown-linux-musl", "aarch64-unknown-linux-musl")
        )
    }

    fn dockerfile_install(&self, version: &str) -> String {
        let artifact = self.binary_name();
        let mut out = String::new();
        if !version.is_empty() {
            out.push_str(&format!("ARG CODEX_VERSION={version}\n"));
        }
        let release_path = if version.is_empty() {
            "latest/download".to_string()
        } else {
            "download/${CODEX_VERSION}".to_string()
        };
        out.push_str(&format!(
            r#"RUN set -e && \
    BASE_URL="https://github.com/openai/codex/releases/{release_path}" && \
    wget -q -O /tmp/{artifact} "${{BASE_URL}}/{artifact}" && \
    wget -q -O /tmp/checksums.txt "${{BASE_URL}}/checksums.txt" && \
    CHECKSUM="$(grep ' {artifact}$' /tmp/checksums.txt | cut -d' ' -f1)" && \
    test -n "$CHECKSUM" && \
    (echo "${{CHECKSUM}}  /tmp/{artifact}" | sha256sum -c - || {{ rm -f /tmp/{artifact}; exit 1; }}) && \
    mkdir -p /tmp/codex-extract && \
    tar -xzf /tmp/{artifact} -C /tmp/codex-extract && \
    install -m 0755 /tmp/codex-extract/codex* /usr/local/bin/codex && \
    rm -rf /tmp/codex-extract /tmp/{artifact} /tmp/checksums.txt
"#
        ));
        out
    }

    fn container_mounts(&self, cfg_dir: &Path) -> Vec<Mount> {
        vec![
            Mount {
                source: cfg_dir.join(".codex"),
                target: "/home/user/.codex".to_string(),
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
        vec!["resume".to_string(), "--last".to_string()]
    }

    fn resume_token_from_scrollback(&self, scrollback: &str) -> Option<String> {
        // Codex resumes its most recent conversation; any output at all
        // means there is something to resume.
        if scrollback.trim().is_empty() {
            None
        } else {
            Some("last".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_is_always_last() {
        let c = Codex;
        assert_eq!(
            c.resume_token_from_scrollback("codex ran here").as_deref(),
            Some("last")
        );
        assert!(c.resume_token_from_scrollback("   ").is_none());
        assert_eq!(c.resume_args("last"), vec!["resume", "--last"]);
    }

    #[test]
    fn binary_name_is_musl_tarball() {
        let c = Codex;
        let name = c.binary_name();
        assert!(name.starts_with("codex-"));
        assert!(name.ends_with("-unknown-linux-musl.tar.gz"));
    }

    #[test]
    fn install_pins_version_via_build_arg() {
        let c = Codex;
        let snippet = c.dockerfile_install("v0.1.0");
        assert!(snippet.contains("ARG CODEX_VERSION=v0.1.0"));
        assert!(snippet.contains("sha256sum -c"));
    }

    #[test]
    fn mounts_cover_codex_config() {
        let c = Codex;
        let mounts = c.container_mounts(Path::new("/cfg"));
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].target, "/home/user/.codex");
    }
}
