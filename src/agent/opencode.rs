//! OpenCode agent.

use std::path::Path;

use super::{Agent, Mount, arch_select};

#[derive(Debug)]
pub struct OpenCode;

impl Agent for OpenCode {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn display_name(&self) -> &'static str {
        "OpenCode"
    }

    fn binary_name(&self) -> String {
        format!(
            "opencode-{}.tar.gz",
            arch_select("linux-x64-musl", "linux-arm64-musl")
        )
    }

    fn dockerfile_install(&self, version: &str) -> String {
        let artifact = self.binary_name();
        let mut out = String::new();
        if !version.is_empty() {
            out.push_str(&format!("ARG OPENCODE_VERSION={version}\n"));
        }
        let release_path = if version.is_empty() {
            "latest/download".to_string()
        } else {
            "download/v${OPENCODE_VERSION}".to_string()
        };
        out.push_str(&format!(
            r#"RUN set -e && \
    BASE_URL="https://github.com/sst/opencode/releases/{release_path}" && \
    wget -q -O /tmp/{artifact} "${{BASE_URL}}/{artifact}" && \
    wget -q -O /tmp/checksums.txt "${{BASE_URL}}/checksums.txt" && \
    CHECKSUM="$(grep ' {artifact}$' /tmp/checksums.txt | cut -d' ' -f1)" && \
    test -n "$CHECKSUM" && \
    (echo "${{CHECKSUM}}  /tmp/{artifact}" | sha256sum -c - || {{ rm -f /tmp/{artifact}; exit 1; }}) && \
    tar -xzf /tmp/{artifact} -C /tmp && \
    install -m 0755 /tmp/opencode /usr/local/bin/opencode && \
    rm -f /tmp/{artifact} /tmp/checksums.txt
"#
        ));
        out
    }

    fn container_mounts(&self, cfg_dir: &Path) -> Vec<Mount> {
        vec![
            Mount {
                source: cfg_dir.join(".opencode"),
                target: "/home/user/.opencode".to_string(),
                read_only: false,
            },
            Mount {
                source: cfg_dir.join(".config"),
                target: "/home/user/.config".to_string(),
                read_only: false,
            },
            Mount {
                source: cfg_dir.join(".local/share/opencode"),
                target: "/home/user/.local/share/opencode".to_string(),
                read_only: false,
            },
        ]
    }

    fn resume_args(&self, token: &str) -> Vec<String> {
        if token.is_empty() {
            return Vec::new();
        }
        vec!["--continue".to_string()]
    }

    fn resume_token_from_scrollback(&self, scrollback: &str) -> Option<String> {
        // OpenCode continues its most recent conversation via --continue.
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
    fn resume_uses_continue_flag() {
        let o = OpenCode;
        assert_eq!(o.resume_args("last"), vec!["--continue"]);
        assert!(o.resume_args("").is_empty());
    }

    #[test]
    fn binary_name_is_musl_tarball() {
        let o = OpenCode;
        let name = o.binary_name();
        assert!(name.starts_with("opencode-linux-"));
        assert!(name.ends_with("-musl.tar.gz"));
    }

    #[test]
    fn mounts_cover_opencode_config() {
        let o = OpenCode;
        let mounts = o.container_mounts(Path::new("/cfg"));
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].target, "/home/user/.opencode");
        assert_eq!(mounts[2].target, "/home/user/.local/share/opencode");
    }

    #[test]
    fn install_verifies_checksum() {
        let o = OpenCode;
        let snippet = o.dockerfile_install("0.2.0");
        assert!(snippet.contains("ARG OPENCODE_VERSION=0.2.0"));
        assert!(snippet.contains("sha256sum -c"));
    }
}
