//! Static development-profile catalog.
//!
//! Maps profile names to Alpine package lists and, for toolchains that
//! aren't packaged (Go, Flutter) or need post-install steps (Python venv,
//! npm globals), a Dockerfile snippet. Pure data, no runtime state.

/// A catalog entry: packages installed via apk, plus optional non-apk
/// install instructions.
pub struct Profile {
    pub name: &'static str,
    pub packages: &'static str,
    pub custom_snippet: &'static str,
}

static CATALOG: &[Profile] = &[
    Profile {
        name: "go",
        packages: "",
        custom_snippet: GO_SNIPPET,
    },
    Profile {
        name: "python",
        packages: "python3 py3-pip",
        custom_snippet: PYTHON_SNIPPET,
    },
    Profile {
        name: "node",
        packages: "nodejs npm",
        custom_snippet: NODE_SNIPPET,
    },
    Profile {
        name: "javascript",
        packages: "nodejs npm",
        custom_snippet: NODE_SNIPPET,
    },
    Profile {
        name: "flutter",
        packages: "",
        custom_snippet: FLUTTER_SNIPPET,
    },
    Profile {
        name: "ml",
        packages: "python3 py3-pip build-base cmake",
        custom_snippet: "# ML profile uses build-base for native extension compilation\n",
    },
    Profile {
        name: "rust",
        packages: "rust cargo rust-analyzer",
        custom_snippet: "",
    },
    Profile {
        name: "java",
        packages: "openjdk21 maven gradle",
        custom_snippet: "",
    },
    Profile {
        name: "ruby",
        packages: "ruby ruby-dev ruby-bundler",
        custom_snippet: "",
    },
    Profile {
        name: "php",
        packages: "php83 php83-phar composer",
        custom_snippet: "",
    },
    Profile {
        name: "c",
        packages: "build-base cmake gdb clang",
        custom_snippet: "",
    },
    Profile {
        name: "database",
        packages: "postgresql-client mariadb-client sqlite redis",
        custom_snippet: "",
    },
];

const PYTHON_SNIPPET: &str = r#"# Python profile - venv with pip, setuptools, wheel
RUN python3 -m venv /home/user/.venv && \
    /home/user/.venv/bin/pip install --upgrade pip setuptools wheel
ENV PATH="/home/user/.venv/bin:$PATH"
"#;

const GO_SNIPPET: &str = r#"RUN set -e && \
    case "$(uname -m)" in \
        x86_64|amd64) GO_ARCH="amd64" ;; \
        aarch64|arm64) GO_ARCH="arm64" ;; \
        *) echo "Unsupported architecture: $(uname -m)" >&2; exit 1 ;; \
    esac && \
    GO_VERSION="$(wget -qO- https://go.dev/VERSION?m=text | head -n1)" && \
    GO_TARBALL="${GO_VERSION}.linux-${GO_ARCH}.tar.gz" && \
    GO_SHA256="$(wget -qO- https://go.dev/dl/?mode=json | jq -r --arg f "$GO_TARBALL" '.[0].files[] | select(.filename == $f) | .sha256')" && \
    test -n "$GO_SHA256" && \
    wget -q -O /tmp/go.tar.gz "https://go.dev/dl/${GO_TARBALL}" && \
    echo "${GO_SHA256}  /tmp/go.tar.gz" | sha256sum -c - && \
    tar -C /usr/local -xzf /tmp/go.tar.gz && \
    rm -f /tmp/go.tar.gz && \
    ln -sf /usr/local/go/bin/go /usr/local/bin/go && \
    ln -sf /usr/local/go/bin/gofmt /usr/local/bin/gofmt
"#;

const FLUTTER_SNIPPET: &str = r#"RUN set -e && \
    case "$(uname -m)" in \
        x86_64|amd64) FLUTTER_ARCH="x64" ;; \
        aarch64|arm64) FLUTTER_ARCH="arm64" ;; \
        *) echo "Unsupported architecture: $(uname -m)" >&2; exit 1 ;; \
    esac && \
    RELEASES_JSON="$(wget -qO- https://storage.googleapis.com/flutter_infra_release/releases/releases_linux.json)" && \
    STABLE_HASH="$(printf '%s' "$RELEASES_JSON" | jq -r '.current_release.stable')" && \
    FLUTTER_ARCHIVE="$(printf '%s' "$RELEASES_JSON" | jq -r --arg h "$STABLE_HASH" --arg a "$FLUTTER_ARCH" '.releases[] | select(.hash == $h and .dart_sdk_arch == $a) | .archive' | head -n1)" && \
    FLUTTER_SHA256="$(printf '%s' "$RELEASES_JSON" | jq -r --arg h "$STABLE_HASH" --arg a "$FLUTTER_ARCH" '.releases[] | select(.hash == $h and .dart_sdk_arch == $a) | .sha256' | head -n1)" && \
    test -n "$FLUTTER_ARCHIVE" && \
    test -n "$FLUTTER_SHA256" && \
    wget -q -O /tmp/flutter.tar.xz "https://storage.googleapis.com/flutter_infra_release/releases/${FLUTTER_ARCHIVE}" && \
    echo "${FLUTTER_SHA256}  /tmp/flutter.tar.xz" | sha256sum -c - && \
    mkdir -p /opt && \
    tar -xJf /tmp/flutter.tar.xz -C /opt && \
    rm -f /tmp/flutter.tar.xz && \
    ln -sf /opt/flutter/bin/flutter /usr/local/bin/flutter && \
    ln -sf /opt/flutter/bin/dart /usr/local/bin/dart
"#;

const NODE_SNIPPET: &str = "RUN npm install -g typescript eslint prettier yarn pnpm\n";

/// Look up a profile by name.
pub fn get(name: &str) -> Option<&'static Profile> {
    CATALOG.iter().find(|p| p.name == name)
}

/// True if the catalog has a profile with this name.
pub fn exists(name: &str) -> bool {
    get(name).is_some()
}

/// All profile names, in catalog order.
pub fn names() -> Vec<&'static str> {
    CATALOG.iter().map(|p| p.name).collect()
}

/// The space-separated Alpine packages for a profile, or empty if the
/// profile is unknown or has only custom install steps.
pub fn packages(name: &str) -> &'static str {
    get(name).map(|p| p.packages).unwrap_or("")
}

/// The non-apk Dockerfile instructions for a profile (toolchain downloads
/// with checksum verification, venv setup, npm globals). Empty if the
/// profile only needs apk packages.
pub fn custom_snippet(name: &str) -> &'static str {
    get(name).map(|p| p.custom_snippet).unwrap_or("")
}

/// Union of the package lists for the given profiles, in input order,
/// deduplicated (first occurrence wins).
pub fn collect_packages(profiles: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut pkgs = Vec::new();
    for name in profiles {
        for pkg in packages(name).split_whitespace() {
            if seen.insert(pkg) {
                pkgs.push(pkg.to_string());
            }
        }
    }
    pkgs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_profiles_exist() {
        for name in ["go", "python", "node", "javascript", "flutter", "ml", "rust"] {
            assert!(exists(name), "missing profile {}", name);
        }
        assert!(!exists("cobol"));
    }

    #[test]
    fn special_profiles_carry_snippets() {
        for name in ["go", "python", "flutter", "node", "ml"] {
            assert!(!custom_snippet(name).is_empty(), "{} missing snippet", name);
        }
        assert!(custom_snippet("rust").is_empty());
    }

    #[test]
    fn toolchain_downloads_verify_checksums() {
        assert!(custom_snippet("go").contains("sha256sum -c"));
        assert!(custom_snippet("flutter").contains("sha256sum -c"));
    }

    #[test]
    fn collect_packages_dedups_preserving_order() {
        let profiles = vec![
            "python".to_string(),
            "ml".to_string(),
            "node".to_string(),
        ];
        let pkgs = collect_packages(&profiles);
        // python3/py3-pip appear once, from the python profile
        assert_eq!(
            pkgs,
            vec![
                "python3",
                "py3-pip",
                "build-base",
                "cmake",
                "nodejs",
                "npm"
            ]
        );
    }

    #[test]
    fn collect_packages_no_duplicates() {
        let profiles = vec![
            "node".to_string(),
            "javascript".to_string(),
            "node".to_string(),
        ];
        let pkgs = collect_packages(&profiles);
        assert_eq!(pkgs, vec!["nodejs", "npm"]);
    }

    #[test]
    fn collect_packages_skips_unknown_and_packageless() {
        let profiles = vec!["go".to_string(), "nonexistent".to_string()];
        assert!(collect_packages(&profiles).is_empty());
    }
}
