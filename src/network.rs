//! Egress control: squid configuration rendering and per-session
//! allowlist additions.
//!
//! Each sandbox gets a private container network; the proxy container is
//! the only egress path. The rendered configuration is byte-stable for
//! identical inputs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config;

/// Subnet assigned to every sandbox network.
pub const SANDBOX_SUBNET: &str = "10.89.0.0/24";

/// Non-resolvable domain inserted when no destinations are allowed, so the
/// deny-all path is taken for every real destination.
const BLOCK_ALL_SENTINEL: &str = "exitbox-deny-all.invalid";

/// Name of the private network for a sandbox.
pub fn network_name(sandbox_id: &str) -> String {
    format!("exitbox-{}", sandbox_id)
}

/// DNS servers for the proxy: EXITBOX_SQUID_DNS (comma or space
/// separated), defaulting to 1.1.1.1 and 8.8.8.8.
pub fn squid_dns_servers() -> Vec<String> {
    if let Ok(raw) = std::env::var("EXITBOX_SQUID_DNS") {
        let servers: Vec<String> = raw
            .split([',', ' '])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !servers.is_empty() {
            return servers;
        }
    }
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}

/// Render the squid configuration for a sandbox.
///
/// Domains are deduplicated across the workspace allowlist and the
/// per-session extras, keep first-seen order, and are prefixed with `.`
/// so subdomains match. Empty and whitespace-only entries are skipped.
pub fn generate_squid_config(subnet: &str, domains: &[String], extra_urls: &[String]) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut allowed: Vec<&str> = Vec::new();
    for domain in domains.iter().chain(extra_urls.iter()) {
        let domain = domain.trim();
        if domain.is_empty() {
            continue;
        }
        if seen.insert(domain) {
            allowed.push(domain);
        }
    }
    if allowed.is_empty() {
        allowed.push(BLOCK_ALL_SENTINEL);
    }

    let mut conf = String::new();
    conf.push_str("# exitbox egress proxy configuration (generated)\n");
    conf.push_str("http_port 3128\n\n");

    conf.push_str(&format!("acl agent_sources src {}\n", subnet));
    conf.push_str("acl SSL_ports port 443\n");
    conf.push_str("acl Safe_ports port 80\n");
    conf.push_str("acl Safe_ports port 443\n");
    conf.push_str("acl CONNECT method CONNECT\n\n");

    for domain in &allowed {
        conf.push_str(&format!("acl allowed_domains dstdomain .{}\n", domain));
    }
    conf.push('\n');

    conf.push_str("http_access deny !Safe_ports\n");
    conf.push_str("http_access deny CONNECT !SSL_ports\n");
    conf.push_str("http_access allow localhost manager\n");
    conf.push_str("http_access deny manager\n");
    conf.push_str("http_access allow agent_sources allowed_domains\n");
    conf.push_str("http_access allow localhost\n");
    conf.push_str("http_access deny all\n\n");

    conf.push_str(&format!("dns_nameservers {}\n", squid_dns_servers().join(" ")));
    conf.push_str("forwarded_for off\n");
    conf.push_str("via off\n");
    conf.push_str("access_log stdio:/dev/stdout\n");
    conf.push_str("cache deny all\n");

    conf
}

// ── Per-session extras ──────────────────────────────────────────────────

/// Directory holding `<container_id>.urls` files, one domain per line.
pub fn session_urls_dir() -> PathBuf {
    config::cache_dir().join("session-urls")
}

fn session_urls_file(container_id: &str) -> PathBuf {
    session_urls_dir().join(format!("{}.urls", container_id))
}

/// Append session-scoped domains for a container. Read back into memory
/// when the proxy (re)starts.
pub fn add_session_urls(container_id: &str, domains: &[String]) -> Result<()> {
    let path = session_urls_file(container_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut content = fs::read_to_string(&path).unwrap_or_default();
    for domain in domains {
        let domain = domain.trim();
        if domain.is_empty() {
            continue;
        }
        content.push_str(domain);
        content.push('\n');
    }
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Read session-scoped extra domains for a container. Missing file means
/// no extras.
pub fn read_session_urls(container_id: &str) -> Vec<String> {
    read_session_urls_from(&session_urls_file(container_id))
}

fn read_session_urls_from(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drop the session extras for a container (teardown).
pub fn remove_session_urls(container_id: &str) {
    let _ = fs::remove_file(session_urls_file(container_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_structure() {
        let conf = generate_squid_config(SANDBOX_SUBNET, &["example.com".to_string()], &[]);
        for directive in [
            "http_port 3128",
            "acl SSL_ports port 443",
            "acl CONNECT method CONNECT",
            "http_access deny !Safe_ports",
            "http_access deny CONNECT !SSL_ports",
            "http_access deny all",
            "forwarded_for off",
            "via off",
        ] {
            assert!(conf.contains(directive), "missing directive: {}", directive);
        }
    }

    #[test]
    fn subnet_in_source_acl() {
        let conf = generate_squid_config("10.89.0.0/24", &["example.com".to_string()], &[]);
        assert!(conf.contains("acl agent_sources src 10.89.0.0/24"));
    }

    #[test]
    fn domains_are_dot_prefixed() {
        let domains = vec!["github.com".to_string(), "npmjs.org".to_string()];
        let conf = generate_squid_config(SANDBOX_SUBNET, &domains, &[]);
        assert!(conf.contains("acl allowed_domains dstdomain .github.com"));
        assert!(conf.contains("acl allowed_domains dstdomain .npmjs.org"));
    }

    #[test]
    fn extras_included() {
        let conf = generate_squid_config(
            SANDBOX_SUBNET,
            &["example.com".to_string()],
            &["extra.io".to_string()],
        );
        assert!(conf.contains("acl allowed_domains dstdomain .extra.io"));
    }

    #[test]
    fn dedup_within_allowlist() {
        let domains = vec![
            "example.com".to_string(),
            "example.com".to_string(),
            "example.com".to_string(),
        ];
        let conf = generate_squid_config(SANDBOX_SUBNET, &domains, &[]);
        assert_eq!(conf.matches(".example.com").count(), 1);
    }

    #[test]
    fn dedup_across_lists() {
        let conf = generate_squid_config(
            "10.89.0.0/24",
            &["example.com".to_string()],
            &["example.com".to_string()],
        );
        assert_eq!(conf.matches(".example.com").count(), 1);
    }

    #[test]
    fn empty_allowlist_blocks_all() {
        let conf = generate_squid_config("10.89.0.0/24", &[], &[]);
        assert!(conf.contains(BLOCK_ALL_SENTINEL));
        assert_eq!(conf.matches("acl allowed_domains dstdomain").count(), 1);
    }

    #[test]
    fn whitespace_entries_skipped() {
        let conf = generate_squid_config(
            SANDBOX_SUBNET,
            &["example.com".to_string()],
            &["".to_string(), "   ".to_string()],
        );
        assert_eq!(conf.matches("acl allowed_domains dstdomain").count(), 1);
    }

    #[test]
    fn allow_rules_present() {
        let conf = generate_squid_config(SANDBOX_SUBNET, &["example.com".to_string()], &[]);
        assert!(conf.contains("http_access allow agent_sources allowed_domains"));
        assert!(conf.contains("http_access allow localhost"));
    }

    #[test]
    fn rendering_is_byte_stable() {
        let _env = crate::test_support::EnvGuard::isolated();
        let domains = vec!["b.com".to_string(), "a.com".to_string()];
        let extras = vec!["c.com".to_string()];
        let one = generate_squid_config(SANDBOX_SUBNET, &domains, &extras);
        let two = generate_squid_config(SANDBOX_SUBNET, &domains, &extras);
        assert_eq!(one, two);

        // First-seen order after dedup across both lists.
        let b = one.find(".b.com").unwrap();
        let a = one.find(".a.com").unwrap();
        let c = one.find(".c.com").unwrap();
        assert!(b < a && a < c);
    }

    #[test]
    fn dns_defaults() {
        let _env = crate::test_support::EnvGuard::isolated();
        assert_eq!(squid_dns_servers(), vec!["1.1.1.1", "8.8.8.8"]);
    }

    #[test]
    fn dns_from_env_comma_and_space() {
        let env = crate::test_support::EnvGuard::isolated();
        env.set("EXITBOX_SQUID_DNS", "9.9.9.9,8.8.4.4");
        assert_eq!(squid_dns_servers(), vec!["9.9.9.9", "8.8.4.4"]);

        env.set("EXITBOX_SQUID_DNS", "9.9.9.9 8.8.4.4");
        assert_eq!(squid_dns_servers(), vec!["9.9.9.9", "8.8.4.4"]);
    }

    #[test]
    fn session_urls_roundtrip() {
        let _env = crate::test_support::EnvGuard::isolated();
        add_session_urls("cid-1", &["extra1.com".to_string(), "extra2.com".to_string()])
            .unwrap();
        add_session_urls("cid-1", &["extra3.com".to_string(), "  ".to_string()]).unwrap();

        assert_eq!(
            read_session_urls("cid-1"),
            vec!["extra1.com", "extra2.com", "extra3.com"]
        );
        assert!(read_session_urls("cid-other").is_empty());

        remove_session_urls("cid-1");
        assert!(read_session_urls("cid-1").is_empty());
    }

    #[test]
    fn network_names_are_per_sandbox() {
        assert_eq!(network_name("abc123"), "exitbox-abc123");
    }
}
