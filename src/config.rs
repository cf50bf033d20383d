//! Typed configuration model and on-disk YAML persistence.
//!
//! Two documents live under the config directory: `config.yaml` (workspaces,
//! settings, tools, agents) and `allowlist.yaml` (egress domains). Loading
//! applies two migrations: legacy `profiles:` keys move into `workspaces:`,
//! and deprecated tool packages are replaced in-place.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

// ── Paths ───────────────────────────────────────────────────────────────

/// Config directory: $EXITBOX_HOME, else $XDG_CONFIG_HOME/exitbox,
/// else ~/.config/exitbox.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = env::var("EXITBOX_HOME")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return PathBuf::from(xdg).join("exitbox");
    }
    home::home_dir()
        .map(|h| h.join(".config").join("exitbox"))
        .unwrap_or_else(|| PathBuf::from(".exitbox"))
}

/// Data directory: $XDG_DATA_HOME/exitbox, else ~/.local/share/exitbox.
/// Holds vaults and the per-workspace session/resume tree.
pub fn data_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_DATA_HOME")
        && !xdg.is_empty()
    {
        return PathBuf::from(xdg).join("exitbox");
    }
    home::home_dir()
        .map(|h| h.join(".local").join("share").join("exitbox"))
        .unwrap_or_else(|| PathBuf::from(".exitbox-data"))
}

/// Cache directory: $XDG_CACHE_HOME/exitbox, else ~/.cache/exitbox.
/// Holds image build contexts and per-session proxy URL files.
pub fn cache_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CACHE_HOME")
        && !xdg.is_empty()
    {
        return PathBuf::from(xdg).join("exitbox");
    }
    home::home_dir()
        .map(|h| h.join(".cache").join("exitbox"))
        .unwrap_or_else(|| PathBuf::from(".exitbox-cache"))
}

/// State directory: $XDG_STATE_HOME/exitbox, else ~/.local/state/exitbox.
/// Holds the log file.
pub fn state_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_STATE_HOME")
        && !xdg.is_empty()
    {
        return PathBuf::from(xdg).join("exitbox");
    }
    home::home_dir()
        .map(|h| h.join(".local").join("state").join("exitbox"))
        .unwrap_or_else(|| PathBuf::from(".exitbox-state"))
}

/// Runtime directory for per-sandbox UNIX sockets.
/// $XDG_RUNTIME_DIR/exitbox, else /tmp/exitbox-<uid>.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = env::var("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir).join("exitbox");
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/exitbox-{}", uid))
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

pub fn allowlist_file() -> PathBuf {
    config_dir().join("allowlist.yaml")
}

// ── Model ───────────────────────────────────────────────────────────────

/// Scope of a workspace: usable everywhere, or bound to a directory tree.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceScope {
    #[default]
    Global,
    Directory,
}

impl WorkspaceScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceScope::Global => "global",
            WorkspaceScope::Directory => "directory",
        }
    }
}

/// Per-workspace vault settings.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct VaultConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// A named bundle of development profiles and packages that fully
/// parameterizes a project image.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Workspace {
    pub name: String,

    #[serde(default)]
    pub scope: WorkspaceScope,

    /// Absolute directory this workspace is bound to (directory scope only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// Development profile names from the static catalog.
    #[serde(default)]
    pub development: Vec<String>,

    /// Extra Alpine packages installed into the project image.
    #[serde(default)]
    pub packages: Vec<String>,

    #[serde(default)]
    pub vault: VaultConfig,
}

/// The workspace catalog: an optional active selection plus all items.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct WorkspaceCatalog {
    #[serde(default)]
    pub active: String,

    #[serde(default)]
    pub items: Vec<Workspace>,
}

impl WorkspaceCatalog {
    pub fn find(&self, name: &str) -> Option<&Workspace> {
        self.items.iter().find(|w| w.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|w| w.name.as_str()).collect()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SettingsConfig {
    #[serde(default = "default_workspace_name")]
    pub default_workspace: String,

    #[serde(default)]
    pub auto_update: bool,

    #[serde(default = "default_true")]
    pub status_bar: bool,

    #[serde(default)]
    pub keybindings: bool,

    /// Extra flags appended to every agent invocation.
    #[serde(default)]
    pub default_flags: Vec<String>,
}

fn default_workspace_name() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            default_workspace: default_workspace_name(),
            auto_update: false,
            status_bar: true,
            keybindings: false,
            default_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ToolsConfig {
    /// User-selected Alpine packages baked into the tools layer.
    #[serde(default)]
    pub user: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AgentToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AgentToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct AgentsConfig {
    #[serde(default)]
    pub claude: AgentToggle,
    #[serde(default)]
    pub codex: AgentToggle,
    #[serde(default)]
    pub opencode: AgentToggle,
}

/// Top-level configuration, loaded from config.yaml.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub workspaces: WorkspaceCatalog,

    #[serde(default)]
    pub settings: SettingsConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    /// Role hints collected by the setup wizard. Informational only.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Config {
    /// The untouched default: a single "default" workspace with no dev stack.
    pub fn default_config() -> Self {
        Self {
            workspaces: WorkspaceCatalog {
                active: String::new(),
                items: vec![Workspace {
                    name: "default".to_string(),
                    ..Default::default()
                }],
            },
            ..Default::default()
        }
    }

    /// Validate catalog invariants: unique names, absolute directories for
    /// directory-scoped workspaces.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for ws in &self.workspaces.items {
            if !seen.insert(ws.name.as_str()) {
                anyhow::bail!("duplicate workspace name '{}'", ws.name);
            }
            if ws.scope == WorkspaceScope::Directory {
                match ws.directory.as_deref() {
                    Some(dir) if Path::new(dir).is_absolute() => {}
                    Some(dir) => anyhow::bail!(
                        "workspace '{}' has non-absolute directory '{}'",
                        ws.name,
                        dir
                    ),
                    None => anyhow::bail!(
                        "workspace '{}' is directory-scoped but has no directory",
                        ws.name
                    ),
                }
            }
        }
        Ok(())
    }
}

/// Egress allowlist, loaded from allowlist.yaml.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Allowlist {
    #[serde(default)]
    pub domains: Vec<String>,
}

impl Allowlist {
    /// Default destinations: agent API endpoints plus common registries.
    pub fn default_allowlist() -> Self {
        Self {
            domains: [
                "anthropic.com",
                "claude.ai",
                "openai.com",
                "chatgpt.com",
                "opencode.ai",
                "github.com",
                "githubusercontent.com",
                "npmjs.org",
                "pypi.org",
                "pythonhosted.org",
                "crates.io",
                "golang.org",
                "go.dev",
                "alpinelinux.org",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────────────

/// Read and parse config.yaml, applying migrations.
pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(&config_file())
}

/// Read config from a specific path.
pub fn load_config_from(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&data)
        .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
    if cfg.workspaces.items.is_empty() {
        cfg.workspaces = Config::default_config().workspaces;
    }
    migrate_tools(&mut cfg);
    migrate_profiles_to_workspaces(&data, &mut cfg);
    debug!(
        workspaces = cfg.workspaces.items.len(),
        tools = cfg.tools.user.len(),
        "config:loaded"
    );
    Ok(cfg)
}

/// Load config or return defaults if the file doesn't exist or is invalid.
pub fn load_or_default() -> Config {
    load_config().unwrap_or_else(|_| Config::default_config())
}

/// Write config to config.yaml.
pub fn save_config(cfg: &Config) -> anyhow::Result<()> {
    save_config_to(cfg, &config_file())
}

/// Write config to a specific path.
pub fn save_config_to(cfg: &Config, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_yaml::to_string(cfg)?;
    fs::write(path, data)?;
    Ok(())
}

/// Read and parse allowlist.yaml.
pub fn load_allowlist_from(path: &Path) -> anyhow::Result<Allowlist> {
    let data = fs::read_to_string(path)?;
    let al: Allowlist = serde_yaml::from_str(&data)
        .map_err(|e| anyhow::anyhow!("Failed to parse allowlist at {}: {}", path.display(), e))?;
    Ok(al)
}

/// Load allowlist or return defaults if the file doesn't exist.
pub fn load_allowlist_or_default() -> Allowlist {
    load_allowlist_from(&allowlist_file()).unwrap_or_else(|_| Allowlist::default_allowlist())
}

pub fn save_allowlist_to(al: &Allowlist, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_yaml::to_string(al)?;
    fs::write(path, data)?;
    Ok(())
}

// ── Migrations ──────────────────────────────────────────────────────────

/// Deprecated Alpine packages and their replacements.
/// Empty string means remove with no replacement.
const PACKAGE_REPLACEMENTS: &[(&str, &str)] = &[
    ("terraform", "opentofu"),
    ("ansible", ""),
    ("docker", "docker-cli"),
    ("node", "nodejs"),
];

/// Replace deprecated packages in the user tools list, preserving order
/// and dropping duplicates (first occurrence wins).
fn migrate_tools(cfg: &mut Config) {
    let mut seen = std::collections::HashSet::new();
    let mut migrated = Vec::with_capacity(cfg.tools.user.len());
    for pkg in &cfg.tools.user {
        let replacement = PACKAGE_REPLACEMENTS
            .iter()
            .find(|(old, _)| *old == pkg.as_str())
            .map(|(_, new)| *new);
        let effective = match replacement {
            Some("") => continue,
            Some(new) => new,
            None => pkg.as_str(),
        };
        if seen.insert(effective.to_string()) {
            migrated.push(effective.to_string());
        }
    }
    cfg.tools.user = migrated;
}

/// Mirror of the pre-workspace YAML keys, used to read configs that still
/// carry "profiles" / "default_profile" on disk.
#[derive(Debug, Deserialize, Default)]
struct LegacyConfig {
    #[serde(default)]
    profiles: LegacyProfiles,
    #[serde(default)]
    settings: LegacySettings,
}

#[derive(Debug, Deserialize, Default)]
struct LegacyProfiles {
    #[serde(default)]
    active: String,
    #[serde(default)]
    items: Vec<LegacyProfileItem>,
}

#[derive(Debug, Deserialize, Default)]
struct LegacyProfileItem {
    #[serde(default)]
    name: String,
    #[serde(default)]
    development: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LegacySettings {
    #[serde(default)]
    default_profile: String,
}

/// Copy legacy "profiles" / "default_profile" keys into the workspace fields
/// when the new keys are still at defaults (i.e. an old config on disk).
fn migrate_profiles_to_workspaces(raw: &str, cfg: &mut Config) {
    let Ok(legacy) = serde_yaml::from_str::<LegacyConfig>(raw) else {
        return;
    };

    if !legacy.profiles.items.is_empty() && is_default_workspaces(cfg) {
        cfg.workspaces.active = legacy.profiles.active;
        cfg.workspaces.items = legacy
            .profiles
            .items
            .into_iter()
            .map(|item| Workspace {
                name: item.name,
                development: item.development,
                ..Default::default()
            })
            .collect();
    }

    if !legacy.settings.default_profile.is_empty() && cfg.settings.default_workspace == "default" {
        cfg.settings.default_workspace = legacy.settings.default_profile;
    }
}

/// True if the workspace catalog looks like the untouched default
/// (single "default" workspace with no dev stack).
fn is_default_workspaces(cfg: &Config) -> bool {
    cfg.workspaces.items.len() == 1
        && cfg.workspaces.items[0].name == "default"
        && cfg.workspaces.items[0].development.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_default_workspace() {
        let cfg = Config::default_config();
        assert_eq!(cfg.workspaces.items.len(), 1);
        assert_eq!(cfg.workspaces.items[0].name, "default");
        assert_eq!(cfg.settings.default_workspace, "default");
        assert!(cfg.settings.status_bar);
    }

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut cfg = Config::default_config();
        cfg.workspaces.items.push(Workspace {
            name: "work".to_string(),
            development: vec!["go".to_string()],
            packages: vec!["jq".to_string()],
            ..Default::default()
        });
        cfg.tools.user = vec!["htop".to_string()];

        save_config_to(&cfg, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn migrate_tools_replaces_deprecated() {
        let mut cfg = Config::default_config();
        cfg.tools.user = vec![
            "terraform".to_string(),
            "htop".to_string(),
            "docker".to_string(),
            "ansible".to_string(),
            "node".to_string(),
        ];
        migrate_tools(&mut cfg);
        assert_eq!(cfg.tools.user, vec!["opentofu", "htop", "docker-cli", "nodejs"]);
    }

    #[test]
    fn migrate_tools_first_occurrence_wins_on_collision() {
        // "node" and "nodejs" both present: the already-seen entry wins.
        let mut cfg = Config::default_config();
        cfg.tools.user = vec!["nodejs".to_string(), "node".to_string()];
        migrate_tools(&mut cfg);
        assert_eq!(cfg.tools.user, vec!["nodejs"]);
    }

    #[test]
    fn migrate_tools_preserves_order() {
        let mut cfg = Config::default_config();
        cfg.tools.user = vec![
            "htop".to_string(),
            "terraform".to_string(),
            "ripgrep".to_string(),
        ];
        migrate_tools(&mut cfg);
        assert_eq!(cfg.tools.user, vec!["htop", "opentofu", "ripgrep"]);
    }

    #[test]
    fn legacy_profiles_migrate_into_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            r#"
profiles:
  active: work
  items:
    - name: personal
      development: [python]
    - name: work
      development: [go]
settings:
  default_profile: personal
"#,
        )
        .unwrap();

        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.workspaces.active, "work");
        assert_eq!(cfg.workspaces.items.len(), 2);
        assert_eq!(cfg.workspaces.items[0].name, "personal");
        assert_eq!(cfg.workspaces.items[1].development, vec!["go"]);
        assert_eq!(cfg.settings.default_workspace, "personal");
    }

    #[test]
    fn legacy_migration_skipped_when_workspaces_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            r#"
workspaces:
  items:
    - name: existing
      development: [rust]
profiles:
  items:
    - name: old
      development: [python]
"#,
        )
        .unwrap();

        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.workspaces.items.len(), 1);
        assert_eq!(cfg.workspaces.items[0].name, "existing");
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut cfg = Config::default_config();
        cfg.workspaces.items.push(Workspace {
            name: "default".to_string(),
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_directory() {
        let mut cfg = Config::default_config();
        cfg.workspaces.items.push(Workspace {
            name: "proj".to_string(),
            scope: WorkspaceScope::Directory,
            directory: Some("relative/path".to_string()),
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_absolute_directory() {
        let mut cfg = Config::default_config();
        cfg.workspaces.items.push(Workspace {
            name: "proj".to_string(),
            scope: WorkspaceScope::Directory,
            directory: Some("/home/user/proj".to_string()),
            ..Default::default()
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn allowlist_default_is_nonempty() {
        let al = Allowlist::default_allowlist();
        assert!(al.domains.contains(&"anthropic.com".to_string()));
        assert!(al.domains.contains(&"github.com".to_string()));
    }

    #[test]
    fn allowlist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist.yaml");
        let al = Allowlist {
            domains: vec!["example.com".to_string()],
        };
        save_allowlist_to(&al, &path).unwrap();
        assert_eq!(load_allowlist_from(&path).unwrap(), al);
    }
}
