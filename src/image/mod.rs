//! Layered, hash-keyed image pipeline.
//!
//! Four layers, bottom-up: base (Alpine + system packages), tools (base +
//! user-selected and session tools), agent (tools + checksum-verified agent
//! binary), project (agent + workspace packages and profile snippets).
//! Each layer's tag is keyed by a content hash of its inputs, so rebuilds
//! are deterministic and shared across workspaces. A child is rebuilt when
//! its parent layer is newer, even if the child's own tag still exists.

pub mod squid;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::workspace;
use crate::{agent, profile, project};
use crate::runtime::Runtime;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DOCKERFILE_BASE: &str = include_str!("../../docker/Dockerfile.base");
pub const DOCKERFILE_SQUID: &str = include_str!("../../docker/Dockerfile.squid");

/// Tools baked into every sandbox for interactive sessions, independent of
/// the user's tool selection. Changing this list changes both the tools
/// hash and the workspace hash.
pub const SESSION_TOOLS: &[&str] = &["tmux", "fzf", "tree", "htop", "neovim"];

// ── Image references ────────────────────────────────────────────────────

/// Which layer an image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Base,
    Tools,
    Agent,
    Project,
    Squid,
}

/// A reference to one image in the pipeline, able to materialize its tag.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub agent: String,
    pub kind: ImageKind,
    pub workspace_hash: Option<String>,
    pub tools_hash: Option<String>,
    pub project_dir: Option<PathBuf>,
}

impl ImageRef {
    pub fn tag(&self) -> String {
        match self.kind {
            ImageKind::Base => format!("exitbox-base:{}", VERSION),
            ImageKind::Tools => format!(
                "exitbox-{}-tools:{}",
                self.agent,
                self.tools_hash.as_deref().unwrap_or("latest")
            ),
            ImageKind::Agent => format!("exitbox-{}:{}", self.agent, VERSION),
            ImageKind::Project => project::image_name(
                &self.agent,
                self.project_dir.as_deref().unwrap_or_else(|| Path::new(".")),
                self.workspace_hash.as_deref().unwrap_or("latest"),
            ),
            ImageKind::Squid => squid::SQUID_IMAGE.to_string(),
        }
    }
}

pub fn base_tag() -> String {
    format!("exitbox-base:{}", VERSION)
}

pub fn tools_tag(agent_name: &str, tools_hash: &str) -> String {
    format!("exitbox-{}-tools:{}", agent_name, tools_hash)
}

pub fn agent_tag(agent_name: &str) -> String {
    format!("exitbox-{}:{}", agent_name, VERSION)
}

// ── Hashes ──────────────────────────────────────────────────────────────

fn short_hash(parts: &[String]) -> String {
    let digest = Sha256::digest(parts.join(",").as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Hash keying the tools layer: sorted user tools plus sorted session
/// tools. Sorting makes the hash insensitive to config ordering.
pub fn tools_hash(cfg: &Config) -> String {
    let mut user: Vec<String> = cfg.tools.user.clone();
    user.sort();
    let mut session: Vec<String> = SESSION_TOOLS.iter().map(|s| s.to_string()).collect();
    session.sort();
    user.extend(session);
    short_hash(&user)
}

/// Hash keying the project image: the resolved workspace's scope, name,
/// profiles and packages, plus the session tools. Tools config is
/// excluded; it is already encoded in the parent layer's tag.
pub fn workspace_hash(cfg: &Config, project_dir: &Path, override_name: &str) -> String {
    let active = workspace::resolve(cfg, project_dir, override_name)
        .ok()
        .flatten();
    let mut parts = Vec::new();
    if let Some(active) = &active {
        parts.push(active.scope.as_str().to_string());
        parts.push(active.workspace.name.clone());
        parts.extend(active.workspace.development.iter().cloned());
        parts.extend(active.workspace.packages.iter().cloned());
    }
    parts.extend(SESSION_TOOLS.iter().map(|s| s.to_string()));
    short_hash(&parts)
}

// ── Freshness ───────────────────────────────────────────────────────────

/// True when the child must be rebuilt because its parent layer is newer.
///
/// Engine `Created` timestamps are fixed-width RFC 3339 strings, so
/// lexicographic comparison is chronological comparison. A missing
/// timestamp on either side is treated as "parent newer".
pub fn parent_is_newer(rt: &dyn Runtime, parent_tag: &str, child_tag: &str) -> bool {
    let parent_created = rt.image_inspect(parent_tag, "{{.Created}}").unwrap_or_default();
    let child_created = rt.image_inspect(child_tag, "{{.Created}}").unwrap_or_default();
    if parent_created.is_empty() || child_created.is_empty() {
        return true;
    }
    parent_created > child_created
}

// ── Build plumbing ──────────────────────────────────────────────────────

/// Per-tag build locks: two concurrent builds of the same tag coalesce
/// (the second waits, then sees the image exists); distinct tags build in
/// parallel.
fn build_lock(tag: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = locks.lock().unwrap_or_else(|e| e.into_inner());
    map.entry(tag.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Write a generated Dockerfile into a cache-dir build context and submit
/// it to the engine.
fn build_from_dockerfile(
    rt: &dyn Runtime,
    ctx_name: &str,
    dockerfile: &str,
    tag: &str,
    extra_args: &[String],
) -> Result<()> {
    let ctx_dir = config::cache_dir().join(ctx_name);
    fs::create_dir_all(&ctx_dir)
        .with_context(|| format!("Failed to create build context dir {}", ctx_dir.display()))?;
    let dockerfile_path = ctx_dir.join("Dockerfile");
    fs::write(&dockerfile_path, dockerfile)
        .with_context(|| format!("Failed to write {}", dockerfile_path.display()))?;

    let mut args = extra_args.to_vec();
    args.extend([
        "-t".to_string(),
        tag.to_string(),
        "-f".to_string(),
        dockerfile_path.display().to_string(),
        ".".to_string(),
    ]);
    rt.build(&args, &ctx_dir)
        .with_context(|| format!("Failed to build image '{}'", tag))
}

fn force_args(force: bool) -> Vec<String> {
    if force {
        vec!["--no-cache".to_string()]
    } else {
        Vec::new()
    }
}

/// Remove duplicate strings, preserving first-seen order. Detection is by
/// exact string equality.
pub fn dedup(input: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    input.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

/// True for plain release versions (`X.Y.Z`), false for dev builds.
pub fn is_release_version(version: &str) -> bool {
    !version.is_empty()
        && version.contains('.')
        && version.chars().all(|c| c.is_ascii_digit() || c == '.')
}

// ── Layer builds ────────────────────────────────────────────────────────

/// Ensure the base layer exists.
pub fn ensure_base(rt: &dyn Runtime, force: bool) -> Result<()> {
    let tag = base_tag();
    let lock = build_lock(&tag);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    if !force && rt.image_exists(&tag) {
        return Ok(());
    }

    info!(tag = %tag, "building base image");
    let mut args = force_args(force);
    args.extend([
        "--build-arg".to_string(),
        format!("EXITBOX_VERSION={}", VERSION),
    ]);
    build_from_dockerfile(rt, "build-base", DOCKERFILE_BASE, &tag, &args)
}

/// Ensure the tools layer exists for an agent: base + user tools +
/// session tools, one batched apk install with a cache mount.
pub fn ensure_tools(rt: &dyn Runtime, cfg: &Config, agent_name: &str, force: bool) -> Result<()> {
    ensure_base(rt, force)?;

    let tag = tools_tag(agent_name, &tools_hash(cfg));
    let lock = build_lock(&tag);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    if !force && rt.image_exists(&tag) && !parent_is_newer(rt, &base_tag(), &tag) {
        return Ok(());
    }

    let mut pkgs: Vec<String> = cfg.tools.user.clone();
    pkgs.extend(SESSION_TOOLS.iter().map(|s| s.to_string()));
    let pkgs = dedup(pkgs);

    let mut df = String::new();
    df.push_str("# syntax=docker/dockerfile:1\n");
    df.push_str(&format!("FROM {}\n\n", base_tag()));
    df.push_str("USER root\n\n");
    if !pkgs.is_empty() {
        df.push_str(&format!(
            "RUN --mount=type=cache,target=/var/cache/apk apk add --no-cache {}\n\n",
            pkgs.join(" ")
        ));
    }
    df.push_str("RUN chown -R user:user /home/user\n\n");
    df.push_str("USER user\n");

    info!(tag = %tag, agent = agent_name, "building tools image");
    build_from_dockerfile(
        rt,
        &format!("build-{}-tools", agent_name),
        &df,
        &tag,
        &force_args(force),
    )
}

/// Ensure the agent layer exists: tools + the verified agent binary.
pub fn ensure_agent(rt: &dyn Runtime, cfg: &Config, agent_name: &str, force: bool) -> Result<()> {
    ensure_tools(rt, cfg, agent_name, force)?;

    let agent = agent::get_or_err(agent_name)?;
    let tools = tools_tag(agent_name, &tools_hash(cfg));
    let tag = agent_tag(agent_name);
    let lock = build_lock(&tag);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    if !force && rt.image_exists(&tag) && !parent_is_newer(rt, &tools, &tag) {
        return Ok(());
    }

    let mut df = String::new();
    df.push_str("# syntax=docker/dockerfile:1\n");
    df.push_str(&format!("FROM {}\n\n", tools));
    df.push_str("USER root\n\n");
    df.push_str(&agent.dockerfile_install(""));
    df.push('\n');
    df.push_str("RUN chown -R user:user /home/user\n\n");
    df.push_str("USER user\n");

    info!(tag = %tag, agent = agent_name, "building agent image");
    build_from_dockerfile(
        rt,
        &format!("build-{}-agent", agent_name),
        &df,
        &tag,
        &force_args(force),
    )
}

/// Build the workspace-parameterized project image.
///
/// Order: ensure parent layers, compute the workspace hash, skip when the
/// child exists, is fresh, and force is off; otherwise render a layered
/// Dockerfile (batched package install with build cache, profile snippets
/// in workspace order, ownership fixup, drop to the unprivileged user)
/// and submit it.
pub fn build_project(
    rt: &dyn Runtime,
    cfg: &Config,
    agent_name: &str,
    project_dir: &Path,
    workspace_override: &str,
    force: bool,
) -> Result<()> {
    ensure_agent(rt, cfg, agent_name, force)?;

    let wh = workspace_hash(cfg, project_dir, workspace_override);
    let tag = project::image_name(agent_name, project_dir, &wh);
    let parent = agent_tag(agent_name);
    let lock = build_lock(&tag);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    if !force && rt.image_exists(&tag) && !parent_is_newer(rt, &parent, &tag) {
        return Ok(());
    }

    let active = match workspace::resolve(cfg, project_dir, workspace_override) {
        Ok(active) => active,
        Err(e) => {
            if workspace_override.is_empty() {
                warn!(error = %e, "failed to resolve active workspace");
                None
            } else {
                return Err(e);
            }
        }
    };

    let development: Vec<String> = active
        .as_ref()
        .map(|a| a.workspace.development.clone())
        .unwrap_or_default();

    // Validate all development profiles up front.
    for p in &development {
        if !profile::exists(p) {
            anyhow::bail!(
                "unknown development profile '{}' (valid: {})",
                p,
                profile::names().join(", ")
            );
        }
    }

    // Collect ALL Alpine packages into a single apk add call:
    // workspace packages + profile packages + session tools.
    let mut pkgs: Vec<String> = active
        .as_ref()
        .map(|a| a.workspace.packages.clone())
        .unwrap_or_default();
    pkgs.extend(profile::collect_packages(&development));
    pkgs.extend(SESSION_TOOLS.iter().map(|s| s.to_string()));
    let pkgs = dedup(pkgs);

    let mut df = String::new();
    df.push_str("# syntax=docker/dockerfile:1\n");
    df.push_str(&format!("FROM {}\n\n", parent));
    df.push_str("USER root\n\n");
    if !pkgs.is_empty() {
        df.push_str(&format!(
            "RUN --mount=type=cache,target=/var/cache/apk apk add --no-cache {}\n\n",
            pkgs.join(" ")
        ));
    }
    for p in &development {
        let snippet = profile::custom_snippet(p);
        if !snippet.is_empty() {
            df.push_str(snippet);
            df.push('\n');
        }
    }
    df.push_str("RUN chown -R user:user /home/user\n\n");
    df.push_str("USER user\n");

    info!(tag = %tag, agent = agent_name, "building project image");
    build_from_dockerfile(
        rt,
        &format!("build-{}-project", agent_name),
        &df,
        &tag,
        &force_args(force),
    )
}
