//! Sandbox lifecycle: compose images, network, proxy, IPC, and the agent
//! container into one running, egress-filtered environment.
//!
//! States run Prepared → Running → Stopped. Teardown executes every step
//! even after a failure; the first error is returned and the rest are
//! logged.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{Allowlist, Config};
use crate::runtime::{Runtime, RunSpec, current_user_spec};
use crate::workspace::ActiveWorkspace;
use crate::{agent, config, image, ipc, network, project, session, tmux, vault, workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Prepared,
    Running,
    Stopped,
}

/// Options controlling one sandbox run.
#[derive(Default)]
pub struct SandboxOptions {
    pub workspace_override: String,
    pub auto_resume: bool,
    /// Session-scoped allowlist additions.
    pub extra_domains: Vec<String>,
    pub force_rebuild: bool,
    /// Open vault to expose over IPC, with the host-side approval hook.
    pub vault: Option<Arc<vault::Store>>,
    pub approve: Option<Arc<ipc::ApprovalFn>>,
}

/// A prepared or running sandbox. Owns its network and proxy container
/// for its lifetime; the agent container is a child and is destroyed
/// before the network.
pub struct Sandbox {
    pub id: String,
    pub project_dir: PathBuf,
    pub workspace: Option<ActiveWorkspace>,
    pub agent: String,
    pub network_id: Option<String>,
    pub proxy_container_id: Option<String>,
    pub agent_container_id: Option<String>,
    pub ipc_socket_path: PathBuf,
    pub resume_dir: PathBuf,
    pub status: SandboxStatus,
    workspace_hash: String,
    ipc: Option<ipc::Server>,
    auto_resume: bool,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("project_dir", &self.project_dir)
            .field("agent", &self.agent)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

fn new_sandbox_id() -> String {
    let mut bytes = [0u8; 4];
    getrandom::fill(&mut bytes).expect("failed to get random bytes");
    hex::encode(bytes)
}

/// Prepare a sandbox: resolve the workspace, ensure all image layers,
/// render the proxy config, create the private network, start the proxy
/// container, and start the IPC server.
pub fn prepare(
    rt: &dyn Runtime,
    cfg: &Config,
    allowlist: &Allowlist,
    agent_name: &str,
    project_dir: &Path,
    opts: SandboxOptions,
) -> Result<Sandbox> {
    agent::get_or_err(agent_name)?;
    if !agent_enabled(cfg, agent_name) {
        anyhow::bail!(
            "agent '{}' is disabled in config (agents.{}.enabled)",
            agent_name,
            agent_name
        );
    }

    let active = workspace::resolve(cfg, project_dir, &opts.workspace_override)?;
    let workspace_name = active
        .as_ref()
        .map(|a| a.workspace.name.clone())
        .unwrap_or_default();

    image::build_project(
        rt,
        cfg,
        agent_name,
        project_dir,
        &opts.workspace_override,
        opts.force_rebuild,
    )?;
    image::squid::build_squid(rt, opts.force_rebuild)?;

    let id = new_sandbox_id();
    info!(id = %id, agent = agent_name, workspace = %workspace_name, "preparing sandbox");

    // Session allowlist additions live in the per-sandbox urls file and
    // are read back when the proxy starts.
    network::add_session_urls(&id, &opts.extra_domains)?;
    let extras = network::read_session_urls(&id);
    let squid_conf =
        network::generate_squid_config(network::SANDBOX_SUBNET, &allowlist.domains, &extras);
    let conf_path = config::cache_dir().join(format!("squid-{}.conf", id));
    if let Some(parent) = conf_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&conf_path, squid_conf).context("write squid config")?;

    let mut sandbox = Sandbox {
        id: id.clone(),
        project_dir: project_dir.to_path_buf(),
        workspace: active,
        agent: agent_name.to_string(),
        network_id: None,
        proxy_container_id: None,
        agent_container_id: None,
        ipc_socket_path: config::runtime_dir().join(format!("{}.sock", id)),
        resume_dir: session::project_resume_dir(&workspace_name, agent_name, project_dir),
        status: SandboxStatus::Prepared,
        workspace_hash: image::workspace_hash(cfg, project_dir, &opts.workspace_override),
        ipc: None,
        auto_resume: opts.auto_resume,
    };

    let result = (|| -> Result<()> {
        let network_name = network::network_name(&id);
        rt.network_create(&network_name, network::SANDBOX_SUBNET)?;
        sandbox.network_id = Some(network_name.clone());

        let proxy_id = rt.run(&RunSpec {
            image: image::squid::SQUID_IMAGE.to_string(),
            name: format!("exitbox-proxy-{}", id),
            network: Some(network_name),
            mounts: vec![(conf_path.clone(), "/etc/squid/squid.conf".to_string(), true)],
            detached: true,
            remove_on_exit: true,
            ..Default::default()
        })?;
        sandbox.proxy_container_id = Some(proxy_id);

        let mut server = ipc::Server::bind(&sandbox.ipc_socket_path)?;
        if let Some(store) = &opts.vault {
            let approve: Arc<ipc::ApprovalFn> = opts
                .approve
                .clone()
                .unwrap_or_else(|| Arc::new(|_: &str, _: &str| None));
            ipc::mount_vault_handlers(
                &mut server,
                &id,
                Arc::clone(store),
                Arc::new(ipc::GrantStore::new()),
                approve,
            );
        }
        server.start();
        sandbox.ipc = Some(server);
        Ok(())
    })();

    if let Err(e) = result {
        // Roll back whatever was created, preserving the original error.
        let _ = teardown(rt, &mut sandbox);
        return Err(e);
    }

    Ok(sandbox)
}

fn agent_enabled(cfg: &Config, agent_name: &str) -> bool {
    match agent_name {
        "claude" => cfg.agents.claude.enabled,
        "codex" => cfg.agents.codex.enabled,
        "opencode" => cfg.agents.opencode.enabled,
        _ => false,
    }
}

/// The argv run inside the agent container, including resume arguments.
///
/// With auto-resume on, a stored token is replayed; with it off, the
/// stale token file is removed so the next run starts clean.
pub fn agent_argv(cfg: &Config, agent: &dyn agent::Agent, resume_dir: &Path, auto_resume: bool) -> Vec<String> {
    let mut argv = vec![agent.command().to_string()];
    if auto_resume {
        if let Some(token) = session::read_resume_token(resume_dir) {
            argv.extend(agent.resume_args(&token));
        }
    } else {
        session::clear_resume_token(resume_dir);
    }
    argv.extend(cfg.settings.default_flags.iter().cloned());
    argv
}

impl Sandbox {
    /// Start the agent container and exec the agent attached to the tty.
    /// On start failure everything prepared so far is torn down.
    pub fn start(&mut self, rt: &dyn Runtime, cfg: &Config) -> Result<()> {
        let agent = agent::get_or_err(&self.agent)?;

        match self.start_inner(rt, cfg, agent.as_ref()) {
            Ok(()) => {
                self.status = SandboxStatus::Running;
                Ok(())
            }
            Err(e) => {
                let _ = teardown(rt, self);
                Err(e)
            }
        }
    }

    fn start_inner(&mut self, rt: &dyn Runtime, cfg: &Config, agent: &dyn agent::Agent) -> Result<()> {
        let workspace_name = self
            .workspace
            .as_ref()
            .map(|a| a.workspace.name.clone())
            .unwrap_or_default();
        let image_tag = project::image_name(&self.agent, &self.project_dir, &self.workspace_hash);

        fs::create_dir_all(&self.resume_dir)
            .with_context(|| format!("Failed to create {}", self.resume_dir.display()))?;

        let project_target = self.project_dir.display().to_string();
        let mut mounts = vec![
            (self.project_dir.clone(), project_target.clone(), false),
            (
                self.resume_dir.clone(),
                "/home/user/.exitbox/resume".to_string(),
                false,
            ),
            (
                self.ipc_socket_path.clone(),
                "/run/exitbox/ipc.sock".to_string(),
                false,
            ),
        ];

        // Agent credential mounts, host side rooted at the per-agent
        // profile dir. Only existing paths are mounted.
        let cfg_dir = config::data_dir()
            .join("profiles")
            .join("global")
            .join(&workspace_name)
            .join(&self.agent);
        for mount in agent.container_mounts(&cfg_dir) {
            if mount.source.exists() {
                mounts.push((mount.source, mount.target, mount.read_only));
            }
        }

        let proxy_host = format!("exitbox-proxy-{}", self.id);
        let env = vec![
            ("HTTP_PROXY".to_string(), format!("http://{}:3128", proxy_host)),
            ("HTTPS_PROXY".to_string(), format!("http://{}:3128", proxy_host)),
            ("http_proxy".to_string(), format!("http://{}:3128", proxy_host)),
            ("https_proxy".to_string(), format!("http://{}:3128", proxy_host)),
            ("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string()),
            ("EXITBOX_IPC_SOCKET".to_string(), "/run/exitbox/ipc.sock".to_string()),
            ("EXITBOX_SANDBOX_ID".to_string(), self.id.clone()),
        ];

        let container_id = rt.run(&RunSpec {
            image: image_tag,
            name: format!("exitbox-agent-{}", self.id),
            network: self.network_id.clone(),
            mounts,
            env,
            workdir: Some(project_target),
            user: Some(current_user_spec()),
            detached: true,
            remove_on_exit: false,
            command: vec!["sleep".to_string(), "infinity".to_string()],
        })?;
        self.agent_container_id = Some(container_id.clone());

        let argv = agent_argv(cfg, agent, &self.resume_dir, self.auto_resume);
        rt.exec_interactive(&container_id, &argv)
    }

    /// Stop the sandbox: stop the agent container, capture the resume
    /// token, then tear down proxy, network, and IPC in order.
    pub fn stop(&mut self, rt: &dyn Runtime) -> Result<()> {
        let mut first_err = None;
        stop_agent_container(rt, self, &mut first_err);
        self.capture_resume_token();
        teardown_infra(rt, self, &mut first_err);
        self.status = SandboxStatus::Stopped;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Scrape the interactive terminal for the agent's resume marker.
    /// Absence means "no resume available", never an error.
    fn capture_resume_token(&self) {
        if !self.auto_resume {
            return;
        }
        let Some(agent) = agent::get(&self.agent) else {
            return;
        };
        let Some(pane) = tmux::current_pane() else {
            return;
        };
        let Some(scrollback) = tmux::capture_scrollback(&pane) else {
            return;
        };
        if let Some(token) = agent.resume_token_from_scrollback(&scrollback) {
            if let Err(e) = session::write_resume_token(&self.resume_dir, &token) {
                warn!(error = %e, "failed to persist resume token");
            } else {
                info!(agent = %self.agent, "resume token captured");
            }
        }
    }
}

fn record_step(first_err: &mut Option<anyhow::Error>, result: Result<()>, step: &str) {
    if let Err(e) = result {
        warn!(error = %e, step, "teardown step failed");
        if first_err.is_none() {
            *first_err = Some(e.context(format!("teardown: {}", step)));
        }
    }
}

fn stop_agent_container(rt: &dyn Runtime, sandbox: &mut Sandbox, first_err: &mut Option<anyhow::Error>) {
    if let Some(cid) = sandbox.agent_container_id.take() {
        record_step(first_err, rt.stop(&cid), "stop agent container");
        record_step(first_err, rt.rm(&cid), "remove agent container");
    }
}

/// Tear down proxy, network, IPC server, and session state. Every step
/// runs; the first error wins, later ones are logged.
fn teardown_infra(rt: &dyn Runtime, sandbox: &mut Sandbox, first_err: &mut Option<anyhow::Error>) {
    if let Some(cid) = sandbox.proxy_container_id.take() {
        record_step(first_err, rt.stop(&cid), "stop proxy container");
    }
    if let Some(net) = sandbox.network_id.take() {
        record_step(first_err, rt.network_rm(&net), "remove network");
    }
    if let Some(mut server) = sandbox.ipc.take() {
        server.stop();
    }
    network::remove_session_urls(&sandbox.id);
    let _ = fs::remove_file(config::cache_dir().join(format!("squid-{}.conf", sandbox.id)));
}

/// Full teardown used when prepare or start fails partway.
fn teardown(rt: &dyn Runtime, sandbox: &mut Sandbox) -> Result<()> {
    let mut first_err = None;
    stop_agent_container(rt, sandbox, &mut first_err);
    teardown_infra(rt, sandbox, &mut first_err);
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Workspace, WorkspaceCatalog};
    use crate::image::tests::MockRuntime;
    use crate::test_support::EnvGuard;

    fn test_config() -> Config {
        Config {
            workspaces: WorkspaceCatalog {
                active: String::new(),
                items: vec![Workspace {
                    name: "ws".to_string(),
                    ..Default::default()
                }],
            },
            ..Default::default()
        }
    }

    fn prepare_sandbox(rt: &MockRuntime, cfg: &Config) -> Sandbox {
        prepare(
            rt,
            cfg,
            &Allowlist::default_allowlist(),
            "claude",
            Path::new("/tmp/proj"),
            SandboxOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn prepare_builds_network_proxy_and_ipc() {
        let _env = EnvGuard::isolated();
        let rt = MockRuntime::new();
        let cfg = test_config();

        let mut sandbox = prepare_sandbox(&rt, &cfg);
        assert_eq!(sandbox.status, SandboxStatus::Prepared);
        assert!(sandbox.network_id.as_deref().unwrap().starts_with("exitbox-"));
        assert!(sandbox.proxy_container_id.is_some());
        assert!(sandbox.ipc_socket_path.exists());
        assert_eq!(
            sandbox.workspace.as_ref().unwrap().workspace.name,
            "ws"
        );

        // Events: network created before the proxy container ran.
        let events = rt.events();
        let net_idx = events.iter().position(|e| e.starts_with("network_create:")).unwrap();
        let run_idx = events.iter().position(|e| e.starts_with("run:exitbox-proxy-")).unwrap();
        assert!(net_idx < run_idx);

        sandbox.stop(&rt).unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Stopped);
        assert!(!sandbox.ipc_socket_path.exists());
    }

    #[test]
    fn prepare_rejects_disabled_agent() {
        let _env = EnvGuard::isolated();
        let rt = MockRuntime::new();
        let mut cfg = test_config();
        cfg.agents.claude.enabled = false;

        let err = prepare(
            &rt,
            &cfg,
            &Allowlist::default_allowlist(),
            "claude",
            Path::new("/tmp/proj"),
            SandboxOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn prepare_rejects_unknown_agent() {
        let _env = EnvGuard::isolated();
        let rt = MockRuntime::new();
        let err = prepare(
            &rt,
            &test_config(),
            &Allowlist::default_allowlist(),
            "gemini",
            Path::new("/tmp/proj"),
            SandboxOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown agent"));
    }

    #[test]
    fn start_runs_agent_container_then_exec() {
        let _env = EnvGuard::isolated();
        let rt = MockRuntime::new();
        let cfg = test_config();

        let mut sandbox = prepare_sandbox(&rt, &cfg);
        sandbox.start(&rt, &cfg).unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(sandbox.agent_container_id.is_some());

        let events = rt.events();
        let run_idx = events.iter().position(|e| e.starts_with("run:exitbox-agent-")).unwrap();
        let exec_idx = events.iter().position(|e| e.starts_with("exec:")).unwrap();
        assert!(run_idx < exec_idx);

        sandbox.stop(&rt).unwrap();

        // Teardown ordering: agent container stops before the proxy,
        // which stops before the network is removed.
        let events = rt.events();
        let agent_stop = events
            .iter()
            .position(|e| e.starts_with("stop:mock-exitbox-agent-"))
            .unwrap();
        let proxy_stop = events
            .iter()
            .position(|e| e.starts_with("stop:mock-exitbox-proxy-"))
            .unwrap();
        let net_rm = events.iter().position(|e| e.starts_with("network_rm:")).unwrap();
        assert!(agent_stop < proxy_stop);
        assert!(proxy_stop < net_rm);
    }

    #[test]
    fn teardown_continues_past_failures() {
        let _env = EnvGuard::isolated();
        let rt = MockRuntime::new();
        rt.fail_stop.store(true, std::sync::atomic::Ordering::SeqCst);
        let cfg = test_config();

        let mut sandbox = prepare_sandbox(&rt, &cfg);
        sandbox.start(&rt, &cfg).unwrap();
        let err = sandbox.stop(&rt).unwrap_err();
        assert!(err.to_string().contains("stop agent container"));

        // Network removal still happened despite the stop failures.
        let events = rt.events();
        assert!(events.iter().any(|e| e.starts_with("network_rm:")));
        assert!(!sandbox.ipc_socket_path.exists());
    }

    #[test]
    fn agent_argv_resume_behaviour() {
        let _env = EnvGuard::isolated();
        let cfg = test_config();
        let agent = agent::get("claude").unwrap();
        let resume_dir = config::data_dir().join("resume-test");

        // No token yet: bare command.
        assert_eq!(
            agent_argv(&cfg, agent.as_ref(), &resume_dir, true),
            vec!["claude"]
        );

        // Token present and auto-resume on: resume flags included.
        session::write_resume_token(&resume_dir, "abc123def").unwrap();
        assert_eq!(
            agent_argv(&cfg, agent.as_ref(), &resume_dir, true),
            vec!["claude", "--resume", "abc123def"]
        );

        // Auto-resume off: token file removed, no resume args.
        assert_eq!(
            agent_argv(&cfg, agent.as_ref(), &resume_dir, false),
            vec!["claude"]
        );
        assert!(session::read_resume_token(&resume_dir).is_none());
    }

    #[test]
    fn agent_argv_appends_default_flags() {
        let _env = EnvGuard::isolated();
        let mut cfg = test_config();
        cfg.settings.default_flags = vec!["--verbose".to_string()];
        let agent = agent::get("codex").unwrap();
        let resume_dir = config::data_dir().join("resume-test");

        session::write_resume_token(&resume_dir, "last").unwrap();
        assert_eq!(
            agent_argv(&cfg, agent.as_ref(), &resume_dir, true),
            vec!["codex", "resume", "--last", "--verbose"]
        );
    }
}
