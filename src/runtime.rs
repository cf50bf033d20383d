//! Container-engine abstraction.
//!
//! The engine is a capability set, not a hierarchy: one trait with the
//! operations the pipeline and lifecycle need, implemented by shelling
//! out to whichever CLI is installed. Exactly one engine is assumed per
//! host; `Created` timestamps are only comparable within it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tracing::debug;
use which::which;

use crate::cmd::Cmd;

/// Specification for starting a container.
#[derive(Debug, Default, Clone)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    /// Private network to attach to, if any.
    pub network: Option<String>,
    /// (host path, container path, read-only) bind mounts.
    pub mounts: Vec<(PathBuf, String, bool)>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    /// uid:gid to run as.
    pub user: Option<String>,
    /// Keep the container alive detached; the agent is exec'd in later.
    pub detached: bool,
    pub remove_on_exit: bool,
    pub command: Vec<String>,
}

/// The operations ExitBox needs from a container engine.
pub trait Runtime: Send + Sync {
    /// The engine binary name ("docker" or "podman").
    fn name(&self) -> &str;

    fn image_exists(&self, tag: &str) -> bool;

    /// `inspect --format <format>` on an image; empty string if the
    /// field is absent.
    fn image_inspect(&self, tag: &str, format: &str) -> Result<String>;

    /// Run `build` with the given args inside a context directory,
    /// streaming engine output to the terminal.
    fn build(&self, args: &[String], ctx_dir: &Path) -> Result<()>;

    fn pull(&self, reference: &str) -> Result<()>;

    fn tag(&self, src: &str, dst: &str) -> Result<()>;

    fn network_create(&self, name: &str, subnet: &str) -> Result<()>;

    fn network_rm(&self, name: &str) -> Result<()>;

    /// Start a container, returning its id.
    fn run(&self, spec: &RunSpec) -> Result<String>;

    /// Exec a command inside a running container, captured.
    fn exec(&self, container_id: &str, argv: &[String]) -> Result<String>;

    /// Exec a command inside a running container with the tty attached.
    fn exec_interactive(&self, container_id: &str, argv: &[String]) -> Result<()>;

    fn stop(&self, container_id: &str) -> Result<()>;

    fn rm(&self, container_id: &str) -> Result<()>;
}

/// Engine implementation backed by the docker/podman CLI.
pub struct CliRuntime {
    bin: &'static str,
}

impl CliRuntime {
    pub fn new(bin: &'static str) -> Self {
        Self { bin }
    }

    /// Auto-detect the engine by checking PATH, preferring docker.
    /// Falls back to docker if neither is found (fails later with a
    /// clear "command not found" error).
    pub fn detect() -> Self {
        if which("docker").is_ok() {
            Self::new("docker")
        } else if which("podman").is_ok() {
            Self::new("podman")
        } else {
            debug!("neither docker nor podman found in PATH, defaulting to docker");
            Self::new("docker")
        }
    }

    /// Engine-specific default build flags.
    pub fn build_args(&self) -> Vec<String> {
        match self.bin {
            "podman" => vec!["--layers".to_string(), "--pull=newer".to_string()],
            _ => vec!["--progress=auto".to_string()],
        }
    }
}

impl Runtime for CliRuntime {
    fn name(&self) -> &str {
        self.bin
    }

    fn image_exists(&self, tag: &str) -> bool {
        Cmd::new(self.bin)
            .args(["image", "inspect", tag])
            .run_as_check()
            .unwrap_or(false)
    }

    fn image_inspect(&self, tag: &str, format: &str) -> Result<String> {
        Cmd::new(self.bin)
            .args(["image", "inspect", "--format", format, tag])
            .run_and_capture_stdout()
    }

    fn build(&self, args: &[String], ctx_dir: &Path) -> Result<()> {
        let mut cmd = std::process::Command::new(self.bin);
        cmd.env("DOCKER_BUILDKIT", "1")
            .env("DOCKER_CLI_HINTS", "false")
            .arg("build")
            .args(args)
            .current_dir(ctx_dir)
            .stdin(Stdio::null());
        crate::spinner::with_streaming_command("Building image", cmd)
    }

    fn pull(&self, reference: &str) -> Result<()> {
        Cmd::new(self.bin)
            .args(["pull", reference])
            .run()
            .map(|_| ())
            .with_context(|| format!("Failed to pull image '{}'", reference))
    }

    fn tag(&self, src: &str, dst: &str) -> Result<()> {
        Cmd::new(self.bin).args(["tag", src, dst]).run().map(|_| ())
    }

    fn network_create(&self, name: &str, subnet: &str) -> Result<()> {
        Cmd::new(self.bin)
            .args(["network", "create", "--subnet", subnet, name])
            .run()
            .map(|_| ())
            .with_context(|| format!("Failed to create network '{}'", name))
    }

    fn network_rm(&self, name: &str) -> Result<()> {
        Cmd::new(self.bin)
            .args(["network", "rm", name])
            .run()
            .map(|_| ())
    }

    fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut cmd = Cmd::new(self.bin).arg("run");
        if spec.detached {
            cmd = cmd.arg("-d");
        }
        if spec.remove_on_exit {
            cmd = cmd.arg("--rm");
        }
        if !spec.name.is_empty() {
            cmd = cmd.arg("--name").arg(spec.name.as_str());
        }
        if let Some(network) = &spec.network {
            cmd = cmd.arg("--network").arg(network.as_str());
        }
        for (source, target, read_only) in &spec.mounts {
            let mut mount = format!(
                "type=bind,source={},target={}",
                source.display(),
                target
            );
            if *read_only {
                mount.push_str(",readonly");
            }
            cmd = cmd.arg("--mount").arg(mount);
        }
        for (key, value) in &spec.env {
            cmd = cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        if let Some(workdir) = &spec.workdir {
            cmd = cmd.arg("--workdir").arg(workdir.as_str());
        }
        if let Some(user) = &spec.user {
            cmd = cmd.arg("--user").arg(user.as_str());
        }
        cmd = cmd.arg(spec.image.as_str());
        cmd = cmd.args(spec.command.iter().cloned());
        cmd.run_and_capture_stdout()
    }

    fn exec(&self, container_id: &str, argv: &[String]) -> Result<String> {
        Cmd::new(self.bin)
            .args(["exec", container_id])
            .args(argv.iter().cloned())
            .run_and_capture_stdout()
    }

    fn exec_interactive(&self, container_id: &str, argv: &[String]) -> Result<()> {
        let status = Cmd::new(self.bin)
            .args(["exec", "-it", container_id])
            .args(argv.iter().cloned())
            .run_interactive()?;
        if !status.success() {
            anyhow::bail!(
                "exec in container {} exited with {}",
                container_id,
                status.code().unwrap_or(-1)
            );
        }
        Ok(())
    }

    fn stop(&self, container_id: &str) -> Result<()> {
        Cmd::new(self.bin)
            .args(["stop", "-t", "2", container_id])
            .run()
            .map(|_| ())
    }

    fn rm(&self, container_id: &str) -> Result<()> {
        Cmd::new(self.bin)
            .args(["rm", "-f", container_id])
            .run()
            .map(|_| ())
    }
}

/// The uid:gid string for the invoking user, used to run agent containers
/// unprivileged against bind-mounted project files.
pub fn current_user_spec() -> String {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    format!("{}:{}", uid, gid)
}
