use anyhow::{Context, Result, anyhow};
use std::process::{Command, Output};
use tracing::{debug, trace};

/// A builder for executing external commands with unified error handling.
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<String>,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(self.command);
        cmd.args(&self.args);
        cmd
    }

    /// Execute the command and return the output.
    /// Returns an error if the command fails (non-zero exit code).
    pub fn run(self) -> Result<Output> {
        trace!(command = self.command, args = ?self.args, "cmd:run start");

        let output = self.build().output().with_context(|| {
            format!(
                "Failed to execute command: {} {}",
                self.command,
                self.args.join(" ")
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = self.command,
                args = ?self.args,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {} {}\n{}",
                self.command,
                self.args.join(" "),
                stderr.trim()
            ));
        }
        trace!(command = self.command, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails.
    /// This is useful for commands that are used as checks (e.g., image existence).
    pub fn run_as_check(self) -> Result<bool> {
        trace!(command = self.command, args = ?self.args, "cmd:check start");

        let output = self.build().output().with_context(|| {
            format!(
                "Failed to execute command: {} {}",
                self.command,
                self.args.join(" ")
            )
        })?;

        let success = output.status.success();
        trace!(command = self.command, success, "cmd:check result");
        Ok(success)
    }

    /// Execute the command inheriting stdio (interactive), returning its exit status.
    /// Used for attached container runs and editors, where the child owns the tty.
    pub fn run_interactive(self) -> Result<std::process::ExitStatus> {
        trace!(command = self.command, args = ?self.args, "cmd:interactive start");

        let status = self.build().status().with_context(|| {
            format!(
                "Failed to execute command: {} {}",
                self.command,
                self.args.join(" ")
            )
        })?;
        trace!(command = self.command, status = ?status.code(), "cmd:interactive done");
        Ok(status)
    }
}
