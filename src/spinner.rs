//! Terminal spinners for long-running operations.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

/// A spinner that resolves into a ✔/✘ summary line.
struct Spinner {
    bar: ProgressBar,
    label: String,
}

impl Spinner {
    fn new(label: &str) -> Self {
        let bar = ProgressBar::new_spinner()
            .with_style(
                ProgressStyle::with_template("{spinner:.cyan} {msg}")
                    .expect("static spinner template"),
            )
            .with_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            label: label.to_string(),
        }
    }

    fn finish(&self, ok: bool) {
        let mark = if ok { "✔" } else { "✘" };
        self.bar
            .finish_with_message(format!("{} {}", mark, self.label));
    }
}

/// Run a fallible operation behind a spinner.
pub fn with_spinner<T>(label: &str, op: impl FnOnce() -> Result<T>) -> Result<T> {
    let spinner = Spinner::new(label);
    let result = op();
    spinner.finish(result.is_ok());
    result
}

/// Run a command behind a spinner, echoing its stdout and stderr above
/// the spinner line as they arrive.
pub fn with_streaming_command(label: &str, mut cmd: Command) -> Result<()> {
    let spinner = Spinner::new(label);

    let mut child = match cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn() {
        Ok(child) => child,
        Err(e) => {
            spinner.finish(false);
            return Err(anyhow::anyhow!("Failed to spawn command: {}", e));
        }
    };

    let pipes: Vec<Box<dyn Read + Send>> = [
        child
            .stdout
            .take()
            .map(|p| Box::new(p) as Box<dyn Read + Send>),
        child
            .stderr
            .take()
            .map(|p| Box::new(p) as Box<dyn Read + Send>),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut echoers = Vec::new();
    for pipe in pipes {
        let bar = spinner.bar.clone();
        echoers.push(std::thread::spawn(move || {
            for line in BufReader::new(pipe).lines().map_while(|l| l.ok()) {
                if !line.trim().is_empty() {
                    bar.println(&line);
                }
            }
        }));
    }
    for echoer in echoers {
        let _ = echoer.join();
    }

    match child.wait() {
        Ok(status) if status.success() => {
            spinner.finish(true);
            Ok(())
        }
        Ok(status) => {
            spinner.finish(false);
            anyhow::bail!("{} (exit code: {})", label, status.code().unwrap_or(-1))
        }
        Err(e) => {
            spinner.finish(false);
            Err(anyhow::anyhow!("Failed to wait for command: {}", e))
        }
    }
}
