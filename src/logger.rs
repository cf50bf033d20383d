//! File logging setup.
//!
//! Everything goes to `<state>/exitbox.log` as plain text through a
//! non-blocking appender, filtered by `RUST_LOG` (default `info`).
//! The writer guard doubles as the once-per-process marker and lives
//! until exit so buffered lines are flushed.

use std::fs;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config;

const LOG_FILE: &str = "exitbox.log";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init() -> Result<()> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let dir = config::state_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory at {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(rolling::never(&dir, LOG_FILE));
    if GUARD.set(guard).is_err() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
