//! Shared test helpers.
//!
//! XDG paths are read from process-global env vars, so tests that touch
//! them serialize on one mutex and restore the previous values on drop.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tempfile::TempDir;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

const VARS: &[&str] = &[
    "EXITBOX_HOME",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "XDG_RUNTIME_DIR",
    "EXITBOX_SQUID_DNS",
];

/// Redirects every ExitBox directory into a fresh tempdir for the duration
/// of a test. Holding the guard also holds the process-wide env lock.
pub struct EnvGuard {
    _tmp: TempDir,
    saved: HashMap<&'static str, Option<String>>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    pub fn isolated() -> Self {
        let lock = ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let tmp = tempfile::tempdir().expect("create tempdir");
        let mut saved = HashMap::new();
        for var in VARS {
            saved.insert(*var, std::env::var(var).ok());
        }

        let base = tmp.path();
        // SAFETY: the env lock serializes all mutation of these vars.
        unsafe {
            std::env::set_var("EXITBOX_HOME", base.join("config"));
            std::env::set_var("XDG_CONFIG_HOME", base.join("xdg-config"));
            std::env::set_var("XDG_DATA_HOME", base.join("xdg-data"));
            std::env::set_var("XDG_CACHE_HOME", base.join("xdg-cache"));
            std::env::set_var("XDG_RUNTIME_DIR", base.join("xdg-runtime"));
            std::env::remove_var("EXITBOX_SQUID_DNS");
        }
        std::fs::create_dir_all(base.join("xdg-runtime")).expect("create runtime dir");

        Self {
            _tmp: tmp,
            saved,
            _lock: lock,
        }
    }

    /// Set an extra variable under the same lock.
    pub fn set(&self, key: &str, value: &str) {
        // SAFETY: guarded by the held env lock.
        unsafe { std::env::set_var(key, value) };
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (var, value) in &self.saved {
            // SAFETY: guarded by the held env lock.
            unsafe {
                match value {
                    Some(v) => std::env::set_var(var, v),
                    None => std::env::remove_var(var),
                }
            }
        }
    }
}
