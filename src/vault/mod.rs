//! Encrypted per-workspace secret vault.
//!
//! Secrets are stored one file per entry under the vault's `db/`
//! directory. Entry files are named by the SHA-256 of the key and contain
//! a random 96-bit nonce followed by the AES-256-GCM ciphertext of the
//! serialized (key, value) pair, so neither key names nor values are
//! readable on disk. The cipher key is derived from the vault password
//! with Argon2id; a fixed sentinel entry is the password-acceptance test.

mod env;

pub use env::{export_env_format, parse_env_file};

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result, anyhow, bail};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config;

// Argon2id parameters (OWASP recommended). Roughly one second of
// derivation on a modern CPU; do not weaken.
const ARGON_TIME: u32 = 3;
const ARGON_MEMORY_KIB: u32 = 64 * 1024;
const ARGON_LANES: u32 = 4;
const KEY_LEN: usize = 32;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Sentinel entry used to verify the password is correct.
const VERIFY_KEY: &str = "__vault_verify__";
const VERIFY_VALUE: &str = "exitbox-vault-v1";

/// Keys wrapped in double underscores are reserved for vault internals.
fn is_reserved(key: &str) -> bool {
    key.starts_with("__") && key.ends_with("__")
}

fn vault_dir(workspace: &str) -> PathBuf {
    config::data_dir().join("vaults").join(workspace)
}

fn salt_path(workspace: &str) -> PathBuf {
    vault_dir(workspace).join("salt")
}

fn db_dir(workspace: &str) -> PathBuf {
    vault_dir(workspace).join("db")
}

/// Derive the 256-bit cipher key from password and salt.
fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let params = Params::new(ARGON_MEMORY_KIB, ARGON_TIME, ARGON_LANES, Some(KEY_LEN))
        .map_err(|e| anyhow!("argon2 parameters: {}", e))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("key derivation failed: {}", e))?;
    Ok(key)
}

#[derive(Serialize, Deserialize)]
struct Entry {
    k: String,
    v: String,
}

/// An open, unlocked vault. Exclusively owned while open; the on-disk
/// lock is released by `close` (or drop).
pub struct Store {
    dir: PathBuf,
    cipher: Aes256Gcm,
    lock_path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .field("lock_path", &self.lock_path)
            .finish_non_exhaustive()
    }
}

/// Check whether a vault exists for the workspace.
pub fn is_initialized(workspace: &str) -> bool {
    salt_path(workspace).exists()
}

/// Create a new vault with an empty encrypted database.
pub fn init(workspace: &str, password: &str) -> Result<()> {
    let dir = vault_dir(workspace);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create vault directory {}", dir.display()))?;

    let salt_file = salt_path(workspace);
    if salt_file.exists() {
        bail!("vault already exists for workspace '{}'", workspace);
    }

    let mut salt = [0u8; SALT_LEN];
    getrandom::fill(&mut salt).map_err(|e| anyhow!("failed to generate salt: {}", e))?;
    write_private_file(&salt_file, &salt, 0o600).context("Failed to write salt")?;

    let db = db_dir(workspace);
    let result = (|| {
        create_private_dir(&db, 0o700)?;
        let key = derive_key(password, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        let store = Store {
            dir: db.clone(),
            cipher,
            lock_path: db.join(".lock"),
        };
        store.write_entry(VERIFY_KEY, VERIFY_VALUE)?;
        Ok(())
    })();

    if result.is_err() {
        // Roll back the half-created vault.
        let _ = fs::remove_dir_all(&db);
        let _ = fs::remove_file(&salt_file);
    }
    result
}

/// Decrypt and open the vault, returning a store handle.
/// The caller must call `close` when done.
pub fn open(workspace: &str, password: &str) -> Result<Store> {
    let salt = fs::read(salt_path(workspace))
        .with_context(|| format!("reading salt (vault not initialized for '{}'?)", workspace))?;
    if salt.len() != SALT_LEN {
        bail!("corrupted salt file");
    }

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
    let dir = db_dir(workspace);
    let lock_path = dir.join(".lock");
    acquire_lock(&lock_path)?;

    let store = Store {
        dir,
        cipher,
        lock_path,
    };

    // Verify the password by decrypting the sentinel entry. The error is
    // deliberately generic; nothing about stored keys leaks.
    match store.read_entry(VERIFY_KEY) {
        Ok(value) if value == VERIFY_VALUE => Ok(store),
        _ => {
            store.release_lock();
            bail!("wrong password or corrupted vault")
        }
    }
}

/// Remove the entire vault directory for a workspace.
pub fn destroy(workspace: &str) -> Result<()> {
    let dir = vault_dir(workspace);
    if dir.exists() {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove vault at {}", dir.display()))?;
    }
    Ok(())
}

impl Store {
    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(hex::encode(digest))
    }

    fn write_entry(&self, key: &str, value: &str) -> Result<()> {
        let plaintext = serde_json::to_vec(&Entry {
            k: key.to_string(),
            v: value.to_string(),
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce_bytes).map_err(|e| anyhow!("failed to generate nonce: {}", e))?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        write_private_file(&self.entry_path(key), &blob, 0o600)
            .with_context(|| format!("Failed to write vault entry for '{}'", key))
    }

    fn read_entry(&self, key: &str) -> Result<String> {
        let blob = fs::read(self.entry_path(key))?;
        self.decrypt_blob(&blob).map(|entry| entry.v)
    }

    fn decrypt_blob(&self, blob: &[u8]) -> Result<Entry> {
        if blob.len() < NONCE_LEN {
            bail!("corrupted vault entry");
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("wrong password or corrupted vault"))?;
        serde_json::from_slice(&plaintext).context("corrupted vault entry")
    }

    /// Read a single secret by key.
    pub fn get(&self, key: &str) -> Result<String> {
        match self.read_entry(key) {
            Ok(value) => Ok(value),
            Err(e) => {
                if !self.entry_path(key).exists() {
                    bail!("key '{}' not found in vault", key);
                }
                Err(e)
            }
        }
    }

    /// Write a key-value pair.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write_entry(key, value)
    }

    /// Remove a key. Fails if the key is absent.
    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        if !path.exists() {
            bail!("key '{}' not found in vault", key);
        }
        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete vault entry for '{}'", key))
    }

    /// Sorted key names, internal `__*__` entries hidden.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.all()?.into_keys().collect())
    }

    /// All key-value pairs, internal `__*__` entries hidden.
    pub fn all(&self) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for dir_entry in fs::read_dir(&self.dir).context("reading vault db")? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            if !dir_entry.file_type()?.is_file() || name.to_string_lossy().starts_with('.') {
                continue;
            }
            let blob = fs::read(dir_entry.path())?;
            let entry = self.decrypt_blob(&blob)?;
            if is_reserved(&entry.k) {
                continue;
            }
            out.insert(entry.k, entry.v);
        }
        Ok(out)
    }

    /// Merge parsed `.env` entries into the vault.
    pub fn import(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Replace every user entry with the given map. Observable as a
    /// delete-all followed by inserts, not atomic: callers must tolerate
    /// a crash-midway partial state.
    pub fn replace_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        for key in self.all()?.keys() {
            self.delete(key)?;
        }
        self.import(entries)
    }

    fn release_lock(&self) {
        let _ = fs::remove_file(&self.lock_path);
    }

    /// Close the store, releasing the on-disk lock.
    pub fn close(self) {
        // Drop does the cleanup.
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.release_lock();
    }
}

// ── One-shot helpers (open, act, close) ─────────────────────────────────

pub fn quick_get(workspace: &str, password: &str, key: &str) -> Result<String> {
    open(workspace, password)?.get(key)
}

pub fn quick_set(workspace: &str, password: &str, key: &str, value: &str) -> Result<()> {
    open(workspace, password)?.set(key, value)
}

pub fn quick_delete(workspace: &str, password: &str, key: &str) -> Result<()> {
    open(workspace, password)?.delete(key)
}

pub fn quick_list(workspace: &str, password: &str) -> Result<Vec<String>> {
    open(workspace, password)?.list()
}

/// Read a `.env` file and merge its pairs into the vault.
pub fn import_env_file(workspace: &str, password: &str, path: &Path) -> Result<()> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading source file {}", path.display()))?;
    let parsed = parse_env_file(&data);
    if parsed.is_empty() {
        bail!("no key-value pairs found in {}", path.display());
    }
    open(workspace, password)?.import(&parsed)
}

// ── Filesystem helpers ──────────────────────────────────────────────────

fn write_private_file(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}

fn create_private_dir(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Take the single-process ownership lock. A lock left by a dead process
/// is reaped; one held by a live process fails the open.
fn acquire_lock(lock_path: &Path) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(lock_path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(lock_path)
                    .ok()
                    .and_then(|s| s.trim().parse::<i32>().ok());
                match holder {
                    Some(pid) if process_alive(pid) => {
                        bail!("vault is locked by process {}", pid);
                    }
                    _ => {
                        debug!(path = %lock_path.display(), "reaping stale vault lock");
                        let _ = fs::remove_file(lock_path);
                        // Retry the create-exclusive.
                    }
                }
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to create vault lock at {}", lock_path.display())
                });
            }
        }
    }
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}
