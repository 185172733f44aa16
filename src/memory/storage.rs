//! Persistence collaborators for `AgentState`.
//!
//! The core only ever hands a fully serialized state to `write`; it never
//! writes mid-mutation. File-backed writes go through a temp file and a
//! rename so readers never observe a partial file, and a per-user lock file
//! keeps at most one write in flight for each user id.
//!
//! Directory layout, where {key} is the user id with every byte outside
//! `[A-Za-z0-9-]` written as `_xx` hex:
//!   {state_dir}/{key}.json       current state
//!   {state_dir}/{key}.json.bak   previous version
//!   {state_dir}/{key}.json.tmp   in-flight write
//!   {state_dir}/{key}.lock       write lock

use crate::{MemoryError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Byte-level storage keyed by user id.
pub trait StateStorage {
    /// Serialized state for `user_id`, or `None` if nothing was persisted.
    fn read(&self, user_id: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the persisted state for `user_id`.
    fn write(&self, user_id: &str, bytes: &[u8]) -> Result<()>;

    /// User ids with persisted state, sorted.
    fn list_users(&self) -> Result<Vec<String>>;
}

/// One JSON file per user under a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    /// Remove a lock left behind by a dead writer instead of failing
    force: bool,
}

impl FileStorage {
    /// Create a file store. Creates the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| persistence("create", &dir, e))?;
        Ok(Self { dir, force: false })
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(user_id)))
    }

    fn backup_path(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json.bak", encode_key(user_id)))
    }

    fn tmp_path(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json.tmp", encode_key(user_id)))
    }

    fn lock_path(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", encode_key(user_id)))
    }

    pub fn exists(&self, user_id: &str) -> bool {
        self.state_path(user_id).exists()
    }

    fn acquire_lock(&self, user_id: &str) -> Result<LockGuard> {
        let path = self.lock_path(user_id);
        match create_lock_file(&path) {
            Ok(()) => Ok(LockGuard { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !self.force {
                    warn!("State for {} is locked by another writer", user_id);
                    return Err(MemoryError::Persistence(format!(
                        "state for '{}' is locked by another writer ({}); use --force to remove a stale lock",
                        user_id,
                        path.display()
                    )));
                }
                warn!("Removing stale lock {}", path.display());
                fs::remove_file(&path).map_err(|e| persistence("remove stale lock", &path, e))?;
                create_lock_file(&path).map_err(|e| persistence("lock", &path, e))?;
                Ok(LockGuard { path })
            }
            Err(e) => Err(persistence("lock", &path, e)),
        }
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    let _ = writeln!(
        file,
        "pid={} time={}",
        std::process::id(),
        Utc::now().to_rfc3339()
    );
    Ok(())
}

impl StateStorage for FileStorage {
    fn read(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.state_path(user_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence("read", &path, e)),
        }
    }

    fn write(&self, user_id: &str, bytes: &[u8]) -> Result<()> {
        let _guard = self.acquire_lock(user_id)?;

        let primary = self.state_path(user_id);
        let backup = self.backup_path(user_id);
        let tmp = self.tmp_path(user_id);

        if primary.exists() {
            fs::copy(&primary, &backup).map_err(|e| persistence("backup", &primary, e))?;
        }

        let mut file = fs::File::create(&tmp).map_err(|e| persistence("create", &tmp, e))?;
        file.write_all(bytes).map_err(|e| persistence("write", &tmp, e))?;
        file.flush().map_err(|e| persistence("flush", &tmp, e))?;
        let _ = file.sync_all();
        drop(file);

        fs::rename(&tmp, &primary).map_err(|e| persistence("replace", &primary, e))?;
        debug!("Wrote {} bytes to {}", bytes.len(), primary.display());
        Ok(())
    }

    fn list_users(&self) -> Result<Vec<String>> {
        let mut users = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| persistence("list", &self.dir, e))?;
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = name.strip_suffix(".json") {
                    match decode_key(key) {
                        Some(user_id) => users.push(user_id),
                        None => warn!("Skipping unrecognized state file {}", name),
                    }
                }
            }
        }
        users.sort();
        Ok(users)
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// In-process storage for tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    states: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemoryStorage {
    fn read(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        let states = self
            .states
            .read()
            .map_err(|_| MemoryError::Persistence("storage lock poisoned".to_string()))?;
        Ok(states.get(user_id).cloned())
    }

    fn write(&self, user_id: &str, bytes: &[u8]) -> Result<()> {
        let mut states = self
            .states
            .write()
            .map_err(|_| MemoryError::Persistence("storage lock poisoned".to_string()))?;
        states.insert(user_id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list_users(&self) -> Result<Vec<String>> {
        let states = self
            .states
            .read()
            .map_err(|_| MemoryError::Persistence("storage lock poisoned".to_string()))?;
        let mut users: Vec<String> = states.keys().cloned().collect();
        users.sort();
        Ok(users)
    }
}

fn persistence(action: &str, path: &Path, err: std::io::Error) -> MemoryError {
    MemoryError::Persistence(format!("{} {}: {}", action, path.display(), err))
}

/// File-name key for a user id. Bytes outside `[A-Za-z0-9-]` (including
/// `_`) become `_xx`, so distinct ids never share a file.
fn encode_key(user_id: &str) -> String {
    let mut key = String::with_capacity(user_id.len());
    for byte in user_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            key.push(byte as char);
        } else {
            key.push_str(&format!("_{:02x}", byte));
        }
    }
    key
}

fn decode_key(key: &str) -> Option<String> {
    let raw = key.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'_' {
            let hex = key.get(i + 1..i + 3)?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).ok()
}
