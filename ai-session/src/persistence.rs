//! On-disk durability for session metadata: atomic file I/O and the
//! register/unregister/save/restore cycle used for restart-resume.
//!
//! Grounded on the teacher's `persistence/session_store.rs`, with two
//! deliberate departures: writes go through a temp-file-then-rename (the
//! teacher writes in place, so a crash mid-write can corrupt the file), and
//! there is no global singleton — `SessionStore` is a plain struct a caller
//! holds behind an `Arc`, constructed explicitly rather than reached via a
//! `static mut` + `Once`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::backend::SessionBackend;
use crate::core::error::SessionResult;
use crate::session::{RuntimeType, SessionOptions};

/// Current on-disk schema version. Files with any other version are
/// ignored (treated as "no saved state") with a logged warning.
pub const STATE_VERSION: u32 = 1;

/// Write-temp-then-rename, with a safe-read-with-default counterpart for
/// readers that must tolerate a missing or corrupt file.
pub struct AtomicFile;

impl AtomicFile {
    /// Serialize `value` and atomically replace the file at `path`.
    /// `sync_all` runs before the rename so a crash after it cannot observe
    /// a half-written target.
    pub fn write_json<T: Serialize>(path: &Path, value: &T) -> SessionResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(value).map_err(|e| anyhow::anyhow!(e))?;

        let file = std::fs::File::create(&tmp_path)?;
        {
            use std::io::Write;
            let mut writer = std::io::BufWriter::new(&file);
            writer.write_all(json.as_bytes())?;
            writer.flush()?;
        }
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Read and parse `path`, returning `T::default()` (and logging) if the
    /// file is missing, unreadable, or fails to parse.
    pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "ignoring malformed persisted state");
                    T::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "failed to read persisted state");
                T::default()
            }
        }
    }
}

/// A single session's restart-resume metadata, independent of its current
/// (possibly not-running) process state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSessionInfo {
    pub name: String,
    pub cwd: PathBuf,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub runtime_type: RuntimeType,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub external_session_id: Option<String>,
}

impl From<&PersistedSessionInfo> for SessionOptions {
    fn from(info: &PersistedSessionInfo) -> Self {
        SessionOptions {
            cwd: info.cwd.clone(),
            command: info.command.clone(),
            args: info.args.clone(),
            env: info.env.clone(),
            rows: 24,
            cols: 80,
            runtime_type: info.runtime_type,
            role: info.role.clone(),
            team_id: info.team_id.clone(),
            member_id: info.member_id.clone(),
            external_session_id: info.external_session_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: chrono::DateTime<chrono::Utc>,
    pub sessions: Vec<PersistedSessionInfo>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: chrono::Utc::now(),
            sessions: Vec::new(),
        }
    }
}

/// Resolve `$CREWLY_HOME/session-state.json`, falling back to
/// `~/.crewly/session-state.json`.
pub fn state_file_path() -> PathBuf {
    let home = std::env::var_os("CREWLY_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".crewly")))
        .unwrap_or_else(|| PathBuf::from(".crewly"));
    home.join("session-state.json")
}

/// Durable registry of session metadata, independent of the live
/// [`SessionBackend`] — this is what survives a process restart.
pub struct SessionStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, PersistedSessionInfo>>,
    restored_names: RwLock<HashSet<String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::at_path(state_file_path())
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            entries: RwLock::new(HashMap::new()),
            restored_names: RwLock::new(HashSet::new()),
        }
    }

    /// Record metadata for a newly created session and auto-save.
    pub fn register_session(&self, name: &str, options: &SessionOptions) -> SessionResult<()> {
        let info = PersistedSessionInfo {
            name: name.to_string(),
            cwd: options.cwd.clone(),
            command: options.command.clone(),
            args: options.args.clone(),
            runtime_type: options.runtime_type,
            role: options.role.clone(),
            team_id: options.team_id.clone(),
            member_id: options.member_id.clone(),
            env: options.env.clone(),
            external_session_id: options.external_session_id.clone(),
        };
        self.entries.write().unwrap().insert(name.to_string(), info);
        self.save_state()
    }

    /// Remove a session's metadata and auto-save.
    pub fn unregister_session(&self, name: &str) -> SessionResult<()> {
        self.entries.write().unwrap().remove(name);
        self.save_state()
    }

    /// Record the agent-reported conversation id used to resume the
    /// logical dialog across restarts, and auto-save.
    pub fn update_session_id(&self, name: &str, external_session_id: &str) -> SessionResult<()> {
        let mut entries = self.entries.write().unwrap();
        if let Some(info) = entries.get_mut(name) {
            info.external_session_id = Some(external_session_id.to_string());
        }
        drop(entries);
        self.save_state()
    }

    /// Serialize current metadata to disk, atomically.
    pub fn save_state(&self) -> SessionResult<()> {
        let sessions: Vec<PersistedSessionInfo> = self.entries.read().unwrap().values().cloned().collect();
        let state = PersistedState {
            version: STATE_VERSION,
            saved_at: chrono::Utc::now(),
            sessions,
        };
        AtomicFile::write_json(&self.path, &state)
    }

    /// Read the state file and spawn a session per entry via `backend`.
    /// Returns the number of sessions restored. Entries whose name is
    /// already present in the backend (e.g. a test seeded one) are skipped,
    /// not treated as an error.
    pub async fn restore_state(&self, backend: &SessionBackend) -> SessionResult<usize> {
        let state: PersistedState = AtomicFile::read_json_or_default(&self.path);
        if state.version != STATE_VERSION {
            if !state.sessions.is_empty() || state.version != 0 {
                tracing::warn!(version = state.version, "ignoring persisted state with unsupported version");
            }
            return Ok(0);
        }

        let mut restored = 0;
        let mut entries = self.entries.write().unwrap();
        let mut restored_names = self.restored_names.write().unwrap();
        for info in &state.sessions {
            entries.insert(info.name.clone(), info.clone());
            if backend.exists(&info.name) {
                continue;
            }
            let options = SessionOptions::from(info);
            match backend.create(&info.name, options).await {
                Ok(_) => {
                    restored_names.insert(info.name.clone());
                    restored += 1;
                }
                Err(err) => {
                    tracing::warn!(session = %info.name, %err, "failed to restore persisted session");
                }
            }
        }
        Ok(restored)
    }

    pub fn is_restored_session(&self, name: &str) -> bool {
        self.restored_names.read().unwrap().contains(name)
    }

    /// Drop all in-memory metadata and remove the on-disk file.
    pub fn clear_state(&self) -> SessionResult<()> {
        self.entries.write().unwrap().clear();
        self.restored_names.write().unwrap().clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RuntimeType;

    fn opts() -> SessionOptions {
        SessionOptions::new("/tmp", "/bin/zsh", RuntimeType::ClaudeCode)
    }

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = PersistedState {
            version: STATE_VERSION,
            saved_at: chrono::Utc::now(),
            sessions: vec![],
        };
        AtomicFile::write_json(&path, &state).unwrap();
        let read: PersistedState = AtomicFile::read_json_or_default(&path);
        assert_eq!(read.version, STATE_VERSION);
    }

    #[test]
    fn missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let read: PersistedState = AtomicFile::read_json_or_default(&path);
        assert_eq!(read.sessions.len(), 0);
    }

    #[test]
    fn malformed_file_reads_as_default_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();
        let read: PersistedState = AtomicFile::read_json_or_default(&path);
        assert_eq!(read.sessions.len(), 0);
    }

    #[tokio::test]
    async fn cold_start_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::at_path(dir.path().join("state.json"));
        let backend = SessionBackend::new();
        let restored = store.restore_state(&backend).await.unwrap();
        assert_eq!(restored, 0);
    }

    #[tokio::test]
    async fn register_then_restore_recreates_session_and_keeps_external_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut options = opts();
        options.command = "sh".to_string();
        options.args = vec!["-c".to_string(), "sleep 30".to_string()];
        options.external_session_id = Some("abc".to_string());

        let store = SessionStore::at_path(path.clone());
        store.register_session("orc", &options).unwrap();

        let backend = SessionBackend::new();
        let restored_count = store.restore_state(&backend).await.unwrap();
        assert_eq!(restored_count, 1);
        assert!(store.is_restored_session("orc"));
        assert!(backend.exists("orc"));

        let session = backend.get("orc").unwrap();
        assert_eq!(session.external_session_id().as_deref(), Some("abc"));
        backend.kill("orc").await.unwrap();
    }

    #[test]
    fn unregister_removes_entry_from_next_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = SessionStore::at_path(path.clone());
        store.register_session("dev-1", &opts()).unwrap();
        store.unregister_session("dev-1").unwrap();

        let state: PersistedState = AtomicFile::read_json_or_default(&path);
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn clear_state_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = SessionStore::at_path(path.clone());
        store.register_session("dev-1", &opts()).unwrap();
        assert!(path.exists());
        store.clear_state().unwrap();
        assert!(!path.exists());
    }
}
