//! `sessions.json` snapshot file.
//!
//! The whole store is rewritten on every mutating operation. Writes go to a
//! temp file that is renamed over the real one, and each snapshot carries the
//! store revision it was taken at so an older snapshot never overwrites a
//! newer one when two threads race to save.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use blockshell_common::mutex_lock_or_recover;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::PersistenceError;
use crate::store::model::Block;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: String,
    pub name: String,
    pub cwd: String,
    pub shell: String,
}

/// Borrowed view of the store, serialized while the store lock is held.
#[derive(Serialize)]
pub(crate) struct SnapshotRef<'a> {
    pub sessions: Vec<PersistedSession>,
    pub blocks: Vec<&'a Block>,
}

/// What survived loading; malformed entries are dropped.
#[derive(Debug, Default)]
pub struct LoadedSnapshot {
    pub sessions: Vec<PersistedSession>,
    pub blocks: Vec<Block>,
    pub skipped: usize,
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    sessions: Vec<Value>,
    #[serde(default)]
    blocks: Vec<Value>,
}

pub struct SessionPersistence {
    path: PathBuf,
    last_written: Mutex<u64>,
}

impl SessionPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Write `contents` unless a snapshot with a later revision already landed.
    /// Returns whether the file was written.
    pub fn write(&self, revision: u64, contents: &str) -> Result<bool, PersistenceError> {
        let mut last = mutex_lock_or_recover(&self.last_written);
        if revision < *last {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_error(parent, e))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| Self::io_error(&temp_path, e))?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .map_err(|e| Self::io_error(&temp_path, e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| Self::io_error(&self.path, e))?;

        *last = revision;
        Ok(true)
    }

    /// Read the snapshot. A missing file is an empty snapshot; an unreadable
    /// or corrupted one is logged and treated the same way.
    pub fn load(&self) -> LoadedSnapshot {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadedSnapshot::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read sessions file");
                return LoadedSnapshot::default();
            }
        };

        let raw: RawSnapshot = match serde_json::from_str(&contents) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Sessions file corrupted, starting with empty store"
                );
                return LoadedSnapshot::default();
            }
        };

        let mut loaded = LoadedSnapshot::default();
        for entry in raw.sessions {
            match session_from_value(&entry) {
                Some(session) => loaded.sessions.push(session),
                None => loaded.skipped += 1,
            }
        }
        for entry in raw.blocks {
            match serde_json::from_value::<Block>(entry) {
                Ok(block) => loaded.blocks.push(block),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed block in sessions file");
                    loaded.skipped += 1;
                }
            }
        }
        loaded
    }
}

/// Sessions need only an id; the other fields fall back to defaults.
fn session_from_value(value: &Value) -> Option<PersistedSession> {
    let field = |key: &str, default: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };
    let id = field("id", "");
    if id.is_empty() {
        return None;
    }
    Some(PersistedSession {
        id,
        name: field("name", "Default"),
        cwd: field("cwd", "."),
        shell: field("shell", blockshell_terminal::DEFAULT_SHELL),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn persistence() -> (tempfile::TempDir, SessionPersistence) {
        let dir = tempfile::tempdir().unwrap();
        let p = SessionPersistence::new(dir.path().join("nested/sessions.json"));
        (dir, p)
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let (_dir, p) = persistence();
        let loaded = p.load();
        assert!(loaded.sessions.is_empty());
        assert!(loaded.blocks.is_empty());
    }

    #[test]
    fn test_write_creates_directory_and_leaves_no_temp_file() {
        let (_dir, p) = persistence();
        assert!(p.write(1, r#"{"sessions":[],"blocks":[]}"#).unwrap());
        assert!(p.path().exists());
        assert!(!p.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_stale_revision_is_not_written() {
        let (_dir, p) = persistence();
        p.write(5, r#"{"sessions":[{"id":"new"}]}"#).unwrap();
        assert!(!p.write(4, r#"{"sessions":[{"id":"old"}]}"#).unwrap());
        assert_eq!(p.load().sessions[0].id, "new");
    }

    #[test]
    fn test_corrupted_file_loads_empty() {
        let (_dir, p) = persistence();
        p.write(1, "{ not json").unwrap();
        assert!(p.load().sessions.is_empty());
    }

    #[test]
    fn test_malformed_entries_are_skipped_and_defaults_applied() {
        let (_dir, p) = persistence();
        let doc = json!({
            "sessions": [{"id": "s1"}, {"name": "no id"}, {"id": "s2", "name": "Work", "cwd": "/w", "shell": "/bin/zsh"}],
            "blocks": [
                {"id": "b1", "session_id": "s1", "command": "ls", "cwd": "/",
                 "start_time": 1, "end_time": 2, "exit_code": 0, "state": 1},
                {"id": "broken"}
            ]
        });
        p.write(1, &doc.to_string()).unwrap();

        let loaded = p.load();
        assert_eq!(loaded.skipped, 2);
        assert_eq!(loaded.sessions.len(), 2);
        assert_eq!(
            loaded.sessions[0],
            PersistedSession {
                id: "s1".into(),
                name: "Default".into(),
                cwd: ".".into(),
                shell: "/bin/bash".into(),
            }
        );
        assert_eq!(loaded.sessions[1].shell, "/bin/zsh");
        assert_eq!(loaded.blocks.len(), 1);
        assert_eq!(loaded.blocks[0].id, "b1");
    }
}
