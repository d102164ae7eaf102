//! The session/block store: the single source of truth for sessions and the
//! commands run in them.
//!
//! All state sits behind one mutex. Observers are notified on the calling
//! thread after that mutex has been released, so an observer may call back
//! into the store.

mod model;
mod persistence;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use blockshell_common::mutex_lock_or_recover;
use blockshell_common::rwlock_read_or_recover;
use blockshell_common::rwlock_write_or_recover;
use blockshell_terminal::DEFAULT_SHELL;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::PersistenceError;

pub use model::Block;
pub use model::BlockCompletion;
pub use model::BlockState;
pub use model::DEFAULT_SESSION_NAME;
pub use model::OutputChunk;
pub use model::Session;
pub use model::SessionConfig;
pub use model::SessionSummary;
pub use persistence::LoadedSnapshot;
pub use persistence::PersistedSession;
pub use persistence::SessionPersistence;

use persistence::SnapshotRef;

/// Receives block events after the store lock is released.
pub trait BlockObserver: Send + Sync {
    fn on_output(&self, block_id: &str, chunk: &OutputChunk);
    fn on_complete(&self, completion: &BlockCompletion);
}

#[derive(Default)]
struct StoreState {
    sessions: BTreeMap<String, Session>,
    blocks: BTreeMap<String, Block>,
    revision: u64,
}

impl StoreState {
    fn session_entry(&mut self, session_id: &str) -> &mut Session {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(default_session)
    }

    fn sessions_with_blocks(&self) -> BTreeSet<&str> {
        self.blocks.values().map(|b| b.session_id.as_str()).collect()
    }

    /// A session is worth keeping once it has run something or been named.
    fn is_materialized(session: &Session, has_blocks: bool) -> bool {
        has_blocks || session.name != DEFAULT_SESSION_NAME
    }

    fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        let with_blocks = self.sessions_with_blocks();
        let sessions: Vec<PersistedSession> = self
            .sessions
            .iter()
            .filter(|(id, s)| Self::is_materialized(s, with_blocks.contains(id.as_str())))
            .map(|(id, s)| PersistedSession {
                id: id.clone(),
                name: s.name.clone(),
                cwd: s.cwd.clone(),
                shell: s.shell.clone(),
            })
            .collect();
        let saved: BTreeSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        let blocks = self
            .blocks
            .values()
            .filter(|b| saved.contains(b.session_id.as_str()))
            .collect();

        serde_json::to_string_pretty(&SnapshotRef { sessions, blocks })
    }
}

fn default_session() -> Session {
    Session {
        name: DEFAULT_SESSION_NAME.to_string(),
        cwd: process_cwd(),
        shell: DEFAULT_SHELL.to_string(),
    }
}

fn process_cwd() -> String {
    std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/".to_string())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Output is stored as text. Valid UTF-8 passes through untouched; anything
/// else keeps its valid sequences and has each invalid one replaced with
/// U+FFFD.
fn sanitize_output(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

pub struct BlockStore {
    state: Mutex<StoreState>,
    observers: RwLock<Vec<Arc<dyn BlockObserver>>>,
    persistence: Option<SessionPersistence>,
}

impl BlockStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            observers: RwLock::new(Vec::new()),
            persistence: None,
        }
    }

    pub fn with_persistence(persistence: SessionPersistence) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::in_memory()
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn BlockObserver>) {
        rwlock_write_or_recover(&self.observers).push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn BlockObserver>> {
        rwlock_read_or_recover(&self.observers).clone()
    }

    /// Bump the revision and serialize under the lock; the caller writes the
    /// result with [`BlockStore::persist`] once the lock is gone.
    fn prepare_snapshot(&self, state: &mut StoreState) -> Option<(u64, String)> {
        self.persistence.as_ref()?;
        state.revision += 1;
        match state.snapshot_json() {
            Ok(json) => Some((state.revision, json)),
            Err(e) => {
                warn!(error = %e, "Failed to serialize sessions");
                None
            }
        }
    }

    fn persist(&self, snapshot: Option<(u64, String)>) {
        let (Some(persistence), Some((revision, json))) = (&self.persistence, snapshot) else {
            return;
        };
        if let Err(e) = persistence.write(revision, &json) {
            warn!(error = %e, "Failed to save sessions");
        }
    }

    pub fn create_session(&self, name: &str) -> String {
        let id = new_id();
        let snapshot = {
            let mut state = mutex_lock_or_recover(&self.state);
            state.sessions.insert(
                id.clone(),
                Session {
                    name: name.to_string(),
                    ..default_session()
                },
            );
            self.prepare_snapshot(&mut state)
        };
        self.persist(snapshot);
        info!(session_id = %id, name, "Created session");
        id
    }

    /// Materialized sessions only, ordered by id.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let state = mutex_lock_or_recover(&self.state);
        let with_blocks = state.sessions_with_blocks();
        state
            .sessions
            .iter()
            .filter(|(id, s)| StoreState::is_materialized(s, with_blocks.contains(id.as_str())))
            .map(|(id, s)| SessionSummary {
                id: id.clone(),
                name: s.name.clone(),
            })
            .collect()
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        mutex_lock_or_recover(&self.state)
            .sessions
            .contains_key(session_id)
    }

    /// Removes the session itself; its blocks stay in memory but are no
    /// longer persisted.
    pub fn delete_session(&self, session_id: &str) -> bool {
        let (removed, snapshot) = {
            let mut state = mutex_lock_or_recover(&self.state);
            let removed = state.sessions.remove(session_id).is_some();
            (removed, self.prepare_snapshot(&mut state))
        };
        self.persist(snapshot);
        removed
    }

    /// No-op for unknown sessions.
    pub fn rename_session(&self, session_id: &str, name: &str) -> bool {
        let snapshot = {
            let mut state = mutex_lock_or_recover(&self.state);
            match state.sessions.get_mut(session_id) {
                Some(session) => session.name = name.to_string(),
                None => return false,
            }
            self.prepare_snapshot(&mut state)
        };
        self.persist(snapshot);
        true
    }

    /// Copy of the session's cwd and shell. Unknown sessions report the
    /// defaults a new session would get.
    pub fn get_session_config_copy(&self, session_id: &str) -> SessionConfig {
        let state = mutex_lock_or_recover(&self.state);
        let session = state
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_else(default_session);
        SessionConfig {
            cwd: session.cwd,
            shell: session.shell,
        }
    }

    pub fn set_session_cwd(&self, session_id: &str, cwd: &str) {
        let snapshot = {
            let mut state = mutex_lock_or_recover(&self.state);
            state.session_entry(session_id).cwd = cwd.to_string();
            self.prepare_snapshot(&mut state)
        };
        self.persist(snapshot);
    }

    pub fn set_session_shell(&self, session_id: &str, shell: &str) {
        let snapshot = {
            let mut state = mutex_lock_or_recover(&self.state);
            state.session_entry(session_id).shell = shell.to_string();
            self.prepare_snapshot(&mut state)
        };
        self.persist(snapshot);
    }

    /// Start a block. Without `cwd` the block runs in the session's current
    /// directory; an explicit `cwd` applies to this block only and leaves the
    /// session untouched. Unknown sessions are created on the fly.
    pub fn create_block(&self, session_id: &str, command: &str, cwd: Option<&str>) -> String {
        let id = new_id();
        let (block_cwd, snapshot) = {
            let mut state = mutex_lock_or_recover(&self.state);
            let session = state.session_entry(session_id);
            let block_cwd = match cwd.filter(|c| !c.is_empty()) {
                Some(dir) => dir.to_string(),
                None => session.cwd.clone(),
            };
            state.blocks.insert(
                id.clone(),
                Block {
                    id: id.clone(),
                    session_id: session_id.to_string(),
                    command: command.to_string(),
                    cwd: block_cwd.clone(),
                    env: BTreeMap::new(),
                    start_time: now_ms(),
                    end_time: 0,
                    exit_code: 0,
                    state: BlockState::Running,
                    output_chunks: Vec::new(),
                    metadata: serde_json::Value::Null,
                },
            );
            (block_cwd, self.prepare_snapshot(&mut state))
        };
        self.persist(snapshot);
        info!(block_id = %id, command, cwd = %block_cwd, "Created block");
        id
    }

    /// Append a chunk and notify observers with it. Returns false for unknown
    /// blocks and for blocks that already finished.
    pub fn append_output(&self, block_id: &str, data: &[u8], kind: &str) -> bool {
        let chunk = {
            let mut state = mutex_lock_or_recover(&self.state);
            let Some(block) = state.blocks.get_mut(block_id) else {
                debug!(block_id, "append_output for unknown block");
                return false;
            };
            if block.state.is_terminal() {
                warn!(block_id, "append_output after completion ignored");
                return false;
            }
            let chunk = OutputChunk {
                data: sanitize_output(data),
                kind: kind.to_string(),
                timestamp_ms: now_ms(),
            };
            block.output_chunks.push(chunk.clone());
            chunk
        };

        for observer in self.observers() {
            observer.on_output(block_id, &chunk);
        }
        true
    }

    /// Finish a block exactly once. A second call, or a call for an unknown
    /// block, changes nothing and notifies nobody.
    pub fn complete_block(&self, block_id: &str, exit_code: i32) -> bool {
        let (completion, snapshot) = {
            let mut state = mutex_lock_or_recover(&self.state);
            let Some(block) = state.blocks.get_mut(block_id) else {
                debug!(block_id, "complete_block for unknown block");
                return false;
            };
            if block.state.is_terminal() {
                debug!(block_id, state = block.state.as_str(), "block already complete");
                return false;
            }
            block.end_time = now_ms();
            block.exit_code = exit_code;
            block.state = BlockState::for_exit_code(exit_code);
            let completion = BlockCompletion {
                block_id: block.id.clone(),
                session_id: block.session_id.clone(),
                exit_code,
                state: block.state,
                duration_ms: block.duration_ms(),
            };
            (completion, self.prepare_snapshot(&mut state))
        };
        self.persist(snapshot);
        info!(block_id, exit_code, duration_ms = completion.duration_ms, "Completed block");

        for observer in self.observers() {
            observer.on_complete(&completion);
        }
        true
    }

    pub fn get_block(&self, block_id: &str) -> Option<Block> {
        mutex_lock_or_recover(&self.state)
            .blocks
            .get(block_id)
            .cloned()
    }

    /// Blocks of a session, oldest first.
    pub fn list_blocks(&self, session_id: &str) -> Vec<Block> {
        let state = mutex_lock_or_recover(&self.state);
        let mut blocks: Vec<Block> = state
            .blocks
            .values()
            .filter(|b| b.session_id == session_id)
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.start_time);
        blocks
    }

    /// Write the current state now.
    pub fn save_sessions(&self) -> Result<(), PersistenceError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let (revision, json) = {
            let mut state = mutex_lock_or_recover(&self.state);
            state.revision += 1;
            (state.revision, state.snapshot_json()?)
        };
        persistence.write(revision, &json)?;
        Ok(())
    }

    /// Replace in-memory state with the snapshot on disk. Blocks that were
    /// still running when the snapshot was taken can never finish, so they
    /// come back cancelled.
    pub fn load_sessions(&self) -> LoadedSnapshot {
        let Some(persistence) = &self.persistence else {
            return LoadedSnapshot::default();
        };
        let loaded = persistence.load();

        let mut state = mutex_lock_or_recover(&self.state);
        state.sessions = loaded
            .sessions
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    Session {
                        name: s.name.clone(),
                        cwd: s.cwd.clone(),
                        shell: s.shell.clone(),
                    },
                )
            })
            .collect();
        state.blocks = loaded
            .blocks
            .iter()
            .cloned()
            .map(|mut b| {
                if b.state == BlockState::Running {
                    b.state = BlockState::Cancelled;
                }
                (b.id.clone(), b)
            })
            .collect();
        info!(
            sessions = state.sessions.len(),
            blocks = state.blocks.len(),
            skipped = loaded.skipped,
            "Loaded sessions"
        );
        drop(state);
        loaded
    }
}
