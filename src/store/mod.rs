//! SQLite-backed durable state: key/value pairs, the per-sender conversation
//! log, the processed-event set, the running-task slot, the request queue and
//! pending approvals.
//!
//! Every public operation is a single statement (or a single short
//! transaction) so callers can rely on store-level atomicity without an
//! application transaction manager.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod approvals;
pub mod conversation;
pub mod events;
pub mod records;
pub mod tasks;

pub use records::{ConversationRole, ConversationTurn, PendingApproval, QueuedRequest, RunningTask};

pub const KEY_LAST_POLL_AT: &str = "last_poll_at";
pub const KEY_WORKING_DIRECTORY: &str = "working_directory";
pub const KEY_WORKER_SESSION_ID: &str = "worker_session_id";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create state database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid conversation role `{value}` in database")]
    InvalidRole { value: String },
}

pub(crate) fn sql(source: rusqlite::Error) -> StoreError {
    StoreError::Sql { source }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    db_path: PathBuf,
}

impl StateStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS processed_events (
                    event_id TEXT PRIMARY KEY,
                    processed_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS conversation (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    sender TEXT NOT NULL,
                    role TEXT NOT NULL,
                    text TEXT NOT NULL,
                    timestamp INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS running_task (
                    slot INTEGER PRIMARY KEY CHECK (slot = 1),
                    task_id TEXT NOT NULL,
                    description TEXT NOT NULL,
                    started_at INTEGER NOT NULL,
                    worker_pid INTEGER
                );

                CREATE TABLE IF NOT EXISTS queue (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id TEXT NOT NULL UNIQUE,
                    source_event_id TEXT NOT NULL UNIQUE,
                    sender TEXT NOT NULL,
                    body TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS approvals (
                    approval_id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL,
                    command TEXT NOT NULL,
                    sender TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_conversation_sender_time
                    ON conversation(sender, timestamp DESC, seq DESC);
                CREATE INDEX IF NOT EXISTS idx_queue_order
                    ON queue(enqueued_at, seq);
                CREATE INDEX IF NOT EXISTS idx_approvals_sender
                    ON approvals(sender, expires_at);
                CREATE INDEX IF NOT EXISTS idx_processed_at
                    ON processed_events(processed_at);
                ",
            )
            .map_err(sql)
    }

    pub(crate) fn connect(&self) -> Result<Connection, StoreError> {
        let connection = Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection.busy_timeout(BUSY_TIMEOUT).map_err(sql)?;
        connection
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(sql)?;
        Ok(connection)
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.connect()?
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(sql)
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.connect()?
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
            .map_err(sql)
    }

    pub fn delete_value(&self, key: &str) -> Result<bool, StoreError> {
        self.connect()?
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map(|changed| changed > 0)
            .map_err(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_parent_and_schema_idempotently() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/state.db");
        StateStore::open(&path).expect("first open");
        let store = StateStore::open(&path).expect("second open");
        assert!(store.db_path().is_file());
    }

    #[test]
    fn kv_set_overwrites_and_delete_reports_presence() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(&dir.path().join("state.db")).expect("open");

        assert_eq!(store.get_value(KEY_WORKING_DIRECTORY).expect("get"), None);
        store.set_value(KEY_WORKING_DIRECTORY, "/a").expect("set");
        store.set_value(KEY_WORKING_DIRECTORY, "/b").expect("overwrite");
        assert_eq!(
            store.get_value(KEY_WORKING_DIRECTORY).expect("get"),
            Some("/b".to_string())
        );
        assert!(store.delete_value(KEY_WORKING_DIRECTORY).expect("delete"));
        assert!(!store.delete_value(KEY_WORKING_DIRECTORY).expect("delete again"));
    }
}
