use super::{sql, StateStore, StoreError};
use rusqlite::params;

impl StateStore {
    /// Records an inbound event id. Returns `false` when it was already known,
    /// which is the at-most-once dedup check and mark in one statement.
    pub fn mark_processed(&self, event_id: &str, now_ms: i64) -> Result<bool, StoreError> {
        self.connect()?
            .execute(
                "INSERT INTO processed_events (event_id, processed_at) VALUES (?1, ?2)
                 ON CONFLICT(event_id) DO NOTHING",
                params![event_id, now_ms],
            )
            .map(|inserted| inserted > 0)
            .map_err(sql)
    }

    pub fn is_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        self.connect()?
            .query_row(
                "SELECT COUNT(*) FROM processed_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count > 0)
            .map_err(sql)
    }

    pub fn prune_processed(&self, older_than_ms: i64) -> Result<usize, StoreError> {
        self.connect()?
            .execute(
                "DELETE FROM processed_events WHERE processed_at < ?1",
                params![older_than_ms],
            )
            .map_err(sql)
    }
}
