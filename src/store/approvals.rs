use super::{sql, PendingApproval, StateStore, StoreError};
use rusqlite::{params, OptionalExtension, Row};

const APPROVAL_COLUMNS: &str = "approval_id, task_id, command, sender, created_at, expires_at";

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<PendingApproval> {
    Ok(PendingApproval {
        id: row.get(0)?,
        task_id: row.get(1)?,
        command: row.get(2)?,
        sender: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

impl StateStore {
    /// Stores `approval`, replacing whatever the sender had pending.
    pub fn insert_approval(&self, approval: &PendingApproval) -> Result<(), StoreError> {
        let mut connection = self.connect()?;
        let tx = connection.transaction().map_err(sql)?;
        tx.execute(
            "DELETE FROM approvals WHERE sender = ?1",
            params![approval.sender],
        )
        .map_err(sql)?;
        tx.execute(
            "INSERT INTO approvals (approval_id, task_id, command, sender, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                approval.id,
                approval.task_id,
                approval.command,
                approval.sender,
                approval.created_at,
                approval.expires_at
            ],
        )
        .map_err(sql)?;
        tx.commit().map_err(sql)
    }

    /// The sender's newest approval that has not yet expired at `now_ms`.
    pub fn active_approval(
        &self,
        sender: &str,
        now_ms: i64,
    ) -> Result<Option<PendingApproval>, StoreError> {
        self.connect()?
            .query_row(
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approvals
                     WHERE sender = ?1 AND expires_at > ?2
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![sender, now_ms],
                approval_from_row,
            )
            .optional()
            .map_err(sql)
    }

    /// Removes the approval. Returns `false` when it was already gone, so two
    /// resolvers racing on the same approval see exactly one winner.
    pub fn delete_approval(&self, approval_id: &str) -> Result<bool, StoreError> {
        self.connect()?
            .execute(
                "DELETE FROM approvals WHERE approval_id = ?1",
                params![approval_id],
            )
            .map(|deleted| deleted > 0)
            .map_err(sql)
    }

    pub fn delete_expired_approvals(&self, now_ms: i64) -> Result<usize, StoreError> {
        self.connect()?
            .execute(
                "DELETE FROM approvals WHERE expires_at <= ?1",
                params![now_ms],
            )
            .map_err(sql)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{PendingApproval, StateStore};
    use tempfile::tempdir;

    fn approval(id: &str, sender: &str, created_at: i64, expires_at: i64) -> PendingApproval {
        PendingApproval {
            id: id.to_string(),
            task_id: format!("task-{id}"),
            command: "rm -rf build".to_string(),
            sender: sender.to_string(),
            created_at,
            expires_at,
        }
    }

    #[test]
    fn active_approval_ignores_expired_entries() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(&dir.path().join("state.db")).expect("open");
        store
            .insert_approval(&approval("a1", "+1555", 0, 100))
            .expect("insert");

        assert!(store.active_approval("+1555", 50).expect("active").is_some());
        assert!(store.active_approval("+1555", 100).expect("expired").is_none());
        assert!(store.active_approval("+1666", 50).expect("other").is_none());
    }

    #[test]
    fn insert_replaces_previous_approval_for_sender() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(&dir.path().join("state.db")).expect("open");
        store
            .insert_approval(&approval("a1", "+1555", 0, 100))
            .expect("first");
        store
            .insert_approval(&approval("a2", "+1555", 10, 200))
            .expect("second");

        assert!(!store.delete_approval("a1").expect("old one replaced"));
        assert_eq!(
            store.active_approval("+1555", 20).expect("active").map(|a| a.id),
            Some("a2".to_string())
        );
    }

    #[test]
    fn delete_has_single_winner_and_sweep_counts_expired() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(&dir.path().join("state.db")).expect("open");
        store
            .insert_approval(&approval("a1", "+1555", 0, 100))
            .expect("a1");
        store
            .insert_approval(&approval("b1", "+1666", 0, 500))
            .expect("b1");

        assert!(store.delete_approval("a1").expect("first delete"));
        assert!(!store.delete_approval("a1").expect("second delete"));

        assert_eq!(store.delete_expired_approvals(600).expect("sweep"), 1);
        assert!(!store.delete_approval("b1").expect("swept"));
    }
}
