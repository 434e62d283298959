use super::{sql, ConversationRole, ConversationTurn, StateStore, StoreError};
use rusqlite::params;

impl StateStore {
    pub fn append_turn(&self, turn: &ConversationTurn) -> Result<(), StoreError> {
        self.connect()?
            .execute(
                "INSERT INTO conversation (sender, role, text, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![turn.sender, turn.role.as_str(), turn.text, turn.timestamp],
            )
            .map(|_| ())
            .map_err(sql)
    }

    /// Newest first.
    pub fn recent_turns(
        &self,
        sender: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT sender, role, text, timestamp FROM conversation
                 WHERE sender = ?1
                 ORDER BY timestamp DESC, seq DESC
                 LIMIT ?2",
            )
            .map_err(sql)?;
        let rows = statement
            .query_map(params![sender, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(sql)?;

        let mut turns = Vec::new();
        for row in rows {
            let (sender, role, text, timestamp) = row.map_err(sql)?;
            let role =
                ConversationRole::parse(&role).ok_or(StoreError::InvalidRole { value: role })?;
            turns.push(ConversationTurn {
                sender,
                role,
                text,
                timestamp,
            });
        }
        Ok(turns)
    }

    /// Keeps the newest `keep` turns for `sender`, returning how many were dropped.
    pub fn trim_turns(&self, sender: &str, keep: usize) -> Result<usize, StoreError> {
        self.connect()?
            .execute(
                "DELETE FROM conversation
                 WHERE sender = ?1 AND seq NOT IN (
                     SELECT seq FROM conversation
                     WHERE sender = ?1
                     ORDER BY timestamp DESC, seq DESC
                     LIMIT ?2
                 )",
                params![sender, keep as i64],
            )
            .map_err(sql)
    }

    pub fn clear_turns(&self, sender: &str) -> Result<usize, StoreError> {
        self.connect()?
            .execute("DELETE FROM conversation WHERE sender = ?1", params![sender])
            .map_err(sql)
    }
}
