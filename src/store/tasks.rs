use super::{sql, QueuedRequest, RunningTask, StateStore, StoreError};
use rusqlite::{params, OptionalExtension, Row};

fn running_task_from_row(row: &Row<'_>) -> rusqlite::Result<RunningTask> {
    Ok(RunningTask {
        id: row.get(0)?,
        description: row.get(1)?,
        started_at: row.get(2)?,
        worker_pid: row.get::<_, Option<i64>>(3)?.map(|pid| pid as u32),
    })
}

fn queued_request_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedRequest> {
    Ok(QueuedRequest {
        id: row.get(0)?,
        source_event_id: row.get(1)?,
        sender: row.get(2)?,
        body: row.get(3)?,
        enqueued_at: row.get(4)?,
    })
}

impl StateStore {
    pub fn running_task(&self) -> Result<Option<RunningTask>, StoreError> {
        self.connect()?
            .query_row(
                "SELECT task_id, description, started_at, worker_pid FROM running_task WHERE slot = 1",
                [],
                running_task_from_row,
            )
            .optional()
            .map_err(sql)
    }

    /// Occupies the slot only when it is empty. Returns `false` when another
    /// task already holds it.
    pub fn claim_running_task(&self, task: &RunningTask) -> Result<bool, StoreError> {
        self.connect()?
            .execute(
                "INSERT INTO running_task (slot, task_id, description, started_at, worker_pid)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(slot) DO NOTHING",
                params![
                    task.id,
                    task.description,
                    task.started_at,
                    task.worker_pid.map(i64::from)
                ],
            )
            .map(|inserted| inserted > 0)
            .map_err(sql)
    }

    pub fn replace_running_task(&self, task: &RunningTask) -> Result<(), StoreError> {
        self.connect()?
            .execute(
                "INSERT INTO running_task (slot, task_id, description, started_at, worker_pid)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(slot) DO UPDATE SET
                     task_id = excluded.task_id,
                     description = excluded.description,
                     started_at = excluded.started_at,
                     worker_pid = excluded.worker_pid",
                params![
                    task.id,
                    task.description,
                    task.started_at,
                    task.worker_pid.map(i64::from)
                ],
            )
            .map(|_| ())
            .map_err(sql)
    }

    pub fn clear_running_task(&self) -> Result<bool, StoreError> {
        self.connect()?
            .execute("DELETE FROM running_task WHERE slot = 1", [])
            .map(|deleted| deleted > 0)
            .map_err(sql)
    }

    /// Records the worker pid for the task currently in the slot. A stale
    /// `task_id` leaves the slot untouched.
    pub fn set_running_task_pid(&self, task_id: &str, pid: u32) -> Result<bool, StoreError> {
        self.connect()?
            .execute(
                "UPDATE running_task SET worker_pid = ?2 WHERE slot = 1 AND task_id = ?1",
                params![task_id, i64::from(pid)],
            )
            .map(|updated| updated > 0)
            .map_err(sql)
    }

    /// Appends a request. Returns `false` when its id or source event is
    /// already queued.
    pub fn enqueue(&self, request: &QueuedRequest) -> Result<bool, StoreError> {
        self.connect()?
            .execute(
                "INSERT INTO queue (request_id, source_event_id, sender, body, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT DO NOTHING",
                params![
                    request.id,
                    request.source_event_id,
                    request.sender,
                    request.body,
                    request.enqueued_at
                ],
            )
            .map(|inserted| inserted > 0)
            .map_err(sql)
    }

    pub fn pop_oldest(&self) -> Result<Option<QueuedRequest>, StoreError> {
        self.connect()?
            .query_row(
                "DELETE FROM queue
                 WHERE seq = (SELECT seq FROM queue ORDER BY enqueued_at ASC, seq ASC LIMIT 1)
                 RETURNING request_id, source_event_id, sender, body, enqueued_at",
                [],
                queued_request_from_row,
            )
            .optional()
            .map_err(sql)
    }

    pub fn queue_len(&self) -> Result<usize, StoreError> {
        self.connect()?
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get::<_, i64>(0))
            .map(|count| count as usize)
            .map_err(sql)
    }

    /// Oldest first.
    pub fn list_queue(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT request_id, source_event_id, sender, body, enqueued_at
                 FROM queue ORDER BY enqueued_at ASC, seq ASC",
            )
            .map_err(sql)?;
        let rows = statement
            .query_map([], queued_request_from_row)
            .map_err(sql)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql)
    }

    /// 1-based position of the request queued for `source_event_id`.
    pub fn queue_position(&self, source_event_id: &str) -> Result<Option<usize>, StoreError> {
        self.connect()?
            .query_row(
                "SELECT COUNT(*) FROM queue AS other, queue AS target
                 WHERE target.source_event_id = ?1
                   AND (other.enqueued_at < target.enqueued_at
                        OR (other.enqueued_at = target.enqueued_at AND other.seq <= target.seq))",
                params![source_event_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| (count > 0).then_some(count as usize))
            .map_err(sql)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{QueuedRequest, RunningTask, StateStore};
    use tempfile::tempdir;

    fn task(id: &str) -> RunningTask {
        RunningTask {
            id: id.to_string(),
            description: format!("work for {id}"),
            started_at: 100,
            worker_pid: None,
        }
    }

    fn request(id: &str, event: &str, at: i64) -> QueuedRequest {
        QueuedRequest {
            id: id.to_string(),
            source_event_id: event.to_string(),
            sender: "+15551234567".to_string(),
            body: format!("body {id}"),
            enqueued_at: at,
        }
    }

    #[test]
    fn claim_fails_while_slot_is_occupied() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(&dir.path().join("state.db")).expect("open");

        assert!(store.claim_running_task(&task("a")).expect("claim a"));
        assert!(!store.claim_running_task(&task("b")).expect("claim b"));
        assert_eq!(store.running_task().expect("read").map(|t| t.id), Some("a".into()));

        assert!(store.set_running_task_pid("a", 4242).expect("pid"));
        assert!(!store.set_running_task_pid("stale", 1).expect("stale pid"));
        assert_eq!(
            store.running_task().expect("read").and_then(|t| t.worker_pid),
            Some(4242)
        );

        store.replace_running_task(&task("c")).expect("replace");
        let current = store.running_task().expect("read").expect("present");
        assert_eq!(current.id, "c");
        assert_eq!(current.worker_pid, None);

        assert!(store.clear_running_task().expect("clear"));
        assert!(!store.clear_running_task().expect("clear again"));
        assert!(store.running_task().expect("read").is_none());
    }

    #[test]
    fn queue_is_fifo_and_idempotent_per_source_event() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(&dir.path().join("state.db")).expect("open");

        assert!(store.enqueue(&request("r1", "SM1", 10)).expect("r1"));
        assert!(store.enqueue(&request("r2", "SM2", 10)).expect("r2"));
        assert!(store.enqueue(&request("r3", "SM3", 5)).expect("r3"));
        assert!(!store.enqueue(&request("r4", "SM1", 20)).expect("dup event"));

        assert_eq!(store.queue_len().expect("len"), 3);
        assert_eq!(store.queue_position("SM3").expect("pos"), Some(1));
        assert_eq!(store.queue_position("SM2").expect("pos"), Some(3));
        assert_eq!(store.queue_position("missing").expect("pos"), None);

        let order = store
            .list_queue()
            .expect("list")
            .into_iter()
            .map(|r| r.id)
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["r3", "r1", "r2"]);

        assert_eq!(store.pop_oldest().expect("pop").map(|r| r.id), Some("r3".into()));
        assert_eq!(store.pop_oldest().expect("pop").map(|r| r.id), Some("r1".into()));
        assert_eq!(store.pop_oldest().expect("pop").map(|r| r.id), Some("r2".into()));
        assert!(store.pop_oldest().expect("empty").is_none());
    }
}
