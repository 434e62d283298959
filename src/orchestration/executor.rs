use crate::provider::{WorkerError, WorkerSession};
use crate::shared::ids::compact_id;
use crate::shared::logging::RuntimeLog;
use crate::shared::time::now_millis;
use crate::store::{
    ConversationRole, ConversationTurn, QueuedRequest, RunningTask, StateStore, StoreError,
};
use crate::transport::{send_chunked, Transport};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DESCRIPTION_CHARS: usize = 60;
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started { task_id: String },
    Queued { position: usize },
    AlreadyQueued { position: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorJob {
    pub task_id: String,
    pub source_event_id: String,
    pub sender: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("task executor is not accepting work")]
    Stopped,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Short single-line summary of a request, used as the task description.
pub fn describe_request(body: &str) -> String {
    let line = body.lines().next().unwrap_or_default().trim();
    let mut description = line.chars().take(DESCRIPTION_CHARS).collect::<String>();
    if line.chars().count() > DESCRIPTION_CHARS || body.trim().lines().count() > 1 {
        description.push_str("...");
    }
    description
}

/// Runs at most one request at a time on a dedicated thread.
///
/// The durable running-task slot is the only busy signal. Claiming the slot,
/// enqueueing, and handing the slot to the next queued request all happen
/// under `dispatch`, so a submit can never slip between a completion and the
/// drain that follows it.
pub struct TaskExecutor {
    store: StateStore,
    transport: Arc<dyn Transport>,
    session: Arc<WorkerSession>,
    log: RuntimeLog,
    history_window: usize,
    dispatch: Mutex<()>,
    jobs: Mutex<Option<Sender<ExecutorJob>>>,
}

impl TaskExecutor {
    pub fn start(
        store: StateStore,
        transport: Arc<dyn Transport>,
        session: Arc<WorkerSession>,
        log: RuntimeLog,
        history_window: usize,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (jobs_tx, jobs_rx) = mpsc::channel::<ExecutorJob>();
        let executor = Arc::new(Self {
            store,
            transport,
            session,
            log,
            history_window,
            dispatch: Mutex::new(()),
            jobs: Mutex::new(Some(jobs_tx)),
        });
        let worker = Arc::clone(&executor);
        let handle = thread::spawn(move || worker.run_loop(jobs_rx));
        (executor, handle)
    }

    pub fn session(&self) -> &Arc<WorkerSession> {
        &self.session
    }

    /// Starts the request now when the slot is free, otherwise queues it.
    pub fn submit(
        &self,
        source_event_id: &str,
        sender: &str,
        body: &str,
    ) -> Result<SubmitOutcome, ExecutorError> {
        let _dispatch = lock(&self.dispatch);
        let jobs = lock(&self.jobs);
        let jobs_tx = jobs.as_ref().ok_or(ExecutorError::Stopped)?;
        let now = now_millis();

        let task = RunningTask {
            id: compact_id("task", now),
            description: describe_request(body),
            started_at: now,
            worker_pid: None,
        };
        if self.store.claim_running_task(&task)? {
            let job = ExecutorJob {
                task_id: task.id.clone(),
                source_event_id: source_event_id.to_string(),
                sender: sender.to_string(),
                body: body.to_string(),
            };
            if jobs_tx.send(job).is_err() {
                self.store.clear_running_task()?;
                return Err(ExecutorError::Stopped);
            }
            self.log.info(
                "task.claimed",
                &format!("task_id={} event_id={source_event_id}", task.id),
            );
            return Ok(SubmitOutcome::Started { task_id: task.id });
        }

        let request = QueuedRequest {
            id: compact_id("req", now),
            source_event_id: source_event_id.to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
            enqueued_at: now,
        };
        if self.store.enqueue(&request)? {
            let position = self
                .store
                .queue_position(source_event_id)?
                .unwrap_or(self.store.queue_len()?);
            self.log.info(
                "task.queued",
                &format!("request_id={} position={position}", request.id),
            );
            return Ok(SubmitOutcome::Queued { position });
        }
        Ok(SubmitOutcome::AlreadyQueued {
            position: self.store.queue_position(source_event_id)?,
        })
    }

    /// Starts the oldest queued request when nothing is running. Used at
    /// startup after a stale slot has been reconciled.
    pub fn drain_pending(&self) -> Result<bool, ExecutorError> {
        let _dispatch = lock(&self.dispatch);
        let jobs = lock(&self.jobs);
        let jobs_tx = jobs.as_ref().ok_or(ExecutorError::Stopped)?;
        if self.store.running_task()?.is_some() {
            return Ok(false);
        }
        self.start_next_locked(jobs_tx)
    }

    /// Stops accepting work. A task already running is allowed to finish, but
    /// queued requests stay queued for the next start.
    pub fn shutdown(&self) {
        let _dispatch = lock(&self.dispatch);
        lock(&self.jobs).take();
    }

    /// Waits until the running-task slot is empty. Returns `false` on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.store.running_task() {
                Ok(None) => return true,
                Ok(Some(_)) => {}
                Err(err) => self.log.warn("task.idle_check.failed", &err.to_string()),
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
    }

    fn run_loop(&self, jobs: Receiver<ExecutorJob>) {
        self.log.info("executor.started", "waiting for tasks");
        for job in jobs {
            self.process(job);
        }
        self.log.info("executor.stopped", "job channel closed");
    }

    fn process(&self, job: ExecutorJob) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute(&job))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.contain_failure(&job, &err.to_string()),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.contain_failure(&job, &format!("internal error: {message}"));
            }
        }
        self.advance();
    }

    fn execute(&self, job: &ExecutorJob) -> Result<(), ExecutorError> {
        self.store.append_turn(&ConversationTurn {
            sender: job.sender.clone(),
            role: ConversationRole::User,
            text: job.body.clone(),
            timestamp: now_millis(),
        })?;
        self.log.info(
            "task.started",
            &format!("task_id={} sender={}", job.task_id, job.sender),
        );

        let mut on_activity = |activity: &str| {
            if let Err(err) = self
                .transport
                .send(&job.sender, &format!("[working] {activity}"), None)
            {
                self.log.warn("task.activity.send_failed", &err.to_string());
            }
        };

        match self
            .session
            .send(&job.sender, &job.body, Some(&job.task_id), &mut on_activity)
        {
            Ok(reply) => {
                self.store.append_turn(&ConversationTurn {
                    sender: job.sender.clone(),
                    role: ConversationRole::Assistant,
                    text: reply.clone(),
                    timestamp: now_millis(),
                })?;
                self.store.trim_turns(&job.sender, self.history_window)?;
                self.reply(&job.sender, &reply);
                self.log.info(
                    "task.completed",
                    &format!("task_id={} reply_chars={}", job.task_id, reply.chars().count()),
                );
                Ok(())
            }
            Err(WorkerError::Interrupted) => {
                self.log
                    .info("task.interrupted", &format!("task_id={}", job.task_id));
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn contain_failure(&self, job: &ExecutorJob, message: &str) {
        self.log.error(
            "task.failed",
            &format!("task_id={} error={message}", job.task_id),
        );
        self.reply(&job.sender, &format!("Task failed: {message}"));
        if let Err(err) = self.session.teardown() {
            self.log.warn("task.teardown.failed", &err.to_string());
        }
    }

    fn reply(&self, to: &str, body: &str) {
        if let Err(err) = send_chunked(self.transport.as_ref(), to, body) {
            self.log.warn("task.reply.send_failed", &err.to_string());
        }
    }

    /// Hands the slot to the oldest queued request, or clears it.
    fn advance(&self) {
        let _dispatch = lock(&self.dispatch);
        let jobs = lock(&self.jobs);
        let started = match jobs.as_ref() {
            Some(jobs_tx) => self.start_next_locked(jobs_tx),
            None => Ok(false),
        };
        match started {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = self.store.clear_running_task() {
                    self.log.error("task.slot.clear_failed", &err.to_string());
                }
            }
            Err(err) => {
                self.log.error("task.drain.failed", &err.to_string());
                if let Err(err) = self.store.clear_running_task() {
                    self.log.error("task.slot.clear_failed", &err.to_string());
                }
            }
        }
    }

    fn start_next_locked(&self, jobs_tx: &Sender<ExecutorJob>) -> Result<bool, ExecutorError> {
        let Some(next) = self.store.pop_oldest()? else {
            return Ok(false);
        };
        let now = now_millis();
        let task = RunningTask {
            id: compact_id("task", now),
            description: describe_request(&next.body),
            started_at: now,
            worker_pid: None,
        };
        self.store.replace_running_task(&task)?;
        self.log.info(
            "task.dequeued",
            &format!("task_id={} request_id={}", task.id, next.id),
        );
        self.reply(
            &next.sender,
            &format!("Now processing: {}", task.description),
        );

        let job = ExecutorJob {
            task_id: task.id,
            source_event_id: next.source_event_id,
            sender: next.sender,
            body: next.body,
        };
        jobs_tx.send(job).map_err(|_| ExecutorError::Stopped)?;
        Ok(true)
    }
}
