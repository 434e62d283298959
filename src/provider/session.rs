use crate::config::{ConfigError, Settings, WorkerConfig};
use crate::provider::activity::ActivityThrottle;
use crate::provider::invocation::{build_context_prompt, build_invocation};
use crate::provider::runner::{run_worker, RunControl};
use crate::provider::types::{WorkerError, WorkerState};
use crate::shared::logging::RuntimeLog;
use crate::store::{
    ConversationRole, ConversationTurn, StateStore, StoreError, KEY_WORKER_SESSION_ID,
    KEY_WORKING_DIRECTORY,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

const BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Owns the worker process lifecycle for the operator's working directory.
///
/// Shared between the executor thread, which calls [`WorkerSession::send`],
/// and the poll thread, which may call [`WorkerSession::interrupt`] or
/// [`WorkerSession::teardown`] while a run is in flight.
#[derive(Debug)]
pub struct WorkerSession {
    config: WorkerConfig,
    default_directory: PathBuf,
    prompt_turns: usize,
    store: StateStore,
    log: RuntimeLog,
    control: RunControl,
    state: Mutex<WorkerState>,
    last_outcome: Mutex<Option<WorkerState>>,
}

impl WorkerSession {
    pub fn new(
        config: WorkerConfig,
        default_directory: PathBuf,
        prompt_turns: usize,
        store: StateStore,
        log: RuntimeLog,
    ) -> Self {
        Self {
            config,
            default_directory,
            prompt_turns,
            store,
            log,
            control: RunControl::new(),
            state: Mutex::new(WorkerState::Idle),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn from_settings(
        settings: &Settings,
        store: StateStore,
        log: RuntimeLog,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            settings.worker.clone(),
            settings.resolve_default_directory()?,
            settings.history.prompt_turns,
            store,
            log,
        ))
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Terminal state of the most recent run.
    pub fn last_outcome(&self) -> Option<WorkerState> {
        *self.last_outcome.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn default_directory(&self) -> &Path {
        &self.default_directory
    }

    pub fn working_directory(&self) -> Result<PathBuf, StoreError> {
        Ok(self
            .store
            .get_value(KEY_WORKING_DIRECTORY)?
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_directory.clone()))
    }

    /// Switches directories. The resumable conversation belongs to the old
    /// directory, so the session is torn down first.
    pub fn set_working_directory(&self, directory: &Path) -> Result<(), StoreError> {
        self.teardown()?;
        self.store
            .set_value(KEY_WORKING_DIRECTORY, &directory.display().to_string())?;
        self.log.info(
            "worker.directory.changed",
            &format!("cwd={}", directory.display()),
        );
        Ok(())
    }

    pub fn resume_session_id(&self) -> Result<Option<String>, StoreError> {
        self.store.get_value(KEY_WORKER_SESSION_ID)
    }

    /// Sends one request to the worker, retrying transient failures.
    ///
    /// When `task_id` is given the worker pid is recorded on that running task.
    pub fn send(
        &self,
        sender: &str,
        request: &str,
        task_id: Option<&str>,
        on_activity: &mut dyn FnMut(&str),
    ) -> Result<String, WorkerError> {
        self.control.reset();
        self.set_state(WorkerState::Starting);

        let cwd = match self.working_directory() {
            Ok(cwd) => cwd,
            Err(err) => {
                self.finish(WorkerState::Failed);
                return Err(err.into());
            }
        };
        if !cwd.is_dir() {
            self.finish(WorkerState::Failed);
            return Err(WorkerError::WorkingDirectory(cwd.display().to_string()));
        }

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let mut attempt: u32 = 1;
        loop {
            let invocation = match self.prepare_invocation(sender, request, &cwd) {
                Ok(invocation) => invocation,
                Err(err) => {
                    self.finish(WorkerState::Failed);
                    return Err(err.into());
                }
            };
            self.control.clear_partial();
            self.log.info(
                "worker.started",
                &format!(
                    "attempt={attempt} cwd={} command={}",
                    cwd.display(),
                    invocation.binary
                ),
            );

            let mut throttle =
                ActivityThrottle::new(Duration::from_millis(self.config.activity_throttle_ms));
            let result = run_worker(
                &invocation,
                request,
                timeout,
                &self.control,
                &mut |pid| self.on_spawn(task_id, pid),
                &mut |activity| {
                    if throttle.should_emit(Instant::now()) {
                        on_activity(&activity);
                    }
                },
            );

            match result {
                Ok(outcome) => {
                    if let Some(session_id) = &outcome.session_id {
                        if let Err(err) = self.store.set_value(KEY_WORKER_SESSION_ID, session_id) {
                            self.log
                                .warn("worker.session.persist_failed", &err.to_string());
                        }
                    }
                    self.finish(if outcome.timed_out {
                        WorkerState::TimedOut
                    } else {
                        WorkerState::Completed
                    });
                    return Ok(outcome.reply);
                }
                Err(WorkerError::Interrupted) => {
                    self.finish(WorkerState::Interrupted);
                    return Err(WorkerError::Interrupted);
                }
                Err(err) if err.is_transient() && attempt <= self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    self.log.warn(
                        "worker.retry",
                        &format!("attempt={attempt} delay_ms={} error={err}", delay.as_millis()),
                    );
                    if !self.sleep_unless_cancelled(delay) {
                        self.finish(WorkerState::Interrupted);
                        return Err(WorkerError::Interrupted);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.log.error("worker.failed", &err.to_string());
                    self.finish(match err {
                        WorkerError::Timeout { .. } => WorkerState::TimedOut,
                        _ => WorkerState::Failed,
                    });
                    return Err(err);
                }
            }
        }
    }

    /// Cancels an in-flight run and returns the text it had produced.
    /// Returns `None` when nothing is running.
    pub fn interrupt(&self) -> Option<String> {
        if !self.state().is_active() {
            return None;
        }
        let partial = self.control.cancel();
        self.log.info(
            "worker.interrupted",
            &format!("partial_chars={}", partial.chars().count()),
        );
        Some(partial)
    }

    /// Forgets the resumable conversation and kills any live worker.
    pub fn teardown(&self) -> Result<(), StoreError> {
        if self.state().is_active() || self.control.has_child() {
            self.control.cancel();
            self.log.info("worker.teardown.killed", "live worker terminated");
        }
        if self.store.delete_value(KEY_WORKER_SESSION_ID)? {
            self.log.info("worker.teardown", "resumable session cleared");
        }
        Ok(())
    }

    fn prepare_invocation(
        &self,
        sender: &str,
        request: &str,
        cwd: &Path,
    ) -> Result<crate::provider::WorkerInvocation, StoreError> {
        let resume = self.store.get_value(KEY_WORKER_SESSION_ID)?;
        let history = if resume.is_none() {
            self.prompt_history(sender, request)?
        } else {
            Vec::new()
        };
        let context = build_context_prompt(self.config.system_prompt.as_deref(), cwd, &history);
        Ok(build_invocation(
            &self.config,
            cwd,
            resume.as_deref(),
            &context,
        ))
    }

    /// Recent turns, oldest first, excluding the request being sent now.
    fn prompt_history(
        &self,
        sender: &str,
        request: &str,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        if self.prompt_turns == 0 {
            return Ok(Vec::new());
        }
        let mut turns = self.store.recent_turns(sender, self.prompt_turns + 1)?;
        if turns
            .first()
            .is_some_and(|t| t.role == ConversationRole::User && t.text == request)
        {
            turns.remove(0);
        }
        turns.truncate(self.prompt_turns);
        turns.reverse();
        Ok(turns)
    }

    fn on_spawn(&self, task_id: Option<&str>, pid: u32) {
        self.set_state(WorkerState::Streaming);
        self.log.info("worker.spawned", &format!("pid={pid}"));
        if let Some(task_id) = task_id {
            if let Err(err) = self.store.set_running_task_pid(task_id, pid) {
                self.log.warn("worker.pid.persist_failed", &err.to_string());
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.config.retry_base_delay_ms.saturating_mul(factor))
    }

    fn sleep_unless_cancelled(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.control.is_cancelled() {
                return false;
            }
            let step = remaining.min(BACKOFF_STEP);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.control.is_cancelled()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|err| err.into_inner()) = state;
    }

    fn finish(&self, outcome: WorkerState) {
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = Some(outcome);
        self.set_state(WorkerState::Idle);
    }
}
