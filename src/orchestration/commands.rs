use crate::orchestration::router::{resolve_directory, CommandKind};
use crate::provider::WorkerSession;
use crate::shared::logging::RuntimeLog;
use crate::shared::time::format_elapsed;
use crate::store::{ConversationRole, ConversationTurn, StateStore, StoreError};
use std::path::PathBuf;
use std::sync::Arc;

const HISTORY_OVERVIEW_TURNS: usize = 10;
const HISTORY_PREVIEW_CHARS: usize = 80;
const QUEUE_PREVIEW_ITEMS: usize = 10;
const HISTORY_SCAN_TURNS: usize = 1000;

pub const HELP_TEXT: &str = "Commands:
help | ? - this message
status - what is running now
queue | q - waiting requests
history - recent exchanges; history N - the Nth most recent in full
interrupt | stop | cancel - stop the running task
cd <path> - change working directory
home - go back to the default directory
reset | fresh - start a new conversation
yes / no - answer a pending approval
Anything else is sent to the assistant.";

fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut out = flat.chars().take(max).collect::<String>();
    out.push_str("...");
    out
}

/// Answers control commands. Every reply is computed from durable state, so
/// these work while a task is running.
pub struct ControlCommands {
    store: StateStore,
    session: Arc<WorkerSession>,
    home: PathBuf,
    allowed_roots: Vec<PathBuf>,
    log: RuntimeLog,
}

impl ControlCommands {
    pub fn new(
        store: StateStore,
        session: Arc<WorkerSession>,
        home: PathBuf,
        allowed_roots: Vec<PathBuf>,
        log: RuntimeLog,
    ) -> Self {
        Self {
            store,
            session,
            home,
            allowed_roots,
            log,
        }
    }

    pub fn handle(
        &self,
        sender: &str,
        command: &CommandKind,
        now_ms: i64,
    ) -> Result<String, StoreError> {
        match command {
            CommandKind::Help => Ok(HELP_TEXT.to_string()),
            CommandKind::Status => self.status(now_ms),
            CommandKind::QueueView => self.queue_view(now_ms),
            CommandKind::History(None) => self.history_overview(sender),
            CommandKind::History(Some(index)) => self.history_entry(sender, *index),
            CommandKind::Interrupt => self.interrupt(),
            CommandKind::Home => self.home(),
            CommandKind::Reset => self.reset(sender),
            CommandKind::ChangeDirectory(path) => self.change_directory(path),
            CommandKind::ApprovalResponse(_) | CommandKind::FreeForm => {
                Ok("That is not a control command. Send `help` for the list.".to_string())
            }
        }
    }

    fn status(&self, now_ms: i64) -> Result<String, StoreError> {
        let queued = self.store.queue_len()?;
        let cwd = self.session.working_directory()?;
        let mut lines = Vec::new();
        match self.store.running_task()? {
            Some(task) => {
                lines.push(format!("Busy: {}", task.description));
                lines.push(format!(
                    "Running for {}",
                    format_elapsed(now_ms - task.started_at)
                ));
            }
            None => lines.push("Idle.".to_string()),
        }
        lines.push(format!("Queued: {queued}"));
        lines.push(format!("Directory: {}", cwd.display()));
        Ok(lines.join("\n"))
    }

    fn queue_view(&self, now_ms: i64) -> Result<String, StoreError> {
        let queue = self.store.list_queue()?;
        let mut lines = Vec::new();
        if let Some(task) = self.store.running_task()? {
            lines.push(format!(
                "Running: {} ({})",
                task.description,
                format_elapsed(now_ms - task.started_at)
            ));
        }
        if queue.is_empty() {
            lines.push("Queue is empty.".to_string());
            return Ok(lines.join("\n"));
        }
        for (index, request) in queue.iter().take(QUEUE_PREVIEW_ITEMS).enumerate() {
            lines.push(format!(
                "{}. {} (waiting {})",
                index + 1,
                preview(&request.body, HISTORY_PREVIEW_CHARS),
                format_elapsed(now_ms - request.enqueued_at)
            ));
        }
        if queue.len() > QUEUE_PREVIEW_ITEMS {
            lines.push(format!("...and {} more", queue.len() - QUEUE_PREVIEW_ITEMS));
        }
        Ok(lines.join("\n"))
    }

    fn history_overview(&self, sender: &str) -> Result<String, StoreError> {
        let mut turns = self.store.recent_turns(sender, HISTORY_OVERVIEW_TURNS)?;
        if turns.is_empty() {
            return Ok("No history yet.".to_string());
        }
        turns.reverse();
        Ok(turns
            .iter()
            .map(|turn| {
                let speaker = match turn.role {
                    ConversationRole::User => "You",
                    ConversationRole::Assistant => "Assistant",
                };
                format!("{speaker}: {}", preview(&turn.text, HISTORY_PREVIEW_CHARS))
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// The `index`-th most recent request and the reply that followed it.
    fn history_entry(&self, sender: &str, index: usize) -> Result<String, StoreError> {
        let turns = self.store.recent_turns(sender, HISTORY_SCAN_TURNS)?;
        let Some((request, response)) = nth_exchange(&turns, index) else {
            return Ok(format!("No exchange #{index} in history."));
        };
        let response = response
            .map(|turn| turn.text.as_str())
            .unwrap_or("(no response recorded)");
        Ok(format!(
            "Request:\n{}\n\nResponse:\n{response}",
            request.text
        ))
    }

    fn interrupt(&self) -> Result<String, StoreError> {
        let Some(task) = self.store.running_task()? else {
            return Ok("Nothing is running.".to_string());
        };
        match self.session.interrupt() {
            Some(partial) if partial.trim().is_empty() => {
                Ok(format!("Interrupted: {}. No output yet.", task.description))
            }
            Some(partial) => Ok(format!(
                "Interrupted: {}. Partial output:\n\n{partial}",
                task.description
            )),
            None => Ok(format!(
                "{} is between steps; try interrupting again in a moment.",
                task.description
            )),
        }
    }

    fn busy_reply(&self) -> Result<Option<String>, StoreError> {
        Ok(self.store.running_task()?.map(|task| {
            format!(
                "Busy with: {}. Interrupt it first, or wait for it to finish.",
                task.description
            )
        }))
    }

    fn home(&self) -> Result<String, StoreError> {
        if let Some(reply) = self.busy_reply()? {
            return Ok(reply);
        }
        let home = self.session.default_directory().to_path_buf();
        self.session.set_working_directory(&home)?;
        Ok(format!(
            "Working directory: {}. Starting a fresh session.",
            home.display()
        ))
    }

    /// Drops the resumable session and the sender's stored history, so the
    /// next run is not seeded with earlier turns.
    fn reset(&self, sender: &str) -> Result<String, StoreError> {
        if let Some(reply) = self.busy_reply()? {
            return Ok(reply);
        }
        self.session.teardown()?;
        let cleared = self.store.clear_turns(sender)?;
        self.log
            .info("command.reset", &format!("cleared_turns={cleared}"));
        Ok("Session reset. The next request starts a fresh conversation.".to_string())
    }

    fn change_directory(&self, requested: &str) -> Result<String, StoreError> {
        if let Some(reply) = self.busy_reply()? {
            return Ok(reply);
        }
        let current = self.session.working_directory()?;
        match resolve_directory(&current, requested, &self.home, &self.allowed_roots) {
            Ok(target) => {
                self.session.set_working_directory(&target)?;
                Ok(format!(
                    "Working directory: {}. Starting a fresh session.",
                    target.display()
                ))
            }
            Err(err) => {
                self.log.info("command.cd.rejected", &err.to_string());
                Ok(format!("cd failed: {err}"))
            }
        }
    }
}

/// `turns` is newest first. Pairs the `index`-th most recent user turn with
/// the assistant turn immediately after it, if any.
fn nth_exchange(
    turns: &[ConversationTurn],
    index: usize,
) -> Option<(&ConversationTurn, Option<&ConversationTurn>)> {
    let position = turns
        .iter()
        .enumerate()
        .filter(|(_, turn)| turn.role == ConversationRole::User)
        .nth(index.checked_sub(1)?)
        .map(|(position, _)| position)?;
    let response = position
        .checked_sub(1)
        .and_then(|newer| turns.get(newer))
        .filter(|turn| turn.role == ConversationRole::Assistant);
    Some((&turns[position], response))
}
