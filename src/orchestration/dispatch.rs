use crate::orchestration::approval::ApprovalGate;
use crate::orchestration::commands::ControlCommands;
use crate::orchestration::executor::{ExecutorError, SubmitOutcome, TaskExecutor};
use crate::orchestration::router::{classify, is_whitelisted, CommandKind};
use crate::shared::logging::RuntimeLog;
use crate::shared::time::{format_elapsed, now_millis};
use crate::store::{PendingApproval, StateStore, StoreError};
use crate::transport::{send_chunked, InboundEvent, Transport};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Already seen; nothing was done.
    Duplicate,
    /// Unknown sender or empty body; dropped without a reply.
    Ignored,
    Control(CommandKind),
    ApprovalResolved { approved: bool },
    AwaitingApproval,
    Submitted(SubmitOutcome),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Routes one inbound event: control commands are answered inline, approval
/// replies resolve the pending approval, and everything else goes to the
/// executor without waiting for it to run.
pub struct InboundDispatcher {
    store: StateStore,
    transport: Arc<dyn Transport>,
    executor: Arc<TaskExecutor>,
    gate: ApprovalGate,
    controls: ControlCommands,
    whitelist: Vec<String>,
    log: RuntimeLog,
}

impl InboundDispatcher {
    pub fn new(
        store: StateStore,
        transport: Arc<dyn Transport>,
        executor: Arc<TaskExecutor>,
        gate: ApprovalGate,
        controls: ControlCommands,
        whitelist: Vec<String>,
        log: RuntimeLog,
    ) -> Self {
        Self {
            store,
            transport,
            executor,
            gate,
            controls,
            whitelist,
            log,
        }
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn handle_event(&self, event: &InboundEvent) -> Result<DispatchOutcome, DispatchError> {
        let now = now_millis();
        if !self.store.mark_processed(&event.id, now)? {
            return Ok(DispatchOutcome::Duplicate);
        }
        if !is_whitelisted(&event.sender, &self.whitelist) {
            self.log.info(
                "inbound.ignored",
                &format!("event_id={} reason=sender_not_whitelisted", event.id),
            );
            return Ok(DispatchOutcome::Ignored);
        }
        let body = event.body.trim();
        if body.is_empty() {
            return Ok(DispatchOutcome::Ignored);
        }

        let command = classify(body);
        self.log.info(
            "inbound.received",
            &format!("event_id={} kind={command:?}", event.id),
        );
        if command.is_control() {
            let reply = self.controls.handle(&event.sender, &command, now)?;
            self.reply(&event.sender, &reply);
            return Ok(DispatchOutcome::Control(command));
        }

        if let Some(resolution) = self.gate.resolve(&event.sender, body, now)? {
            if resolution.matched {
                return self.finish_approval(
                    &event.sender,
                    resolution.approved,
                    resolution.approval,
                );
            }
        }

        if let Some(phrase) = self.gate.gated_phrase(body) {
            let approval = self.gate.open(&event.sender, &event.id, body, now)?;
            self.log.info(
                "approval.opened",
                &format!("approval_id={} phrase={phrase}", approval.id),
            );
            self.reply(
                &event.sender,
                &format!(
                    "This request contains \"{phrase}\" and needs approval. Reply yes to run it or no to discard it (expires in {}).",
                    format_elapsed(approval.expires_at - now)
                ),
            );
            return Ok(DispatchOutcome::AwaitingApproval);
        }

        let outcome = self.executor.submit(&event.id, &event.sender, body)?;
        self.acknowledge(&event.sender, &outcome);
        Ok(DispatchOutcome::Submitted(outcome))
    }

    fn finish_approval(
        &self,
        sender: &str,
        approved: bool,
        approval: PendingApproval,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.log.info(
            "approval.resolved",
            &format!("approval_id={} approved={approved}", approval.id),
        );
        if !approved {
            self.reply(sender, "Discarded. The request was not run.");
            return Ok(DispatchOutcome::ApprovalResolved { approved });
        }

        let outcome = self
            .executor
            .submit(&approval.task_id, sender, &approval.command)?;
        match &outcome {
            SubmitOutcome::Started { .. } => self.reply(sender, "Approved. Running it now."),
            _ => self.acknowledge(sender, &outcome),
        }
        Ok(DispatchOutcome::ApprovalResolved { approved })
    }

    fn acknowledge(&self, sender: &str, outcome: &SubmitOutcome) {
        match outcome {
            SubmitOutcome::Started { .. } => {}
            SubmitOutcome::Queued { position } => self.reply(
                sender,
                &format!(
                    "Queued at position {position}. It will start when the current task finishes."
                ),
            ),
            SubmitOutcome::AlreadyQueued { position } => {
                let position = position
                    .map(|p| format!(" at position {p}"))
                    .unwrap_or_default();
                self.reply(sender, &format!("Already queued{position}."));
            }
        }
    }

    fn reply(&self, to: &str, body: &str) {
        if let Err(err) = send_chunked(self.transport.as_ref(), to, body) {
            self.log.warn("inbound.reply.send_failed", &err.to_string());
        }
    }
}
