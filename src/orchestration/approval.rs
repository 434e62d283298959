use crate::orchestration::router::approval_response;
use crate::shared::ids::compact_id;
use crate::store::{PendingApproval, StateStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The reply was recognized as yes or no.
    pub matched: bool,
    pub approved: bool,
    pub approval: PendingApproval,
}

/// Per-sender pending approvals with a time-to-live.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    store: StateStore,
    ttl_ms: i64,
    gated_phrases: Vec<String>,
}

impl ApprovalGate {
    pub fn new(store: StateStore, ttl_ms: i64, gated_phrases: &[String]) -> Self {
        Self {
            store,
            ttl_ms,
            gated_phrases: gated_phrases
                .iter()
                .map(|phrase| phrase.trim().to_lowercase())
                .filter(|phrase| !phrase.is_empty())
                .collect(),
        }
    }

    /// The gated phrase contained in `body`, if any.
    pub fn gated_phrase(&self, body: &str) -> Option<&str> {
        let lower = body.to_lowercase();
        self.gated_phrases
            .iter()
            .find(|phrase| lower.contains(phrase.as_str()))
            .map(String::as_str)
    }

    /// Opens an approval for `sender`, replacing any earlier one.
    pub fn open(
        &self,
        sender: &str,
        task_id: &str,
        command: &str,
        now_ms: i64,
    ) -> Result<PendingApproval, StoreError> {
        let approval = PendingApproval {
            id: compact_id("apr", now_ms),
            task_id: task_id.to_string(),
            command: command.to_string(),
            sender: sender.to_string(),
            created_at: now_ms,
            expires_at: now_ms.saturating_add(self.ttl_ms),
        };
        self.store.insert_approval(&approval)?;
        Ok(approval)
    }

    /// Matches `text` against the sender's live approval.
    ///
    /// Returns `None` when nothing is pending. A yes/no reply consumes the
    /// approval; any other text leaves it open and reports `matched = false`.
    pub fn resolve(
        &self,
        sender: &str,
        text: &str,
        now_ms: i64,
    ) -> Result<Option<Resolution>, StoreError> {
        let Some(approval) = self.store.active_approval(sender, now_ms)? else {
            return Ok(None);
        };
        let Some(approved) = approval_response(text) else {
            return Ok(Some(Resolution {
                matched: false,
                approved: false,
                approval,
            }));
        };
        if !self.store.delete_approval(&approval.id)? {
            return Ok(None);
        }
        Ok(Some(Resolution {
            matched: true,
            approved,
            approval,
        }))
    }

    pub fn sweep_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        self.store.delete_expired_approvals(now_ms)
    }
}
