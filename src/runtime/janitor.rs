use crate::orchestration::ApprovalGate;
use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub expired_approvals: usize,
    pub pruned_events: usize,
}

/// Drops expired approvals and processed-event ids older than `retention_ms`.
pub fn run_janitor_once(
    store: &StateStore,
    gate: &ApprovalGate,
    retention_ms: i64,
    now_ms: i64,
) -> Result<JanitorReport, StoreError> {
    Ok(JanitorReport {
        expired_approvals: gate.sweep_expired(now_ms)?,
        pruned_events: store.prune_processed(now_ms.saturating_sub(retention_ms))?,
    })
}
