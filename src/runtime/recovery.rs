use super::ownership_lock::{is_process_alive, terminate_process};
use crate::shared::logging::RuntimeLog;
use crate::shared::time::{format_elapsed, now_millis};
use crate::store::{RunningTask, StateStore, StoreError};
use crate::transport::{send_chunked, Transport};

/// Clears a running-task slot left behind by a previous daemon.
///
/// At startup nothing can legitimately be running, so any occupied slot is
/// stale. Its worker, if still alive, is terminated and the operator is told
/// the task did not finish.
pub fn reconcile_stale_task(
    store: &StateStore,
    transport: &dyn Transport,
    operator: Option<&str>,
    log: &RuntimeLog,
) -> Result<Option<RunningTask>, StoreError> {
    let Some(task) = store.running_task()? else {
        return Ok(None);
    };

    if let Some(pid) = task.worker_pid {
        if is_process_alive(pid) {
            let gone = terminate_process(pid);
            log.warn(
                "recovery.worker.terminated",
                &format!("task_id={} pid={pid} exited={gone}", task.id),
            );
        }
    }
    store.clear_running_task()?;
    log.warn(
        "recovery.task.cleared",
        &format!("task_id={} description={}", task.id, task.description),
    );

    if let Some(operator) = operator {
        let notice = format!(
            "Restarted. The previous task did not finish: {} (started {} ago).",
            task.description,
            format_elapsed(now_millis() - task.started_at)
        );
        if let Err(err) = send_chunked(transport, operator, &notice) {
            log.warn("recovery.notice.send_failed", &err.to_string());
        }
    }
    Ok(Some(task))
}
