use crate::app::command_support::{ensure_runtime_root, load_settings};
use crate::runtime::{
    cleanup_stale_daemon, clear_start_lock, load_daemon_state, ownership_state,
    reserve_start_lock, run_daemon, spawn_daemon_process, stop_running_daemon, write_lock_pid,
    DaemonState, OwnershipState, RuntimeError, StatePaths,
};
use crate::shared::logging::{tail_lines, RuntimeLog};
use crate::shared::time::{format_elapsed, now_millis};
use crate::store::{StateStore, KEY_WORKING_DIRECTORY};
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_TAIL_LINES: usize = 50;
const STOP_MARGIN: Duration = Duration::from_secs(5);

pub fn cmd_run(config: Option<&Path>) -> Result<String, String> {
    let settings = load_settings(config)?;
    run_daemon(settings).map_err(|e| e.to_string())?;
    Ok("daemon exited".to_string())
}

pub fn cmd_start(config: Option<&Path>) -> Result<String, String> {
    let settings = load_settings(config)?;
    let paths = ensure_runtime_root(&settings)?;
    match ownership_state(&paths).map_err(|e| e.to_string())? {
        OwnershipState::Running { pid } => {
            return Err(format!("daemon already running (pid={pid})"))
        }
        OwnershipState::Stale => cleanup_stale_daemon(&paths).map_err(|e| e.to_string())?,
        OwnershipState::NotRunning => {}
    }

    let config = config.map(absolute_config_path).transpose()?;
    reserve_start_lock(&paths).map_err(|e| e.to_string())?;
    let pid = match spawn_daemon_process(config.as_deref()).and_then(|pid| {
        write_lock_pid(&paths, pid)?;
        Ok(pid)
    }) {
        Ok(pid) => pid,
        Err(err) => {
            clear_start_lock(&paths);
            return Err(err.to_string());
        }
    };

    RuntimeLog::new(paths.runtime_log_path())
        .info("daemon.start.requested", &format!("pid={pid}"));
    Ok(format!(
        "started\nstate_root={}\npid={pid}",
        paths.root.display()
    ))
}

fn absolute_config_path(path: &Path) -> Result<PathBuf, String> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|e| format!("failed to resolve config path {}: {e}", path.display()))
}

pub fn cmd_stop(config: Option<&Path>) -> Result<String, String> {
    let settings = load_settings(config)?;
    let paths = ensure_runtime_root(&settings)?;
    match stop_running_daemon(&paths, settings.shutdown_timeout() + STOP_MARGIN) {
        Ok(result) => Ok(format!("stopped\npid={}\nforced={}", result.pid, result.forced)),
        Err(RuntimeError::NotRunning) => Ok("stopped\nrunning=false".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

pub fn cmd_restart(config: Option<&Path>) -> Result<String, String> {
    let stop = cmd_stop(config)?;
    let start = cmd_start(config)?;
    Ok(format!("restart complete\n{stop}\n{start}"))
}

pub fn cmd_status(config: Option<&Path>) -> Result<String, String> {
    let settings = load_settings(config)?;
    let paths = ensure_runtime_root(&settings)?;
    let ownership = match ownership_state(&paths).map_err(|e| e.to_string())? {
        OwnershipState::Running { .. } => "running",
        OwnershipState::Stale => {
            cleanup_stale_daemon(&paths).map_err(|e| e.to_string())?;
            "stale"
        }
        OwnershipState::NotRunning => "not_running",
    };
    let state = load_daemon_state(&paths).map_err(|e| e.to_string())?;

    let mut lines = vec![format!("ownership={ownership}")];
    lines.extend(daemon_status_lines(&state));
    lines.extend(work_status_lines(&paths)?);
    Ok(lines.join("\n"))
}

fn or_none<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn daemon_status_lines(state: &DaemonState) -> Vec<String> {
    let mut lines = vec![
        format!("running={}", state.running),
        format!("pid={}", or_none(state.pid)),
        format!("started_at={}", or_none(state.started_at)),
        format!("stopped_at={}", or_none(state.stopped_at)),
        format!("last_error={}", or_none(state.last_error.as_deref())),
    ];
    for (id, health) in &state.loops {
        lines.push(format!("loop:{id}.state={:?}", health.state).to_lowercase());
        lines.push(format!(
            "loop:{id}.last_heartbeat={}",
            or_none(health.last_heartbeat)
        ));
        lines.push(format!(
            "loop:{id}.last_error={}",
            or_none(health.last_error.as_deref())
        ));
    }
    lines
}

fn work_status_lines(paths: &StatePaths) -> Result<Vec<String>, String> {
    let db_path = paths.state_db_path();
    if !db_path.exists() {
        return Ok(vec!["task=none".to_string(), "queue_depth=0".to_string()]);
    }
    let store = StateStore::open(&db_path).map_err(|e| e.to_string())?;
    let mut lines = Vec::new();
    match store.running_task().map_err(|e| e.to_string())? {
        Some(task) => {
            lines.push(format!("task={}", task.description));
            lines.push(format!(
                "task.elapsed={}",
                format_elapsed(now_millis() - task.started_at)
            ));
            lines.push(format!("task.worker_pid={}", or_none(task.worker_pid)));
        }
        None => lines.push("task=none".to_string()),
    }
    lines.push(format!(
        "queue_depth={}",
        store.queue_len().map_err(|e| e.to_string())?
    ));
    lines.push(format!(
        "working_directory={}",
        or_none(store.get_value(KEY_WORKING_DIRECTORY).map_err(|e| e.to_string())?)
    ));
    Ok(lines)
}

pub fn cmd_logs(config: Option<&Path>) -> Result<String, String> {
    let settings = load_settings(config)?;
    let paths = ensure_runtime_root(&settings)?;
    let lines = tail_lines(&paths.runtime_log_path(), LOG_TAIL_LINES);
    if lines.is_empty() {
        return Ok("no logs".to_string());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LoopHealth, LoopState};
    use std::collections::BTreeMap;

    #[test]
    fn daemon_status_lines_render_loop_health() {
        let state = DaemonState {
            running: true,
            pid: Some(42),
            started_at: Some(1),
            stopped_at: None,
            loops: BTreeMap::from([(
                "poll".to_string(),
                LoopHealth {
                    state: LoopState::Error,
                    last_heartbeat: Some(7),
                    last_error: Some("poll failed: timeout".to_string()),
                },
            )]),
            last_error: None,
        };

        let lines = daemon_status_lines(&state);
        assert!(lines.contains(&"pid=42".to_string()));
        assert!(lines.contains(&"stopped_at=none".to_string()));
        assert!(lines.contains(&"loop:poll.state=error".to_string()));
        assert!(lines.contains(&"loop:poll.last_error=poll failed: timeout".to_string()));
    }
}
