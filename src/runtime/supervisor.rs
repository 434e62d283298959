use super::janitor::run_janitor_once;
use super::loops::{
    apply_loop_event, panic_message, run_periodic, LoopEvent, LoopHealth, LoopState,
    JANITOR_LOOP_ID, POLL_LOOP_ID,
};
use super::ownership_lock::OwnershipLock;
use super::poll::PollLoop;
use super::recovery::reconcile_stale_task;
use super::{bootstrap_state_root, RuntimeError, StatePaths};
use crate::config::{home_dir, Settings};
use crate::orchestration::{ApprovalGate, ControlCommands, InboundDispatcher, TaskExecutor};
use crate::provider::WorkerSession;
use crate::shared::fs_atomic::{atomic_write_file, read_optional};
use crate::shared::logging::RuntimeLog;
use crate::shared::time::{now_millis, now_secs};
use crate::store::StateStore;
use crate::transport::{send_chunked, Transport, TwilioTransport};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const EVENT_WAIT: Duration = Duration::from_millis(50);
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// Snapshot written to `daemon/runtime.json` for `status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DaemonState {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    #[serde(default)]
    pub loops: BTreeMap<String, LoopHealth>,
    pub last_error: Option<String>,
}

/// Runs the daemon in the foreground against the configured REST transport.
pub fn run_daemon(settings: Settings) -> Result<(), RuntimeError> {
    let transport: Arc<dyn Transport> =
        Arc::new(TwilioTransport::from_config(&settings.transport)?);
    run_daemon_with(settings, transport)
}

/// Runs the daemon until the stop file appears. Any error or panic from the
/// run is reported to the operator before it is returned.
pub fn run_daemon_with(
    settings: Settings,
    transport: Arc<dyn Transport>,
) -> Result<(), RuntimeError> {
    let paths = StatePaths::new(settings.resolve_state_root()?);
    bootstrap_state_root(&paths)?;
    let log = RuntimeLog::new(paths.runtime_log_path());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        serve(&settings, &paths, Arc::clone(&transport), &log)
    }));
    let err = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err @ RuntimeError::AlreadyRunning { .. })) => return Err(err),
        Ok(Err(err)) => err,
        Err(payload) => RuntimeError::Panicked(panic_message(payload.as_ref())),
    };

    log.error("daemon.failed", &err.to_string());
    mark_stopped(&paths, Some(err.to_string()));
    if let Some(operator) = settings.operator_address() {
        let notice = format!("pocketclaw stopped on an error: {err}");
        if let Err(send_err) = send_chunked(transport.as_ref(), operator, &notice) {
            log.warn("daemon.notice.send_failed", &send_err.to_string());
        }
    }
    Err(err)
}

fn serve(
    settings: &Settings,
    paths: &StatePaths,
    transport: Arc<dyn Transport>,
    log: &RuntimeLog,
) -> Result<(), RuntimeError> {
    let lock = OwnershipLock::acquire(paths, log)?;
    let _ = fs::remove_file(paths.stop_signal_path());

    let store = StateStore::open(&paths.state_db_path())?;
    let session = Arc::new(WorkerSession::from_settings(
        settings,
        store.clone(),
        log.clone(),
    )?);
    let scratch = settings.resolve_scratch_directory()?;
    if let Err(err) = fs::create_dir_all(&scratch) {
        log.warn(
            "daemon.scratch.unavailable",
            &format!("path={} error={err}", scratch.display()),
        );
    }
    let operator = settings.operator_address();

    let (executor, executor_handle) = TaskExecutor::start(
        store.clone(),
        Arc::clone(&transport),
        Arc::clone(&session),
        log.clone(),
        settings.history.window,
    );
    reconcile_stale_task(&store, transport.as_ref(), operator, log)?;
    if let Err(err) = executor.drain_pending() {
        log.error("daemon.drain.failed", &err.to_string());
    }

    let gate = ApprovalGate::new(
        store.clone(),
        settings.approval_ttl_ms(),
        &settings.approval.gated_phrases,
    );
    let home = home_dir()?;
    let allowed_roots = vec![
        home.clone(),
        session.default_directory().to_path_buf(),
        scratch,
    ];
    let controls = ControlCommands::new(
        store.clone(),
        Arc::clone(&session),
        home,
        allowed_roots,
        log.clone(),
    );
    let dispatcher = Arc::new(InboundDispatcher::new(
        store.clone(),
        Arc::clone(&transport),
        Arc::clone(&executor),
        gate.clone(),
        controls,
        settings.whitelist.clone(),
        log.clone(),
    ));
    let poller = PollLoop::new(store.clone(), Arc::clone(&transport), dispatcher, log.clone());

    let mut state = DaemonState {
        running: true,
        pid: Some(lock.pid()),
        started_at: Some(now_secs()),
        ..DaemonState::default()
    };
    for loop_id in [POLL_LOOP_ID, JANITOR_LOOP_ID] {
        state.loops.insert(loop_id.to_string(), LoopHealth::default());
    }
    save_daemon_state(paths, &state)?;
    log.info("daemon.started", &format!("pid={}", lock.pid()));
    if let Some(operator) = operator {
        let directory = session
            .working_directory()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let notice = format!("pocketclaw is up. Directory: {directory}");
        if let Err(err) = send_chunked(transport.as_ref(), operator, &notice) {
            log.warn("daemon.notice.send_failed", &err.to_string());
        }
    }

    let stop = AtomicBool::new(false);
    let (events_tx, events_rx) = mpsc::channel::<LoopEvent>();
    let mut active = BTreeSet::from([POLL_LOOP_ID.to_string(), JANITOR_LOOP_ID.to_string()]);
    let retention_ms = settings.processed_retention_ms();

    let loop_panic = thread::scope(|scope| {
        let poll_events = events_tx.clone();
        let stop_ref = &stop;
        let poller = &poller;
        scope.spawn(move || {
            run_periodic(
                POLL_LOOP_ID,
                settings.poll_interval(),
                stop_ref,
                &poll_events,
                || {
                    poller
                        .poll_once()
                        .map(|_| ())
                        .map_err(|err| format!("poll failed: {err}"))
                },
            )
        });

        let janitor_events = events_tx.clone();
        let janitor_store = store.clone();
        let janitor_gate = gate.clone();
        let janitor_log = log.clone();
        scope.spawn(move || {
            run_periodic(
                JANITOR_LOOP_ID,
                settings.janitor_interval(),
                stop_ref,
                &janitor_events,
                || {
                    let report =
                        run_janitor_once(&janitor_store, &janitor_gate, retention_ms, now_millis())
                            .map_err(|err| format!("janitor failed: {err}"))?;
                    if report.expired_approvals > 0 || report.pruned_events > 0 {
                        janitor_log.info(
                            "janitor.swept",
                            &format!(
                                "expired_approvals={} pruned_events={}",
                                report.expired_approvals, report.pruned_events
                            ),
                        );
                    }
                    Ok(())
                },
            )
        });
        drop(events_tx);

        let first = supervise(paths, log, &stop, &events_rx, &mut state, &mut active);
        let later = drain_stopped_loops(
            paths,
            log,
            &events_rx,
            &mut state,
            &mut active,
            settings.shutdown_timeout(),
        );
        first.or(later)
    });
    if let Some(message) = &loop_panic {
        state.last_error = Some(format!("loop panicked: {message}"));
    }

    executor.shutdown();
    let mut idle = executor.wait_for_idle(settings.shutdown_timeout());
    if !idle {
        let message = "task still running after shutdown timeout; interrupting";
        log.warn("daemon.shutdown.timeout", message);
        state.last_error = Some(message.to_string());
        let _ = session.interrupt();
        idle = executor.wait_for_idle(INTERRUPT_GRACE);
    }
    if idle {
        if executor_handle.join().is_err() {
            log.error("daemon.executor.panicked", "executor thread panicked");
        }
    } else {
        log.error("daemon.executor.detached", "executor did not settle; exiting anyway");
    }

    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_daemon_state(paths, &state)?;
    let _ = fs::remove_file(paths.stop_signal_path());
    drop(lock);
    if let Some(message) = loop_panic {
        return Err(RuntimeError::Panicked(message));
    }
    log.info("daemon.stopped", "runtime stopped cleanly");
    Ok(())
}

/// Waits for the stop file while folding loop events into `state`. Returns
/// the message of the first loop panic, if one ended the wait.
fn supervise(
    paths: &StatePaths,
    log: &RuntimeLog,
    stop: &AtomicBool,
    events: &Receiver<LoopEvent>,
    state: &mut DaemonState,
    active: &mut BTreeSet<String>,
) -> Option<String> {
    let mut panicked = None;
    while !stop.load(Ordering::Relaxed) {
        if paths.stop_signal_path().exists() {
            stop.store(true, Ordering::Relaxed);
            log.info("daemon.stop.signal", "stop file detected");
            break;
        }
        match events.recv_timeout(EVENT_WAIT) {
            Ok(event) => {
                let message = record_loop_event(paths, log, state, active, event);
                panicked = panicked.or(message);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                stop.store(true, Ordering::Relaxed);
            }
        }
    }
    panicked
}

fn drain_stopped_loops(
    paths: &StatePaths,
    log: &RuntimeLog,
    events: &Receiver<LoopEvent>,
    state: &mut DaemonState,
    active: &mut BTreeSet<String>,
    timeout: Duration,
) -> Option<String> {
    let mut panicked = None;
    let deadline = Instant::now() + timeout;
    while !active.is_empty() && Instant::now() < deadline {
        match events.recv_timeout(EVENT_WAIT) {
            Ok(event) => {
                let message = record_loop_event(paths, log, state, active, event);
                panicked = panicked.or(message);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for loop_id in active.iter() {
        if let Some(health) = state.loops.get_mut(loop_id) {
            health.state = LoopState::Stopped;
        }
    }
    panicked
}

fn record_loop_event(
    paths: &StatePaths,
    log: &RuntimeLog,
    state: &mut DaemonState,
    active: &mut BTreeSet<String>,
    event: LoopEvent,
) -> Option<String> {
    let panicked = match &event {
        LoopEvent::Panicked { message, .. } => Some(message.clone()),
        _ => None,
    };
    if let Some(line) = apply_loop_event(&mut state.loops, active, event) {
        log.append(line.level, line.event, &line.message);
    }
    let _ = save_daemon_state(paths, state);
    panicked
}

fn mark_stopped(paths: &StatePaths, error: Option<String>) {
    let mut state = load_daemon_state(paths).unwrap_or_default();
    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    state.last_error = error;
    let _ = save_daemon_state(paths, &state);
}

pub fn load_daemon_state(paths: &StatePaths) -> Result<DaemonState, RuntimeError> {
    let path = paths.daemon_state_path();
    let Some(raw) = read_optional(&path).map_err(|source| RuntimeError::ReadState {
        path: path.display().to_string(),
        source,
    })?
    else {
        return Ok(DaemonState::default());
    };
    serde_json::from_str(&raw).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_daemon_state(paths: &StatePaths, state: &DaemonState) -> Result<(), RuntimeError> {
    let path = paths.daemon_state_path();
    let encoded = serde_json::to_vec_pretty(state).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &encoded).map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}
