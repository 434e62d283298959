use super::supervisor::{load_daemon_state, save_daemon_state};
use super::{RuntimeError, StatePaths};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::logging::RuntimeLog;
use crate::shared::time::now_secs;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Set by `start` on the daemon it spawns, holding the pid of the `start`
/// process that reserved the lock.
pub const START_HANDOFF_ENV: &str = "POCKETCLAW_START_HANDOFF";

const LIVENESS_POLL: Duration = Duration::from_millis(100);
const SIGNAL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    NotRunning,
    Running { pid: u32 },
    Stale,
}

#[derive(Debug, Clone)]
pub struct StopResult {
    pub pid: u32,
    pub forced: bool,
}

/// Exclusive claim on a state root, held for the daemon's lifetime.
///
/// The lock file holds the owner's pid. A lock whose pid is no longer alive
/// is reclaimed. Dropping the guard removes the file if it still names us.
#[derive(Debug)]
pub struct OwnershipLock {
    path: PathBuf,
    pid: u32,
}

impl OwnershipLock {
    pub fn acquire(paths: &StatePaths, log: &RuntimeLog) -> Result<Self, RuntimeError> {
        let path = paths.lock_path();
        let pid = std::process::id();
        ensure_parent(&path)?;

        for _ in 0..2 {
            match create_lock_file(&path, pid) {
                Ok(()) => return Ok(Self { path, pid }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(RuntimeError::WriteLock {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }

            match read_lock_pid(&path)? {
                Some(owner) if owner == pid || is_start_handoff(owner) => {
                    write_pid(&path, pid)?;
                    return Ok(Self { path, pid });
                }
                Some(owner) if is_process_alive(owner) => {
                    return Err(RuntimeError::AlreadyRunning { pid: owner })
                }
                owner => {
                    let owner = owner.map(|p| p.to_string()).unwrap_or_default();
                    log.warn("daemon.lock.reclaimed", &format!("stale_owner={owner}"));
                    let _ = fs::remove_file(&path);
                }
            }
        }

        match read_lock_pid(&path)? {
            Some(owner) => Err(RuntimeError::AlreadyRunning { pid: owner }),
            None => Err(RuntimeError::WriteLock {
                path: path.display().to_string(),
                source: std::io::Error::other("lock file contended"),
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OwnershipLock {
    fn drop(&mut self) {
        if let Ok(Some(owner)) = read_lock_pid(&self.path) {
            if owner == self.pid {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

fn create_lock_file(path: &Path, pid: u32) -> std::io::Result<()> {
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(pid.to_string().as_bytes()))
}

fn read_lock_pid(path: &Path) -> Result<Option<u32>, RuntimeError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse::<u32>().ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RuntimeError::ReadLock {
            path: path.display().to_string(),
            source,
        }),
    }
}

pub fn ownership_state(paths: &StatePaths) -> Result<OwnershipState, RuntimeError> {
    let lock_path = paths.lock_path();
    if let Some(pid) = read_lock_pid(&lock_path)? {
        if is_process_alive(pid) {
            return Ok(OwnershipState::Running { pid });
        }
        return Ok(OwnershipState::Stale);
    }
    if lock_path.exists() {
        return Ok(OwnershipState::Stale);
    }

    let state = load_daemon_state(paths)?;
    match state.pid {
        Some(pid) if state.running && is_process_alive(pid) => {
            Ok(OwnershipState::Running { pid })
        }
        _ if state.running => Ok(OwnershipState::Stale),
        _ => Ok(OwnershipState::NotRunning),
    }
}

pub fn cleanup_stale_daemon(paths: &StatePaths) -> Result<(), RuntimeError> {
    let _ = fs::remove_file(paths.lock_path());
    let _ = fs::remove_file(paths.stop_signal_path());
    let mut state = load_daemon_state(paths)?;
    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_daemon_state(paths, &state)
}

/// Claims the lock for a daemon that `start` is about to spawn.
pub fn reserve_start_lock(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.lock_path();
    ensure_parent(&path)?;
    create_lock_file(&path, std::process::id()).map_err(|source| RuntimeError::WriteLock {
        path: path.display().to_string(),
        source,
    })
}

pub fn write_lock_pid(paths: &StatePaths, pid: u32) -> Result<(), RuntimeError> {
    write_pid(&paths.lock_path(), pid)
}

fn write_pid(path: &Path, pid: u32) -> Result<(), RuntimeError> {
    atomic_write_file(path, pid.to_string().as_bytes()).map_err(|source| RuntimeError::WriteLock {
        path: path.display().to_string(),
        source,
    })
}

/// True when `owner` is the `start` process that spawned us and passed the
/// reservation down through [`START_HANDOFF_ENV`].
fn is_start_handoff(owner: u32) -> bool {
    let marker = std::env::var(START_HANDOFF_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok());
    marker == Some(owner) && owner == parent_pid()
}

fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        std::os::unix::process::parent_id()
    }

    #[cfg(not(unix))]
    {
        0
    }
}

pub fn clear_start_lock(paths: &StatePaths) {
    let _ = fs::remove_file(paths.lock_path());
}

/// Re-executes the current binary as a detached daemon.
pub fn spawn_daemon_process(config_path: Option<&Path>) -> Result<u32, RuntimeError> {
    let exe = std::env::current_exe().map_err(|e| RuntimeError::Spawn(e.to_string()))?;
    let mut command = Command::new(exe);
    command
        .arg("run")
        .env(START_HANDOFF_ENV, std::process::id().to_string());
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| RuntimeError::Spawn(e.to_string()))?;
    Ok(child.id())
}

pub fn signal_stop(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.stop_signal_path();
    ensure_parent(&path)?;
    fs::write(&path, b"stop").map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

/// Asks the daemon to stop via the stop file, escalating to TERM and then
/// KILL if it outlives `timeout`.
pub fn stop_running_daemon(
    paths: &StatePaths,
    timeout: Duration,
) -> Result<StopResult, RuntimeError> {
    let log = RuntimeLog::new(paths.runtime_log_path());
    let pid = match ownership_state(paths)? {
        OwnershipState::Running { pid } => pid,
        OwnershipState::Stale => {
            cleanup_stale_daemon(paths)?;
            return Err(RuntimeError::NotRunning);
        }
        OwnershipState::NotRunning => return Err(RuntimeError::NotRunning),
    };

    signal_stop(paths)?;
    log.info("daemon.stop.requested", &format!("pid={pid}"));
    if wait_for_exit(pid, timeout) {
        cleanup_stale_daemon(paths)?;
        return Ok(StopResult { pid, forced: false });
    }

    log.warn("daemon.stop.force", &format!("pid={pid}"));
    if !terminate_process(pid) {
        log.error(
            "daemon.stop.failed",
            &format!("pid={pid} remained alive after TERM/KILL"),
        );
        return Err(RuntimeError::StopFailedAlive { pid });
    }
    cleanup_stale_daemon(paths)?;
    Ok(StopResult { pid, forced: true })
}

/// TERM, then KILL after a grace period. Returns whether the process is gone.
pub fn terminate_process(pid: u32) -> bool {
    if !is_process_alive(pid) {
        return true;
    }
    send_signal(pid, "-TERM");
    if wait_for_exit(pid, SIGNAL_GRACE) {
        return true;
    }
    send_signal(pid, "-KILL");
    wait_for_exit(pid, SIGNAL_GRACE)
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while is_process_alive(pid) {
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(LIVENESS_POLL);
    }
    true
}

pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

fn send_signal(pid: u32, signal: &str) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}
