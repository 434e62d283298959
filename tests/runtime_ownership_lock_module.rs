use pocketclaw::runtime::{
    bootstrap_state_root, cleanup_stale_daemon, load_daemon_state, ownership_state,
    reserve_start_lock, stop_running_daemon, write_lock_pid, OwnershipLock, OwnershipState,
    RuntimeError, StatePaths, START_HANDOFF_ENV,
};
use pocketclaw::shared::logging::RuntimeLog;
use std::fs;
use std::os::unix::process::parent_id;
use std::process::Command;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn state_root() -> (tempfile::TempDir, StatePaths, RuntimeLog) {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join(".pocketclaw"));
    bootstrap_state_root(&paths).expect("bootstrap");
    let log = RuntimeLog::new(paths.runtime_log_path());
    (dir, paths, log)
}

/// Spawns `sleep` and reaps it on a background thread so a killed child does
/// not linger as a zombie that still answers `kill -0`.
fn spawn_sleeper() -> u32 {
    let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
    let pid = child.id();
    thread::spawn(move || {
        let _ = child.wait();
    });
    pid
}

#[test]
fn fresh_root_is_not_running() {
    let (_dir, paths, _log) = state_root();
    assert_eq!(ownership_state(&paths).expect("state"), OwnershipState::NotRunning);
}

#[test]
fn dead_owner_is_stale_until_cleaned_up() {
    let (_dir, paths, _log) = state_root();
    fs::write(paths.lock_path(), "999999").expect("write lock");
    assert_eq!(ownership_state(&paths).expect("state"), OwnershipState::Stale);

    cleanup_stale_daemon(&paths).expect("cleanup");
    assert_eq!(ownership_state(&paths).expect("state"), OwnershipState::NotRunning);
    assert!(!paths.lock_path().exists());
    assert!(!load_daemon_state(&paths).expect("daemon state").running);
}

#[test]
fn acquire_claims_and_drop_releases() {
    let (_dir, paths, log) = state_root();
    let lock = OwnershipLock::acquire(&paths, &log).expect("acquire");
    assert_eq!(lock.pid(), std::process::id());
    assert_eq!(
        fs::read_to_string(lock.path()).expect("read lock"),
        std::process::id().to_string()
    );
    assert_eq!(
        ownership_state(&paths).expect("state"),
        OwnershipState::Running {
            pid: std::process::id()
        }
    );

    drop(lock);
    assert!(!paths.lock_path().exists());
}

#[test]
fn acquire_reclaims_a_stale_lock() {
    let (_dir, paths, log) = state_root();
    fs::write(paths.lock_path(), "999999").expect("write lock");
    let lock = OwnershipLock::acquire(&paths, &log).expect("reclaim");
    assert_eq!(lock.pid(), std::process::id());
    let logged = fs::read_to_string(paths.runtime_log_path()).expect("log");
    assert!(logged.contains("daemon.lock.reclaimed"));
}

#[test]
fn acquire_refuses_a_live_owner() {
    let (_dir, paths, log) = state_root();
    let owner = spawn_sleeper();
    fs::write(paths.lock_path(), owner.to_string()).expect("write lock");

    let err = OwnershipLock::acquire(&paths, &log).expect_err("already running");
    assert!(matches!(err, RuntimeError::AlreadyRunning { pid } if pid == owner));
    assert!(paths.lock_path().exists());

    let _ = Command::new("kill").arg("-KILL").arg(owner.to_string()).status();
}

#[test]
fn reserved_start_lock_is_adopted_by_the_reserving_process() {
    let (_dir, paths, log) = state_root();
    reserve_start_lock(&paths).expect("reserve");
    assert!(reserve_start_lock(&paths).is_err());

    let lock = OwnershipLock::acquire(&paths, &log).expect("adopt own reservation");
    assert_eq!(lock.pid(), std::process::id());
}

#[test]
fn parent_held_lock_is_refused_without_the_start_marker() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let (_dir, paths, log) = state_root();
    let parent = parent_id();
    fs::write(paths.lock_path(), parent.to_string()).expect("write lock");

    std::env::remove_var(START_HANDOFF_ENV);
    let err = OwnershipLock::acquire(&paths, &log).expect_err("not handed off");
    assert!(matches!(err, RuntimeError::AlreadyRunning { pid } if pid == parent));
    assert_eq!(
        fs::read_to_string(paths.lock_path()).expect("lock"),
        parent.to_string()
    );
}

#[test]
fn parent_held_lock_is_adopted_with_the_start_marker() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    let (_dir, paths, log) = state_root();
    let parent = parent_id();
    fs::write(paths.lock_path(), parent.to_string()).expect("write lock");

    std::env::set_var(START_HANDOFF_ENV, parent.to_string());
    let adopted = OwnershipLock::acquire(&paths, &log);
    std::env::remove_var(START_HANDOFF_ENV);

    let lock = adopted.expect("handoff");
    assert_eq!(lock.pid(), std::process::id());
    assert_eq!(
        fs::read_to_string(paths.lock_path()).expect("lock"),
        std::process::id().to_string()
    );
}

#[test]
fn stop_escalates_when_the_owner_ignores_the_stop_file() {
    let (_dir, paths, _log) = state_root();
    reserve_start_lock(&paths).expect("reserve");
    let owner = spawn_sleeper();
    write_lock_pid(&paths, owner).expect("hand off");

    let result = stop_running_daemon(&paths, Duration::from_millis(200)).expect("stop");
    assert_eq!(result.pid, owner);
    assert!(result.forced);
    assert_eq!(ownership_state(&paths).expect("state"), OwnershipState::NotRunning);
    assert!(!paths.stop_signal_path().exists());
}

#[test]
fn stop_without_a_daemon_reports_not_running() {
    let (_dir, paths, _log) = state_root();
    let err = stop_running_daemon(&paths, Duration::from_millis(50)).expect_err("not running");
    assert!(matches!(err, RuntimeError::NotRunning));
}
