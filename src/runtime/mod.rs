//! Daemon lifecycle: state root layout, single-instance ownership, the poll
//! and janitor loops, crash recovery, and the supervisor that wires them to
//! the executor.

pub mod janitor;
pub mod loops;
pub mod ownership_lock;
pub mod poll;
pub mod recovery;
pub mod state_paths;
pub mod supervisor;

pub use crate::shared::errors::RuntimeError;
pub use janitor::{run_janitor_once, JanitorReport};
pub use loops::{apply_loop_event, LoopEvent, LoopHealth, LoopState};
pub use ownership_lock::{
    cleanup_stale_daemon, clear_start_lock, is_process_alive, ownership_state,
    reserve_start_lock, signal_stop, spawn_daemon_process, stop_running_daemon,
    terminate_process, write_lock_pid, OwnershipLock, OwnershipState, StopResult,
    START_HANDOFF_ENV,
};
pub use poll::{PollLoop, PollReport, FETCH_OVERLAP_MS};
pub use recovery::reconcile_stale_task;
pub use state_paths::{bootstrap_state_root, StatePaths};
pub use supervisor::{
    load_daemon_state, run_daemon, run_daemon_with, save_daemon_state, DaemonState,
};
