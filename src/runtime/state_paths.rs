use super::RuntimeError;
use std::fs;
use std::path::PathBuf;

/// Layout of the daemon's state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![self.root.join("logs"), self.daemon_dir()]
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn daemon_state_path(&self) -> PathBuf {
        self.daemon_dir().join("runtime.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.daemon_dir().join("pocketclaw.lock")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.daemon_dir().join("stop")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.root.join("logs/runtime.log")
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.root.join("state.db")
    }
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| RuntimeError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
