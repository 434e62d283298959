use crate::store::StoreError;
use serde::{Deserialize, Serialize};

/// Reply used when the worker exits cleanly without producing any text.
pub const NO_RESPONSE_SENTINEL: &str = "(no response)";

/// Appended to partial output when a run is cut off by the timeout.
pub const TIMEOUT_MARKER: &str = "\n\n[timed out: output may be incomplete]";

const TRANSIENT_MARKERS: &[&str] = &[
    "overloaded",
    "rate limit",
    "rate_limit",
    "429",
    "529",
    "too many requests",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Starting,
    Streaming,
    Completed,
    Failed,
    TimedOut,
    Interrupted,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Streaming)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker binary `{binary}` was not found")]
    MissingBinary { binary: String },
    #[error("failed to spawn worker `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker i/o failed while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },
    #[error("worker reported an error: {0}")]
    Reported(String),
    #[error("worker timed out after {timeout_ms}ms without producing output")]
    Timeout { timeout_ms: u64 },
    #[error("worker run was interrupted")]
    Interrupted,
    #[error("working directory `{0}` is unavailable")]
    WorkingDirectory(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// Overload and rate-limit failures are worth retrying; everything else
    /// propagates on the first attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NonZeroExit { stderr, .. } => is_transient_message(stderr),
            Self::Reported(message) => is_transient_message(message),
            _ => false,
        }
    }
}

pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}
