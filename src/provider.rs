//! Worker subprocess management: invocation building, stream-json parsing,
//! the single-run process driver and the retrying session that owns it.

pub mod activity;
pub mod invocation;
pub mod runner;
pub mod session;
pub mod stream;
pub mod types;

pub use activity::{describe_tool, ActivityThrottle};
pub use invocation::{build_context_prompt, build_invocation, WorkerInvocation};
pub use runner::{run_worker, RunControl, RunOutcome};
pub use session::WorkerSession;
pub use stream::{parse_line, ContentBlock, StreamEvent, StreamLine};
pub use types::{
    is_transient_message, WorkerError, WorkerState, NO_RESPONSE_SENTINEL, TIMEOUT_MARKER,
};
