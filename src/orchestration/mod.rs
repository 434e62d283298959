pub mod approval;
pub mod commands;
pub mod dispatch;
pub mod executor;
pub mod router;

pub use approval::{ApprovalGate, Resolution};
pub use commands::{ControlCommands, HELP_TEXT};
pub use dispatch::{DispatchError, DispatchOutcome, InboundDispatcher};
pub use executor::{describe_request, ExecutorError, ExecutorJob, SubmitOutcome, TaskExecutor};
pub use router::{
    approval_response, classify, is_whitelisted, resolve_directory, CommandKind, DirectoryError,
};
