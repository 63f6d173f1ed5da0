pub mod command;
pub mod dispatcher;
pub mod environment;
pub mod types;

pub use command::{run_hook_process, HookError, HookProcess, ProcessOutput};
pub use dispatcher::HookDispatcher;
pub use environment::{HookEnvironment, MAX_ENV_VALUE_BYTES};
pub use types::{HookConfig, HookContext, HookOutcome, HookReport, HookRun, HookTrigger, VETO_EXIT_CODE};
