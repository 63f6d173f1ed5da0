use keel_memory::{LoopWarning, MessageId};
use serde::{Deserialize, Serialize};

/// Where a turn is in the model/tool cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    AwaitingModel,
    ProcessingResponse,
    ExecutingTools,
    Done,
    Aborted,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Done | LoopState::Aborted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    IterationLimit { limit: usize },
    Cancelled,
}

/// What happened during one user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub state: LoopState,
    pub abort: Option<AbortReason>,
    /// Final assistant text when the turn reached `Done`.
    pub final_text: Option<String>,
    pub tool_rounds: usize,
    pub loop_warnings: Vec<LoopWarning>,
    pub hook_failures: usize,
    /// Ids of every message appended during the turn, in order.
    pub appended: Vec<MessageId>,
}

impl TurnReport {
    pub(crate) fn new() -> Self {
        Self {
            state: LoopState::Idle,
            abort: None,
            final_text: None,
            tool_rounds: 0,
            loop_warnings: Vec::new(),
            hook_failures: 0,
            appended: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == LoopState::Done
    }

    pub fn is_aborted(&self) -> bool {
        self.state == LoopState::Aborted
    }
}
