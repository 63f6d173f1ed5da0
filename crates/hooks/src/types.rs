use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Exit code with which a `before_tool` hook vetoes the call.
pub const VETO_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HookTrigger {
    BeforeAgent,
    AfterAgent,
    BeforeTool,
    AfterTool,
    OnError,
}

impl HookTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookTrigger::BeforeAgent => "before_agent",
            HookTrigger::AfterAgent => "after_agent",
            HookTrigger::BeforeTool => "before_tool",
            HookTrigger::AfterTool => "after_tool",
            HookTrigger::OnError => "on_error",
        }
    }

    pub fn can_veto(&self) -> bool {
        matches!(self, HookTrigger::BeforeTool)
    }
}

impl fmt::Display for HookTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

/// One configured hook. Exactly one of `command` or `script` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookConfig {
    pub name: String,
    pub trigger: HookTrigger,
    /// Run via `sh -c`; receives the JSON context on stdin.
    #[serde(default)]
    pub command: Option<String>,
    /// Inline shell script fed to `sh` on stdin.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Regex on the tool name; tool triggers only.
    #[serde(default)]
    pub tool_pattern: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl HookConfig {
    pub fn command(name: impl Into<String>, trigger: HookTrigger, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger,
            command: Some(command.into()),
            script: None,
            timeout_secs: default_timeout_secs(),
            enabled: true,
            tool_pattern: None,
            env: HashMap::new(),
        }
    }

    pub fn script(name: impl Into<String>, trigger: HookTrigger, script: impl Into<String>) -> Self {
        Self {
            command: None,
            script: Some(script.into()),
            ..Self::command(name, trigger, "")
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_tool_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.tool_pattern = Some(pattern.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Snapshot of loop state handed to hooks. Owned, so hooks never borrow the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HookContext {
    pub session_id: String,
    pub cwd: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookContext {
    pub fn new(session_id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, params: serde_json::Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_params = Some(params);
        self
    }

    pub fn with_tool_output(mut self, output: impl Into<String>) -> Self {
        self.tool_output = Some(output.into());
        self
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    pub fn with_agent_response(mut self, response: impl Into<String>) -> Self {
        self.agent_response = Some(response.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Passed,
    Vetoed { reason: String },
    Failed { exit_code: Option<i32>, stderr: String },
    TimedOut,
    SpawnFailed(String),
}

impl HookOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            HookOutcome::Failed { .. } | HookOutcome::TimedOut | HookOutcome::SpawnFailed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRun {
    pub hook: String,
    pub trigger: HookTrigger,
    pub outcome: HookOutcome,
    pub duration: Duration,
}

/// Outcomes of every hook fired for one trigger, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    pub runs: Vec<HookRun>,
}

impl HookReport {
    /// First veto reason, if any hook vetoed.
    pub fn veto(&self) -> Option<&str> {
        self.runs.iter().find_map(|run| match &run.outcome {
            HookOutcome::Vetoed { reason } => Some(reason.as_str()),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &HookRun> {
        self.runs.iter().filter(|run| run.outcome.is_failure())
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
