use crate::traits::{ConfirmationDetails, Tool, ToolContext, ToolError, ToolKind, ToolResult};
use async_trait::async_trait;
use keel_policy::CommandPatterns;
use serde::Deserialize;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

const MAX_OUTPUT_CHARS: usize = 30_000;

#[derive(Deserialize)]
struct ShellInput {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Runs a command line through `sh -c` in the session's working directory.
pub struct ShellTool {
    patterns: Arc<CommandPatterns>,
}

impl ShellTool {
    pub fn new(patterns: Arc<CommandPatterns>) -> Self {
        Self { patterns }
    }

    fn command_of(params: &serde_json::Value) -> &str {
        params["command"].as_str().unwrap_or_default()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its combined output"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command line passed to sh -c"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Optional timeout, bounded by the session limit"
                }
            },
            "required": ["command"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Shell
    }

    fn is_mutating(&self, params: &serde_json::Value) -> bool {
        !self.patterns.is_safe(Self::command_of(params))
    }

    fn is_dangerous(&self, params: &serde_json::Value) -> bool {
        self.patterns.is_dangerous(Self::command_of(params))
    }

    fn confirmation(&self, params: &serde_json::Value) -> ConfirmationDetails {
        ConfirmationDetails {
            description: format!("Run `{}`", Self::command_of(params)),
            affected_paths: Vec::new(),
        }
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let input: ShellInput =
            serde_json::from_value(params).map_err(|e| ToolError::Validation(e.to_string()))?;
        if input.command.trim().is_empty() {
            return Err(ToolError::Validation("Empty command".to_string()));
        }

        let limit = input
            .timeout_secs
            .map(Duration::from_secs)
            .map_or(ctx.timeout, |t| t.min(ctx.timeout));

        debug!("Running shell command in {}: {}", ctx.working_dir.display(), input.command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&input.command)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let pid = child.id();

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| ToolError::Execution(e.to_string()))?,
            Err(_) => {
                warn!("Shell command timed out after {:?}: {}", limit, input.command);
                kill_process_group(pid);
                return Err(ToolError::Timeout(limit));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        let truncated = combined.chars().count() > MAX_OUTPUT_CHARS;
        if truncated {
            combined = combined.chars().take(MAX_OUTPUT_CHARS).collect();
            combined.push_str("\n... [output truncated]");
        }

        let exit_code = output.status.code();
        let mut result = if output.status.success() {
            ToolResult::success(combined)
        } else {
            ToolResult::failure(format!(
                "Command exited with status {}",
                exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            ))
            .with_output(combined)
        };
        result = result.with_metadata(json!({ "exit_code": exit_code })).mutated();
        Ok(if truncated { result.truncated() } else { result })
    }
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: killpg only sends a signal; the group was created by process_group(0).
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
