use crate::command::{run_hook_process, HookError, HookProcess};
use crate::environment::HookEnvironment;
use crate::types::{HookConfig, HookContext, HookOutcome, HookReport, HookRun, HookTrigger, VETO_EXIT_CODE};
use regex::Regex;
use std::time::Instant;
use tracing::{debug, warn};

struct RegisteredHook {
    config: HookConfig,
    tool_filter: Option<Regex>,
}

impl RegisteredHook {
    fn matches(&self, trigger: HookTrigger, ctx: &HookContext) -> bool {
        if !self.config.enabled || self.config.trigger != trigger {
            return false;
        }
        match (&self.tool_filter, &ctx.tool_name) {
            (Some(filter), Some(name)) => filter.is_match(name),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Runs user-configured shell hooks at lifecycle points.
///
/// Hooks for one trigger run concurrently; the report keeps configuration
/// order. Failures are logged and reported, never raised.
pub struct HookDispatcher {
    hooks: Vec<RegisteredHook>,
    enabled: bool,
}

impl HookDispatcher {
    pub fn new(configs: Vec<HookConfig>, enabled: bool) -> Result<Self, HookError> {
        let hooks = configs
            .into_iter()
            .map(|config| {
                validate(&config)?;
                let tool_filter = config
                    .tool_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| HookError::InvalidConfig {
                        name: config.name.clone(),
                        reason: format!("invalid tool_pattern: {}", e),
                    })?;
                Ok(RegisteredHook { config, tool_filter })
            })
            .collect::<Result<Vec<_>, HookError>>()?;
        Ok(Self { hooks, enabled })
    }

    /// Dispatcher that never runs anything.
    pub fn disabled() -> Self {
        Self {
            hooks: Vec::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn has_hooks_for(&self, trigger: HookTrigger) -> bool {
        self.enabled
            && self
                .hooks
                .iter()
                .any(|h| h.config.enabled && h.config.trigger == trigger)
    }

    pub async fn fire(&self, trigger: HookTrigger, ctx: &HookContext) -> HookReport {
        if !self.enabled {
            return HookReport::default();
        }

        let matching: Vec<&RegisteredHook> = self
            .hooks
            .iter()
            .filter(|h| h.matches(trigger, ctx))
            .collect();
        if matching.is_empty() {
            return HookReport::default();
        }

        debug!(trigger = %trigger, count = matching.len(), "Firing hooks");
        let runs = futures::future::join_all(
            matching
                .into_iter()
                .map(|hook| run_one(&hook.config, trigger, ctx)),
        )
        .await;

        HookReport { runs }
    }
}

fn validate(config: &HookConfig) -> Result<(), HookError> {
    let invalid = |reason: &str| HookError::InvalidConfig {
        name: config.name.clone(),
        reason: reason.to_string(),
    };
    if config.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    match (&config.command, &config.script) {
        (Some(_), Some(_)) => return Err(invalid("set either command or script, not both")),
        (None, None) => return Err(invalid("one of command or script is required")),
        (Some(c), None) if c.trim().is_empty() => return Err(invalid("command is empty")),
        (None, Some(s)) if s.trim().is_empty() => return Err(invalid("script is empty")),
        _ => {}
    }
    if config.timeout_secs == 0 {
        return Err(invalid("timeout_secs must be positive"));
    }
    Ok(())
}

async fn run_one(config: &HookConfig, trigger: HookTrigger, ctx: &HookContext) -> HookRun {
    let started = Instant::now();
    let env = HookEnvironment::capture(trigger, ctx).with_extra(&config.env);

    let process = match (&config.command, &config.script) {
        (Some(command), _) => {
            let mut payload = serde_json::to_value(ctx).unwrap_or_default();
            if let Some(map) = payload.as_object_mut() {
                map.insert("trigger".to_string(), trigger.as_str().into());
            }
            HookProcess::Command {
                command: command.clone(),
                stdin: payload.to_string(),
            }
        }
        (None, Some(script)) => HookProcess::Script {
            script: script.clone(),
        },
        (None, None) => {
            return HookRun {
                hook: config.name.clone(),
                trigger,
                outcome: HookOutcome::SpawnFailed("no command configured".to_string()),
                duration: started.elapsed(),
            }
        }
    };

    let outcome = match run_hook_process(&process, &env, Some(&ctx.cwd), config.timeout()).await {
        Ok(output) if output.success() => HookOutcome::Passed,
        Ok(output) if trigger.can_veto() && output.exit_code == Some(VETO_EXIT_CODE) => {
            let reason = output.stderr.trim();
            HookOutcome::Vetoed {
                reason: if reason.is_empty() {
                    "Hook blocked execution".to_string()
                } else {
                    reason.to_string()
                },
            }
        }
        Ok(output) => HookOutcome::Failed {
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        },
        Err(HookError::Timeout(_)) => HookOutcome::TimedOut,
        Err(e) => HookOutcome::SpawnFailed(e.to_string()),
    };

    match &outcome {
        HookOutcome::Passed => debug!(hook = %config.name, trigger = %trigger, "Hook passed"),
        HookOutcome::Vetoed { reason } => {
            warn!(hook = %config.name, tool = ?ctx.tool_name, reason = %reason, "Hook vetoed tool call")
        }
        HookOutcome::Failed { exit_code, stderr } => warn!(
            hook = %config.name,
            trigger = %trigger,
            exit_code = ?exit_code,
            stderr = %stderr,
            "Hook failed"
        ),
        HookOutcome::TimedOut => warn!(
            hook = %config.name,
            trigger = %trigger,
            timeout_secs = config.timeout_secs,
            "Hook timed out"
        ),
        HookOutcome::SpawnFailed(e) => warn!(hook = %config.name, error = %e, "Hook could not be started"),
    }

    HookRun {
        hook: config.name.clone(),
        trigger,
        outcome,
        duration: started.elapsed(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn tool_ctx(dir: &std::path::Path, tool: &str) -> HookContext {
        HookContext::new("session-1", dir).with_tool(tool, json!({"path": "a.txt"}))
    }

    #[tokio::test]
    async fn test_before_tool_veto_uses_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = HookDispatcher::new(
            vec![HookConfig::command(
                "guard",
                HookTrigger::BeforeTool,
                "echo 'writes are frozen' >&2; exit 2",
            )],
            true,
        )
        .unwrap();

        let report = hooks
            .fire(HookTrigger::BeforeTool, &tool_ctx(dir.path(), "write_file"))
            .await;
        assert_eq!(report.veto(), Some("writes are frozen"));
        assert_eq!(report.failures().count(), 0);
    }

    #[tokio::test]
    async fn test_exit_two_outside_before_tool_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = HookDispatcher::new(
            vec![HookConfig::command("post", HookTrigger::AfterTool, "exit 2")],
            true,
        )
        .unwrap();

        let report = hooks
            .fire(HookTrigger::AfterTool, &tool_ctx(dir.path(), "write_file"))
            .await;
        assert_eq!(report.veto(), None);
        assert!(matches!(
            report.runs[0].outcome,
            HookOutcome::Failed { exit_code: Some(2), .. }
        ));
    }

    #[tokio::test]
    async fn test_large_tool_output_reaches_hook() {
        let dir = tempfile::tempdir().unwrap();
        let output = "z".repeat(200 * 1024);
        let hooks = HookDispatcher::new(
            vec![HookConfig::command("size", HookTrigger::AfterTool, "wc -c")],
            true,
        )
        .unwrap();

        let ctx = tool_ctx(dir.path(), "read_file").with_tool_output(output);
        let report = hooks.fire(HookTrigger::AfterTool, &ctx).await;
        assert_eq!(report.runs[0].outcome, HookOutcome::Passed);
    }

    #[tokio::test]
    async fn test_slow_hook_times_out_with_unread_payload() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = HookDispatcher::new(
            vec![HookConfig::command("slow", HookTrigger::AfterTool, "sleep 6")
                .with_timeout(Duration::from_secs(1))],
            true,
        )
        .unwrap();

        let ctx = tool_ctx(dir.path(), "read_file").with_tool_output("o".repeat(100 * 1024));
        let started = std::time::Instant::now();
        let report = hooks.fire(HookTrigger::AfterTool, &ctx).await;
        assert_eq!(report.runs[0].outcome, HookOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_stdin_payload_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seen.txt");
        let command = format!(
            "cat > {}; echo \" $KEEL_TOOL_NAME $KEEL_SESSION_ID\" >> {}",
            out.display(),
            out.display()
        );
        let hooks = HookDispatcher::new(
            vec![HookConfig::command("record", HookTrigger::BeforeTool, command)],
            true,
        )
        .unwrap();

        let report = hooks
            .fire(HookTrigger::BeforeTool, &tool_ctx(dir.path(), "read_file"))
            .await;
        assert_eq!(report.runs[0].outcome, HookOutcome::Passed);

        let seen = std::fs::read_to_string(&out).unwrap();
        assert!(seen.contains(r#""tool_name":"read_file""#));
        assert!(seen.contains(r#""trigger":"before_tool""#));
        assert!(seen.trim_end().ends_with("read_file session-1"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = HookDispatcher::new(
            vec![HookConfig::script("slow", HookTrigger::AfterAgent, "sleep 5")
                .with_timeout(Duration::from_secs(1))],
            true,
        )
        .unwrap();

        let report = hooks
            .fire(HookTrigger::AfterAgent, &HookContext::new("s", dir.path()))
            .await;
        assert_eq!(report.runs[0].outcome, HookOutcome::TimedOut);
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test]
    async fn test_filters_disabled_pattern_and_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let mut disabled = HookConfig::command("off", HookTrigger::BeforeTool, "exit 1");
        disabled.enabled = false;
        let hooks = HookDispatcher::new(
            vec![
                disabled,
                HookConfig::command("shell-only", HookTrigger::BeforeTool, "exit 1")
                    .with_tool_pattern("^shell$"),
                HookConfig::command("other", HookTrigger::AfterAgent, "exit 1"),
                HookConfig::command("all", HookTrigger::BeforeTool, "true"),
            ],
            true,
        )
        .unwrap();

        let report = hooks
            .fire(HookTrigger::BeforeTool, &tool_ctx(dir.path(), "read_file"))
            .await;
        let names: Vec<&str> = report.runs.iter().map(|r| r.hook.as_str()).collect();
        assert_eq!(names, vec!["all"]);
    }

    #[tokio::test]
    async fn test_globally_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = HookDispatcher::new(
            vec![HookConfig::command("x", HookTrigger::AfterAgent, "exit 1")],
            false,
        )
        .unwrap();
        assert!(!hooks.has_hooks_for(HookTrigger::AfterAgent));
        let report = hooks
            .fire(HookTrigger::AfterAgent, &HookContext::new("s", dir.path()))
            .await;
        assert!(report.is_empty());
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let mut both = HookConfig::command("both", HookTrigger::AfterTool, "true");
        both.script = Some("true".to_string());
        assert!(HookDispatcher::new(vec![both], true).is_err());

        let bad_pattern =
            HookConfig::command("re", HookTrigger::AfterTool, "true").with_tool_pattern("(");
        assert!(matches!(
            HookDispatcher::new(vec![bad_pattern], true),
            Err(HookError::InvalidConfig { .. })
        ));
    }
}
