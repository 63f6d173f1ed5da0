#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use keel_core::{AgentConfig, CheckpointConfig, ModelReply};
use keel_hooks::{HookConfig, HookTrigger};
use keel_interfaces::AutoApprove;
use keel_memory::{CheckpointStore, Role, ToolStatus};
use keel_policy::ApprovalPolicy;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn yolo_config(dir: &TempDir, hooks: Vec<HookConfig>) -> AgentConfig {
    AgentConfig {
        policy: ApprovalPolicy::Yolo,
        hooks,
        ..test_config(dir.path())
    }
}

#[tokio::test]
async fn test_before_tool_hook_vetoes_matching_calls() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let hooks = vec![HookConfig::command(
        "freeze-writes",
        HookTrigger::BeforeTool,
        "echo 'writes are frozen' >&2; exit 2",
    )
    .with_tool_pattern("^write_file$")];
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![
            call("w", "write_file", json!({"path": "b.txt", "content": "beta"})),
            call("r", "read_file", json!({"path": "a.txt"})),
        ])),
        Ok(ModelReply::text("ok")),
    ]);
    let orch = orchestrator(yolo_config(&dir, hooks), transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "copy", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());
    assert_eq!(report.hook_failures, 0);

    let tools: Vec<_> = state
        .context
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tools[0].tool_status, Some(ToolStatus::Denied));
    assert!(tools[0].content.contains("blocked by hook: writes are frozen"));
    assert_eq!(tools[1].tool_status, Some(ToolStatus::Success));
    assert!(!dir.path().join("b.txt").exists());
}

#[tokio::test]
async fn test_after_tool_hook_sees_output() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let hooks = vec![
        HookConfig::command(
            "audit",
            HookTrigger::AfterTool,
            "echo \"$KEEL_TOOL_NAME:$KEEL_TOOL_OUTPUT\" >> audit.log",
        ),
        HookConfig::command(
            "greet",
            HookTrigger::AfterAgent,
            "echo \"$KEEL_AGENT_RESPONSE\" > last_response.txt",
        ),
    ];
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![call("r", "read_file", json!({"path": "a.txt"}))])),
        Ok(ModelReply::text("It says alpha")),
    ]);
    let orch = orchestrator(yolo_config(&dir, hooks), transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    orch.run_turn(&mut state, "read a", &CancellationToken::new())
        .await
        .unwrap();

    let audit = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
    assert_eq!(audit.trim(), "read_file:alpha");
    let response = std::fs::read_to_string(dir.path().join("last_response.txt")).unwrap();
    assert_eq!(response.trim(), "It says alpha");
}

#[tokio::test]
async fn test_failing_hooks_are_counted_not_fatal() {
    let dir = TempDir::new().unwrap();
    let hooks = vec![
        HookConfig::command("broken", HookTrigger::BeforeAgent, "exit 1"),
        // Exit 2 only vetoes before a tool call; here it is a plain failure.
        HookConfig::command("late-veto", HookTrigger::AfterAgent, "exit 2"),
    ];
    let transport = ScriptedTransport::new(vec![Ok(ModelReply::text("hi there"))]);
    let orch = orchestrator(yolo_config(&dir, hooks), transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "hello", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());
    assert_eq!(report.hook_failures, 2);
    assert_eq!(orch.metrics().snapshot().hook_failures, 2);
}

#[tokio::test]
async fn test_hooks_globally_disabled() {
    let dir = TempDir::new().unwrap();
    let mut config = yolo_config(
        &dir,
        vec![HookConfig::command("veto-all", HookTrigger::BeforeTool, "exit 2")],
    );
    config.hooks_enabled = false;
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![call("r", "read_file", json!({"path": "a.txt"}))])),
        Ok(ModelReply::text("done")),
    ]);
    let orch = orchestrator(config, transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    orch.run_turn(&mut state, "read", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(state.context.messages()[2].tool_status, Some(ToolStatus::Success));
}

#[tokio::test]
async fn test_auto_checkpoint_and_resume() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let config = AgentConfig {
        system_prompt: Some("You are terse.".to_string()),
        checkpoint: CheckpointConfig {
            auto: true,
            directory: checkpoint_dir.clone(),
        },
        ..yolo_config(&dir, Vec::new())
    };
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![call("r", "read_file", json!({"path": "a.txt"}))])),
        Ok(ModelReply::text("alpha")),
        Ok(ModelReply::text("still alpha")),
    ]);
    let orch = orchestrator(config, transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    orch.run_turn(&mut state, "read a", &CancellationToken::new())
        .await
        .unwrap();

    let store = CheckpointStore::new(&checkpoint_dir);
    let latest = store.latest_for(&state.session_id).await.unwrap().unwrap();
    assert_eq!(latest.turn, 1);
    assert_eq!(latest.message_count, state.context.len());

    let mut resumed = orch.resume(&store, &latest.checkpoint_id).await.unwrap();
    assert_eq!(resumed.session_id, state.session_id);
    assert_eq!(resumed.turn, state.turn);
    assert_eq!(resumed.token_usage, state.token_usage);
    assert_eq!(resumed.context.messages(), state.context.messages());
    assert_eq!(resumed.context.next_id(), state.context.next_id());

    // A resumed session keeps appending with fresh, ordered ids.
    orch.run_turn(&mut resumed, "again?", &CancellationToken::new())
        .await
        .unwrap();
    let history = resumed.context.messages();
    assert_eq!(history[0].role, Role::System);
    assert!(history.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(store.list().await.unwrap().len(), 2);
}
