#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use keel_core::{AbortReason, AgentError, LoopState, ModelReply, TransportError};
use keel_interfaces::{AutoApprove, AutoDeny};
use keel_memory::{MessageDraft, Role, ToolStatus};
use keel_policy::ApprovalPolicy;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_read_file_turn_appends_four_messages() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "remember the milk").unwrap();

    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![call("c1", "read_file", json!({"path": "notes.txt"}))])),
        Ok(ModelReply::text("The note says to remember the milk.")),
    ]);
    let orch = orchestrator(test_config(dir.path()), transport.clone(), Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "What does notes.txt say?", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, LoopState::Done);
    assert_eq!(report.appended.len(), 4);
    assert_eq!(report.tool_rounds, 1);
    assert_eq!(report.final_text.as_deref(), Some("The note says to remember the milk."));

    let history = state.context.messages();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(history[1].tool_calls[0].id, "c1");
    assert_eq!(history[2].tool_result_ref.as_deref(), Some("c1"));
    assert_eq!(history[2].tool_status, Some(ToolStatus::Success));
    assert_eq!(history[2].content, "remember the milk");
    assert!(history.windows(2).all(|w| w[0].id < w[1].id));

    // The second request saw the tool result.
    let requests = transport.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].last().unwrap().role, Role::Tool);
    assert_eq!(state.turn, 1);
    assert!(state.token_usage.total() > 0);
}

#[tokio::test]
async fn test_results_follow_request_order() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![
            call("slow", "delay", json!({"label": "first", "ms": 120})),
            call("fast", "delay", json!({"label": "second", "ms": 1})),
            call("mid", "delay", json!({"label": "third", "ms": 40})),
        ])),
        Ok(ModelReply::text("done")),
    ]);
    let orch = orchestrator(test_config(dir.path()), transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "go", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());

    let results: Vec<(&str, &str)> = state
        .context
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| (m.tool_result_ref.as_deref().unwrap(), m.content.as_str()))
        .collect();
    assert_eq!(
        results,
        vec![("slow", "first"), ("fast", "second"), ("mid", "third")]
    );
}

#[tokio::test]
async fn test_iteration_cap_aborts_after_three_rounds() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::repeating(ModelReply::tool_calls(vec![call(
        "",
        "delay",
        json!({"label": "again", "ms": 0}),
    )]));
    let config = keel_core::AgentConfig {
        max_iterations: 3,
        loop_breaker: false,
        ..test_config(dir.path())
    };
    let orch = orchestrator(config, transport.clone(), Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "loop forever", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, LoopState::Aborted);
    assert_eq!(report.abort, Some(AbortReason::IterationLimit { limit: 3 }));
    assert_eq!(report.tool_rounds, 3);
    assert_eq!(transport.request_count(), 4);

    let last = state.context.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.tool_status, Some(ToolStatus::Cancelled));
    assert!(last.content.contains("iteration limit reached"));

    let executed = state
        .context
        .messages()
        .iter()
        .filter(|m| m.tool_status == Some(ToolStatus::Success))
        .count();
    assert_eq!(executed, 3);
    // Identical calls every round also trip loop detection.
    assert_eq!(report.loop_warnings.len(), 1);
}

#[tokio::test]
async fn test_cancellation_during_confirmation() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![Ok(ModelReply::tool_calls(vec![call(
        "w1",
        "write_file",
        json!({"path": "out.txt", "content": "data"}),
    )]))]);
    let entered = Arc::new(Notify::new());
    let config = keel_core::AgentConfig {
        policy: ApprovalPolicy::OnRequest,
        ..test_config(dir.path())
    };
    let orch = orchestrator(
        config,
        transport.clone(),
        Arc::new(StalledApproval {
            entered: entered.clone(),
        }),
    );
    let mut state = orch.new_session();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    let (report, _) = tokio::join!(orch.run_turn(&mut state, "write it", &cancel), async move {
        entered.notified().await;
        trigger.cancel();
    });
    let report = report.unwrap();

    assert_eq!(report.abort, Some(AbortReason::Cancelled));
    assert_eq!(transport.request_count(), 1);
    assert!(!dir.path().join("out.txt").exists());

    let history = state.context.messages();
    let tool_msg = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_msg.tool_result_ref.as_deref(), Some("w1"));
    assert_eq!(tool_msg.tool_status, Some(ToolStatus::Cancelled));
    assert!(history
        .iter()
        .all(|m| m.tool_status != Some(ToolStatus::Success)));
}

#[tokio::test]
async fn test_denial_leaves_siblings_untouched() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![
            call("w", "write_file", json!({"path": "b.txt", "content": "beta"})),
            call("r", "read_file", json!({"path": "a.txt"})),
        ])),
        Ok(ModelReply::text("Read a.txt; the write was declined.")),
    ]);
    let config = keel_core::AgentConfig {
        policy: ApprovalPolicy::OnRequest,
        ..test_config(dir.path())
    };
    let orch = orchestrator(config, transport, Arc::new(AutoDeny));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "copy a to b", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());

    let tools: Vec<_> = state
        .context
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tools[0].tool_status, Some(ToolStatus::Denied));
    assert!(tools[0].content.contains("denied"));
    assert_eq!(tools[1].tool_status, Some(ToolStatus::Success));
    assert_eq!(tools[1].content, "alpha");
    assert!(!dir.path().join("b.txt").exists());
    assert_eq!(orch.metrics().snapshot().approval_denials, 1);
}

#[tokio::test]
async fn test_confirmation_request_describes_call() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![call(
            "w",
            "write_file",
            json!({"path": "notes/today.md", "content": "hello"}),
        )])),
        Ok(ModelReply::text("written")),
    ]);
    let approvals = RecordingApproval::new(true);
    let config = keel_core::AgentConfig {
        policy: ApprovalPolicy::OnRequest,
        ..test_config(dir.path())
    };
    let orch = orchestrator(config, transport, approvals.clone());
    let mut state = orch.new_session();

    orch.run_turn(&mut state, "write notes", &CancellationToken::new())
        .await
        .unwrap();

    let seen = approvals.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].call_id, "w");
    assert_eq!(seen[0].description, "Write 5 bytes to notes/today.md");
    assert_eq!(seen[0].affected_paths, vec![dir.path().join("notes/today.md")]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes/today.md")).unwrap(),
        "hello"
    );
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Server("502 bad gateway".to_string())),
        Err(TransportError::RateLimited { retry_after: None }),
        Ok(ModelReply::text("hello")),
    ]);
    let orch = orchestrator(test_config(dir.path()), transport.clone(), Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "hi", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());
    assert_eq!(transport.request_count(), 3);

    let snap = orch.metrics().snapshot();
    assert_eq!(snap.model_requests, 1);
    assert_eq!(snap.model_retries, 2);
    assert_eq!(snap.model_failures, 0);
}

#[tokio::test]
async fn test_fatal_error_surfaces_immediately() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Auth("invalid api key".to_string())),
        Ok(ModelReply::text("unreachable")),
    ]);
    let orch = orchestrator(test_config(dir.path()), transport.clone(), Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let result = orch
        .run_turn(&mut state, "hi", &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(AgentError::Transport(TransportError::Auth(_)))));
    assert_eq!(transport.request_count(), 1);
    assert_eq!(state.context.len(), 1);
    assert_eq!(orch.metrics().snapshot().model_failures, 1);
}

#[tokio::test]
async fn test_exhausted_retries() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Timeout),
        Err(TransportError::Timeout),
        Err(TransportError::Timeout),
    ]);
    let orch = orchestrator(test_config(dir.path()), transport.clone(), Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let result = orch
        .run_turn(&mut state, "hi", &CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(AgentError::RetriesExhausted { attempts: 3, .. })
    ));
}

#[tokio::test]
async fn test_unknown_tool_becomes_error_result() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![call("x", "teleport", json!({}))])),
        Ok(ModelReply::text("I cannot do that")),
    ]);
    let orch = orchestrator(test_config(dir.path()), transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "teleport me", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());
    let tool_msg = &state.context.messages()[2];
    assert_eq!(tool_msg.tool_status, Some(ToolStatus::Error));
    assert!(tool_msg.content.contains("Tool not found: teleport"));
}

#[tokio::test]
async fn test_loop_breaker_note_follows_repeated_calls() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let read = || Ok(ModelReply::tool_calls(vec![call("", "read_file", json!({"path": "a.txt"}))]));
    let transport = ScriptedTransport::new(vec![read(), read(), read(), Ok(ModelReply::text("ok"))]);
    let orch = orchestrator(test_config(dir.path()), transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "read a", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());
    assert_eq!(report.loop_warnings.len(), 1);

    let notes: Vec<_> = state
        .context
        .messages()
        .iter()
        .filter(|m| m.role == Role::User && m.content.starts_with("Loop detected"))
        .collect();
    assert_eq!(notes.len(), 1);
    assert_eq!(orch.metrics().snapshot().loop_warnings, 1);
}

#[tokio::test]
async fn test_safety_gate_denies_blocked_tool() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![call(
            "w",
            "write_file",
            json!({"path": "x", "content": "y"}),
        )])),
        Ok(ModelReply::text("blocked")),
    ]);
    let mut config = test_config(dir.path());
    config.policy = ApprovalPolicy::Yolo;
    config.safety.denied_tools = vec!["write_file".to_string()];
    let orch = orchestrator(config, transport, Arc::new(AutoApprove));
    let mut state = orch.new_session();

    orch.run_turn(&mut state, "write", &CancellationToken::new())
        .await
        .unwrap();
    let tool_msg = &state.context.messages()[2];
    assert_eq!(tool_msg.tool_status, Some(ToolStatus::Denied));
    assert!(tool_msg.content.contains("denied by configuration"));
}

#[tokio::test]
async fn test_history_is_compressed_before_model_call() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![Ok(ModelReply::text("continuing"))]);
    let mut config = test_config(dir.path());
    config.system_prompt = Some("You are terse.".to_string());
    config.context.context_window = 400;
    config.context.compression_threshold = 0.5;
    config.context.preserve_recent = 2;
    let orch = orchestrator(config, transport.clone(), Arc::new(AutoApprove));
    let mut state = orch.new_session();
    for i in 0..12 {
        let text = format!("message {} {}", i, "lorem ipsum dolor sit amet ".repeat(3));
        let draft = if i % 2 == 0 {
            MessageDraft::user(text)
        } else {
            MessageDraft::assistant(text)
        };
        state.context.append(draft);
    }

    let report = orch
        .run_turn(&mut state, "and now?", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());
    assert_eq!(orch.metrics().snapshot().compactions, 1);

    let history = state.context.messages();
    assert_eq!(history[0].role, Role::System);
    assert_eq!(history[1].role, Role::Compressed);
    assert!(history[1].content.ends_with("messages about the task"));

    let sent = &transport.requests.lock().unwrap()[0];
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(sent.last().unwrap().content, "and now?");
}

#[tokio::test]
async fn test_on_failure_asks_after_a_failed_attempt() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Ok(ModelReply::tool_calls(vec![call(
            "w1",
            "write_file",
            json!({"path": "../outside.txt", "content": "x"}),
        )])),
        Ok(ModelReply::tool_calls(vec![call(
            "w2",
            "write_file",
            json!({"path": "inside.txt", "content": "x"}),
        )])),
        Ok(ModelReply::text("written inside the workspace")),
    ]);
    let approvals = RecordingApproval::new(true);
    let config = keel_core::AgentConfig {
        policy: ApprovalPolicy::OnFailure,
        ..test_config(dir.path())
    };
    let orch = orchestrator(config, transport, approvals.clone());
    let mut state = orch.new_session();

    let report = orch
        .run_turn(&mut state, "write a file", &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_done());

    let tools: Vec<_> = state
        .context
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tools[0].tool_status, Some(ToolStatus::Error));
    assert_eq!(tools[1].tool_status, Some(ToolStatus::Success));

    // Only the retry after the failure needed a yes.
    let seen = approvals.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].call_id, "w2");
    assert!(dir.path().join("inside.txt").exists());
}
