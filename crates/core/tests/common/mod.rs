#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use keel_core::{AgentConfig, ModelReply, ModelTransport, Orchestrator, RetryConfig, TransportError};
use keel_interfaces::ApprovalHandler;
use keel_memory::{Message, Summarizer, SummaryError, ToolCallRequest};
use keel_policy::ConfirmationRequest;
use keel_tools::{ReadFileTool, Tool, ToolContext, ToolError, ToolRegistry, ToolResult, WriteFileTool};
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Replays canned replies in order and records every request.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<ModelReply, TransportError>>>,
    fallback: Option<ModelReply>,
    pub requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<ModelReply, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Returns `reply` forever once the script runs out.
    pub fn repeating(reply: ModelReply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(reply),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[serde_json::Value],
    ) -> Result<ModelReply, TransportError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| TransportError::Other("script exhausted".to_string())),
        }
    }
}

pub struct StaticSummarizer;

#[async_trait]
impl Summarizer for StaticSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummaryError> {
        Ok(format!("{} messages about the task", messages.len()))
    }
}

/// Never returns a summary.
pub struct HangingSummarizer;

#[async_trait]
impl Summarizer for HangingSummarizer {
    async fn summarize(&self, _messages: &[Message]) -> Result<String, SummaryError> {
        std::future::pending::<()>().await;
        Ok(String::new())
    }
}

/// Signals when a request arrives, then never answers.
pub struct StalledTransport {
    pub entered: Arc<Notify>,
}

#[async_trait]
impl ModelTransport for StalledTransport {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: &[serde_json::Value],
    ) -> Result<ModelReply, TransportError> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Err(TransportError::Timeout)
    }
}

/// Sleeps `ms` milliseconds, then creates `path` under its root.
pub struct SlowTouchTool {
    pub root: PathBuf,
    pub started: Arc<Notify>,
}

#[async_trait]
impl Tool for SlowTouchTool {
    fn name(&self) -> &str {
        "slow_touch"
    }

    fn description(&self) -> &str {
        "Wait, then create a marker file"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "ms": {"type": "integer"}
            },
            "required": ["path", "ms"]
        })
    }

    async fn invoke(
        &self,
        _ctx: &ToolContext,
        params: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        self.started.notify_one();
        let ms = params["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let path = self.root.join(params["path"].as_str().unwrap_or("marker"));
        tokio::fs::write(&path, "done")
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(ToolResult::success("touched"))
    }
}

/// Echoes `label` after sleeping `ms` milliseconds.
pub struct DelayTool;

#[async_trait]
impl Tool for DelayTool {
    fn name(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Sleep, then echo the label"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "label": {"type": "string"},
                "ms": {"type": "integer"}
            },
            "required": ["label", "ms"]
        })
    }

    async fn invoke(
        &self,
        _ctx: &ToolContext,
        params: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let ms = params["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ToolResult::success(params["label"].as_str().unwrap_or_default()))
    }
}

/// Signals when a confirmation arrives, then never answers.
pub struct StalledApproval {
    pub entered: Arc<Notify>,
}

#[async_trait]
impl ApprovalHandler for StalledApproval {
    async fn confirm(&self, _request: &ConfirmationRequest) -> bool {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        true
    }
}

/// Records every request it is asked about and answers with `answer`.
pub struct RecordingApproval {
    pub answer: bool,
    pub seen: Mutex<Vec<ConfirmationRequest>>,
}

impl RecordingApproval {
    pub fn new(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            answer,
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ApprovalHandler for RecordingApproval {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        self.seen.lock().unwrap().push(request.clone());
        self.answer
    }
}

pub fn workspace_registry(root: &Path) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool::new(root)));
    registry.register(Arc::new(WriteFileTool::new(root)));
    registry.register(Arc::new(DelayTool));
    Arc::new(registry)
}

pub fn test_config(root: &Path) -> AgentConfig {
    AgentConfig {
        working_dir: root.to_path_buf(),
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        },
        ..AgentConfig::default()
    }
}

pub fn orchestrator(
    config: AgentConfig,
    transport: Arc<ScriptedTransport>,
    approvals: Arc<dyn ApprovalHandler>,
) -> Orchestrator {
    let registry = workspace_registry(&config.working_dir);
    Orchestrator::new(config, transport, registry, approvals)
        .unwrap()
        .with_summarizer(Arc::new(StaticSummarizer))
}

pub fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest::new(id, name, args)
}
