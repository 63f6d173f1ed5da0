//! Boundary to the language model.
//!
//! The wire protocol lives outside this crate; the orchestrator only sees
//! [`ModelTransport`] and the tagged [`ModelOutput`] it returns.

use async_trait::async_trait;
use keel_memory::{
    format_transcript, Message, Role, Summarizer, SummaryError, TokenUsage, ToolCallRequest,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const COMPRESSION_PROMPT: &str = "You are compressing an agent conversation. \
Summarize the transcript below so the agent can continue the task without it. \
Keep user goals, decisions made, files touched, commands run with their outcomes, \
and any unresolved errors. Omit pleasantries. Answer with the summary only.";

#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Text(String),
    ToolCalls {
        /// Commentary emitted alongside the calls, possibly empty.
        text: String,
        calls: Vec<ToolCallRequest>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub output: ModelOutput,
    pub usage: Option<TokenUsage>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            output: ModelOutput::Text(content.into()),
            usage: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            output: ModelOutput::ToolCalls {
                text: String::new(),
                calls,
            },
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Model request timed out")]
    Timeout,
    #[error("Rate limited by model provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Model server error: {0}")]
    Server(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Invalid model request: {0}")]
    InvalidRequest(String),
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout | TransportError::RateLimited { .. } | TransportError::Server(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Send the history and the available tool schemas, get one reply.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[serde_json::Value],
    ) -> Result<ModelReply, TransportError>;
}

/// Summarizer backed by a plain model call without tools.
pub struct TransportSummarizer {
    transport: Arc<dyn ModelTransport>,
}

impl TransportSummarizer {
    pub fn new(transport: Arc<dyn ModelTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Summarizer for TransportSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummaryError> {
        let request = [
            side_message(0, Role::System, COMPRESSION_PROMPT.to_string()),
            side_message(1, Role::User, format_transcript(messages)),
        ];

        let reply = self
            .transport
            .complete(&request, &[])
            .await
            .map_err(|e| SummaryError::Failed(e.to_string()))?;

        let text = match reply.output {
            ModelOutput::Text(text) => text,
            ModelOutput::ToolCalls { text, .. } if !text.trim().is_empty() => text,
            ModelOutput::ToolCalls { .. } => {
                return Err(SummaryError::Failed(
                    "model requested tools instead of summarizing".to_string(),
                ))
            }
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(SummaryError::Empty);
        }
        Ok(text.to_string())
    }
}

fn side_message(id: u64, role: Role, content: String) -> Message {
    Message {
        id,
        role,
        content,
        tool_calls: Vec::new(),
        tool_result_ref: None,
        tool_status: None,
        metadata: None,
        timestamp: 0,
    }
}
