//! Conversation types shared by the context manager, the session store
//! and the orchestrator.

use serde::{Deserialize, Serialize};

/// Schema version written into checkpoints.
pub const SCHEMA_VERSION: u32 = 1;

/// Monotonic message id, unique within a session.
pub type MessageId = u64;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    /// Summary standing in for a compressed block of older messages.
    Compressed,
}

/// A tool call requested by the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// How a tool call ended.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Denied,
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_status: Option<ToolStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_summary(&self) -> bool {
        self.role == Role::Compressed
    }
}

/// A message that has not been appended yet and has no id.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_result_ref: Option<String>,
    pub tool_status: Option<ToolStatus>,
    pub metadata: Option<serde_json::Value>,
}

impl MessageDraft {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_result_ref: None,
            tool_status: None,
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        status: ToolStatus,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_result_ref: Some(call_id.into()),
            tool_status: Some(status),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub(crate) fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            role: self.role,
            content: self.content,
            tool_calls: self.tool_calls,
            tool_result_ref: self.tool_result_ref,
            tool_status: self.tool_status,
            metadata: self.metadata,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Compressed).unwrap(), "\"compressed\"");
        assert_eq!(serde_json::from_str::<Role>("\"tool\"").unwrap(), Role::Tool);
    }

    #[test]
    fn test_message_tolerates_missing_and_unknown_fields() {
        let message: Message = serde_json::from_value(json!({
            "id": 7,
            "role": "assistant",
            "added_in_a_later_version": true
        }))
        .unwrap();
        assert_eq!(message.id, 7);
        assert!(message.content.is_empty());
        assert!(message.tool_calls.is_empty());
        assert_eq!(message.timestamp, 0);
    }

    #[test]
    fn test_tool_result_draft() {
        let message = MessageDraft::tool_result("call_1", ToolStatus::Denied, "denied by user")
            .into_message(3);
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_result_ref.as_deref(), Some("call_1"));
        assert_eq!(message.tool_status, Some(ToolStatus::Denied));

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["tool_status"], "denied");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn test_token_usage() {
        let mut usage = TokenUsage::new(10, 5);
        usage.add(TokenUsage::new(1, 1));
        assert_eq!(usage.total(), 17);
    }
}
