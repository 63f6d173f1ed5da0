use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool timed out after {0:?}")]
    Timeout(Duration),
    #[error("Tool panicked")]
    Panicked,
    #[error("Tool server error: {0}")]
    Server(String),
}

/// Broad capability class of a tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Read,
    Edit,
    Shell,
    Network,
    Memory,
    Remote,
}

impl ToolKind {
    pub fn is_mutating(&self) -> bool {
        !matches!(self, ToolKind::Read)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the tool changed state outside the conversation.
    #[serde(default)]
    pub mutated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub truncated: bool,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }

    pub fn mutated(mut self) -> Self {
        self.mutated = true;
        self
    }

    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    /// Text the model sees for this result.
    pub fn to_model_output(&self) -> String {
        if self.success {
            return self.output.clone();
        }
        let error = self.error.as_deref().unwrap_or("unknown error");
        if self.output.is_empty() {
            format!("Error: {}", error)
        } else {
            format!("Error: {}\n\nOutput:\n{}", error, self.output)
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::failure(err.to_string())
    }
}

/// Per-invocation execution context.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub call_id: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            call_id: call_id.into(),
            working_dir: PathBuf::from("."),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What a tool tells the user when it needs approval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfirmationDetails {
    pub description: String,
    pub affected_paths: Vec<PathBuf>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> serde_json::Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    fn is_mutating(&self, _params: &serde_json::Value) -> bool {
        self.kind().is_mutating()
    }

    fn is_dangerous(&self, _params: &serde_json::Value) -> bool {
        false
    }

    fn confirmation(&self, params: &serde_json::Value) -> ConfirmationDetails {
        ConfirmationDetails {
            description: format!("Run {} with {}", self.name(), params),
            affected_paths: Vec::new(),
        }
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), ToolError> {
        validate_against_schema(&self.schema(), params)
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: serde_json::Value,
    ) -> Result<ToolResult, ToolError>;
}

/// Shallow JSON-schema check: object shape, required keys and primitive types.
pub fn validate_against_schema(
    schema: &serde_json::Value,
    params: &serde_json::Value,
) -> Result<(), ToolError> {
    let Some(obj) = params.as_object() else {
        return Err(ToolError::Validation("Parameters must be a JSON object".to_string()));
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(ToolError::Validation(format!("Missing '{}' field", key)));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };

    for (key, value) in obj {
        let Some(expected) = properties
            .get(key)
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str())
        else {
            continue;
        };
        let matches = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !matches {
            return Err(ToolError::Validation(format!(
                "Field '{}' must be of type {}",
                key, expected
            )));
        }
    }

    Ok(())
}
