use crate::traits::{ConfirmationDetails, Tool, ToolContext, ToolError, ToolKind, ToolResult};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Component, Path, PathBuf};

const MAX_READ_BYTES: usize = 256 * 1024;

/// Resolve `path` under `root`, rejecting anything that escapes it.
fn resolve(root: &Path, path: &str) -> Result<PathBuf, ToolError> {
    let requested = Path::new(path);
    let relative = if requested.is_absolute() {
        requested
            .strip_prefix(root)
            .map_err(|_| ToolError::PermissionDenied("Path outside workspace".to_string()))?
    } else {
        requested
    };

    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ToolError::PermissionDenied(
                    "Path outside workspace".to_string(),
                ))
            }
        }
    }
    Ok(resolved)
}

fn path_arg(params: &serde_json::Value) -> Result<&str, ToolError> {
    params["path"]
        .as_str()
        .ok_or_else(|| ToolError::Validation("Missing 'path' field".to_string()))
}

pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to file (relative to workspace)"
                }
            },
            "required": ["path"]
        })
    }

    async fn invoke(
        &self,
        _ctx: &ToolContext,
        params: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let full_path = resolve(&self.root, path_arg(&params)?)?;

        let bytes = tokio::fs::read(&full_path)
            .await
            .map_err(|e| ToolError::Execution(format!("{}: {}", full_path.display(), e)))?;

        let truncated = bytes.len() > MAX_READ_BYTES;
        let content = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_READ_BYTES)]).to_string();

        let result = ToolResult::success(content).with_metadata(json!({ "bytes": bytes.len() }));
        Ok(if truncated { result.truncated() } else { result })
    }
}

pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating parent directories"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to file (relative to workspace)"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    fn confirmation(&self, params: &serde_json::Value) -> ConfirmationDetails {
        let path = params["path"].as_str().unwrap_or_default();
        let bytes = params["content"].as_str().map(str::len).unwrap_or(0);
        ConfirmationDetails {
            description: format!("Write {} bytes to {}", bytes, path),
            affected_paths: resolve(&self.root, path).into_iter().collect(),
        }
    }

    async fn invoke(
        &self,
        _ctx: &ToolContext,
        params: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let path = path_arg(&params)?;
        let content = params["content"]
            .as_str()
            .ok_or_else(|| ToolError::Validation("Missing 'content' field".to_string()))?;

        let full_path = resolve(&self.root, path)?;
        let existed = tokio::fs::try_exists(&full_path).await.unwrap_or(false);

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;
        }
        tokio::fs::write(&full_path, content)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let verb = if existed { "Updated" } else { "Created" };
        Ok(ToolResult::success(format!("{} {} ({} bytes)", verb, path, content.len()))
            .with_metadata(json!({ "path": path, "bytes_written": content.len(), "created": !existed }))
            .mutated())
    }
}

pub struct ListDirTool {
    root: PathBuf,
}

impl ListDirTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List entries of a workspace directory"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path (relative to workspace, default: root)",
                    "default": "."
                }
            }
        })
    }

    async fn invoke(
        &self,
        _ctx: &ToolContext,
        params: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let path = params["path"].as_str().unwrap_or(".");
        let full_path = resolve(&self.root, path)?;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&full_path)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();

        Ok(ToolResult::success(entries.join("\n")))
    }
}
