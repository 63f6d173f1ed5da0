//! Tools provided by external tool servers.
//!
//! Each discovered tool is registered as `<server>__<tool>` so that tools
//! from different servers never collide with each other or with built-ins.

use crate::registry::ToolRegistry;
use crate::traits::{ConfirmationDetails, Tool, ToolContext, ToolError, ToolKind, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

pub const NAMESPACE_SEPARATOR: &str = "__";

pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{}{}{}", server, NAMESPACE_SEPARATOR, tool)
}

/// Tool description as advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
    /// Servers may flag tools that never change anything.
    #[serde(default)]
    pub read_only: bool,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteCallResult {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Client side of the tool-server protocol. The wire transport lives elsewhere.
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<RemoteCallResult, ToolError>;
}

pub struct RemoteTool {
    server: Arc<dyn ToolServer>,
    spec: RemoteToolSpec,
    qualified: String,
}

impl RemoteTool {
    pub fn new(server: Arc<dyn ToolServer>, spec: RemoteToolSpec) -> Self {
        let qualified = qualified_name(server.name(), &spec.name);
        Self {
            server,
            spec,
            qualified,
        }
    }

    pub fn server_name(&self) -> &str {
        self.server.name()
    }

    pub fn remote_name(&self) -> &str {
        &self.spec.name
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.qualified
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn schema(&self) -> serde_json::Value {
        self.spec.input_schema.clone()
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Remote
    }

    fn is_mutating(&self, _params: &serde_json::Value) -> bool {
        !self.spec.read_only
    }

    fn confirmation(&self, params: &serde_json::Value) -> ConfirmationDetails {
        ConfirmationDetails {
            description: format!(
                "Call '{}' on tool server '{}' with {}",
                self.spec.name,
                self.server.name(),
                params
            ),
            affected_paths: Vec::new(),
        }
    }

    async fn invoke(
        &self,
        _ctx: &ToolContext,
        params: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let reply = self.server.call_tool(&self.spec.name, params).await?;
        let result = if reply.is_error {
            ToolResult::failure(reply.content)
        } else {
            ToolResult::success(reply.content)
        };
        Ok(result.with_metadata(serde_json::json!({ "server": self.server.name() })))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    pub registered: Vec<String>,
    /// (server, reason) for servers that could not be listed.
    pub failed: Vec<(String, String)>,
}

/// List every server's tools and register them namespaced. A server that
/// fails or does not answer within `startup_timeout` is skipped.
pub async fn discover_tools(
    registry: &mut ToolRegistry,
    servers: &[Arc<dyn ToolServer>],
    startup_timeout: Duration,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    for server in servers {
        let name = server.name().to_string();
        let specs = match timeout(startup_timeout, server.list_tools()).await {
            Ok(Ok(specs)) => specs,
            Ok(Err(e)) => {
                warn!("Tool server '{}' failed to list tools: {}", name, e);
                report.failed.push((name, e.to_string()));
                continue;
            }
            Err(_) => {
                warn!("Tool server '{}' did not answer within {:?}", name, startup_timeout);
                report.failed.push((name, "startup timeout".to_string()));
                continue;
            }
        };

        for spec in specs {
            let tool = RemoteTool::new(server.clone(), spec);
            let qualified = tool.name().to_string();
            registry.register(Arc::new(tool));
            report.registered.push(qualified);
        }
        info!("Registered tools from server '{}'", name);
    }

    report
}
