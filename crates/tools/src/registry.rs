use crate::traits::{Tool, ToolContext, ToolError, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Name-keyed tool table. Built once at startup, then shared read-only.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register under the tool's own name. Returns the tool it replaced, if any.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        self.register_as(name, tool)
    }

    pub fn register_as(&mut self, name: String, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            warn!("Tool '{}' was already registered, replacing it", name);
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas in function-calling format, sorted by name.
    pub fn schemas(&self) -> Vec<serde_json::Value> {
        self.list()
            .into_iter()
            .filter_map(|name| {
                let tool = self.tools.get(&name)?;
                Some(serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": tool.description(),
                        "parameters": tool.schema()
                    }
                }))
            })
            .collect()
    }

    /// Validate and run a tool in its own task under the context's timeout.
    pub async fn dispatch(
        &self,
        name: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        tool.validate(&params)?;

        debug!("Dispatching tool {} (call {})", name, ctx.call_id);
        execute_with_protection(tool, ctx.clone(), params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn execute_with_protection(
    tool: Arc<dyn Tool>,
    ctx: ToolContext,
    params: serde_json::Value,
) -> Result<ToolResult, ToolError> {
    let limit = ctx.timeout;
    let handle = tokio::spawn(async move { tool.invoke(&ctx, params).await });
    // Dropping the caller's future (cancellation) also stops the tool task.
    let _guard = AbortOnDrop(handle.abort_handle());

    match timeout(limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            if join_err.is_panic() {
                error!("Tool execution panicked");
                Err(ToolError::Panicked)
            } else {
                Err(ToolError::Execution("Tool task was cancelled".to_string()))
            }
        }
        Err(_) => {
            warn!("Tool execution timed out after {:?}", limit);
            Err(ToolError::Timeout(limit))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::traits::ToolKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo text back"
        }

        fn schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn invoke(
            &self,
            _ctx: &ToolContext,
            params: serde_json::Value,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::success(params["text"].as_str().unwrap_or_default()))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Sleeps"
        }

        fn schema(&self) -> serde_json::Value {
            json!({ "type": "object", "properties": {} })
        }

        fn kind(&self) -> ToolKind {
            ToolKind::Shell
        }

        async fn invoke(
            &self,
            _ctx: &ToolContext,
            _params: serde_json::Value,
        ) -> Result<ToolResult, ToolError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ToolResult::success("late"))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }

        fn description(&self) -> &str {
            "Panics"
        }

        fn schema(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }

        async fn invoke(
            &self,
            _ctx: &ToolContext,
            _params: serde_json::Value,
        ) -> Result<ToolResult, ToolError> {
            panic!("tool blew up");
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(SlowTool));
        registry.register(Arc::new(PanicTool));
        registry
    }

    #[test]
    fn test_register_and_list() {
        let mut registry = registry();
        assert_eq!(registry.list(), vec!["echo", "panic", "slow"]);
        assert!(registry.register(Arc::new(EchoTool)).is_some());
        assert_eq!(registry.len(), 3);

        let schemas = registry.schemas();
        assert_eq!(schemas[0]["function"]["name"], "echo");
        assert_eq!(schemas[0]["type"], "function");
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let ctx = ToolContext::new("s", "call_1");
        let result = registry()
            .dispatch("echo", json!({"text": "hi"}), &ctx)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hi");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_and_invalid() {
        let ctx = ToolContext::new("s", "call_1");
        let registry = registry();
        assert!(matches!(
            registry.dispatch("nope", json!({}), &ctx).await,
            Err(ToolError::NotFound(_))
        ));
        assert!(matches!(
            registry.dispatch("echo", json!({}), &ctx).await,
            Err(ToolError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_timeout() {
        let ctx = ToolContext::new("s", "call_1").with_timeout(Duration::from_millis(50));
        let err = registry().dispatch("slow", json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_dispatch_panic_is_isolated() {
        let ctx = ToolContext::new("s", "call_1");
        let err = registry().dispatch("panic", json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Panicked));
        let result = ToolResult::from(err);
        assert!(!result.success);
    }
}
