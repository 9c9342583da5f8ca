use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use splicing_types::{ToolResult, ToolSchema};

/// Pipeline scope a tool call runs against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub project_id: String,
    pub section_id: Option<String>,
    pub block_id: Option<String>,
}

impl ToolContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn with_section(mut self, section_id: Option<String>) -> Self {
        self.section_id = section_id;
        self
    }

    pub fn with_block(mut self, block_id: Option<String>) -> Self {
        self.block_id = block_id;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
    async fn execute_with_cancel(
        &self,
        args: Value,
        ctx: &ToolContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        tokio::select! {
            result = self.execute(args, ctx) => result,
            _ = cancel.cancelled() => anyhow::bail!("tool call cancelled"),
        }
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool` under its schema name, replacing any previous tool
    /// with that name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        tracing::debug!(tool = %name, "registered tool");
        self.tools.write().await.insert(name, tool);
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| tool.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolResult> {
        let Some(tool) = self.get(name).await else {
            return Ok(unknown_tool(name));
        };
        tool.execute(args, ctx).await
    }

    pub async fn execute_with_cancel(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let Some(tool) = self.get(name).await else {
            return Ok(unknown_tool(name));
        };
        tool.execute_with_cancel(args, ctx, cancel).await
    }

    async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }
}

fn unknown_tool(name: &str) -> ToolResult {
    ToolResult {
        output: format!("Unknown tool: {name}"),
        metadata: json!({"error": "unknown_tool"}),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Rejects schemas providers refuse: nameless tools, non-object roots and
/// arrays without `items`.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        let fail = |path: &str, reason: &str| ToolSchemaValidationError {
            tool_name: schema.name.clone(),
            path: path.to_string(),
            reason: reason.to_string(),
        };
        if schema.name.trim().is_empty() {
            return Err(fail("$", "tool name is empty"));
        }
        if schema.input_schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(fail("$", "root schema must be an object"));
        }
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(Value::as_str) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    for key in ["items", "additionalProperties"] {
        if let Some(child) = obj.get(key) {
            validate_schema_node(tool_name, &format!("{path}.{key}"), child)?;
        }
    }
    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for key in ["oneOf", "anyOf", "allOf"] {
        if let Some(variants) = obj.get(key).and_then(Value::as_array) {
            for (idx, child) in variants.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{key}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo".to_string(),
                description: "Echo the block id".to_string(),
                input_schema: json!({"type":"object","properties":{}}),
            }
        }

        async fn execute(&self, _args: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            Ok(ToolResult {
                output: ctx.block_id.clone().unwrap_or_default(),
                metadata: json!({}),
            })
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "slow".to_string(),
                description: "Never finishes in time".to_string(),
                input_schema: json!({"type":"object"}),
            }
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ToolResult {
                output: "late".to_string(),
                metadata: json!({}),
            })
        }
    }

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"packages":{"type":"array"}}
            }),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.packages"));
    }

    #[test]
    fn validator_rejects_non_object_root() {
        let schemas = vec![ToolSchema {
            name: "scalar".to_string(),
            description: String::new(),
            input_schema: json!({"type":"string"}),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected root failure");
        assert_eq!(err.path, "$");
    }

    #[tokio::test]
    async fn registry_dispatches_with_context() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        validate_tool_schemas(&registry.list().await).expect("valid schemas");

        let ctx = ToolContext::new("p1").with_block(Some("b1".to_string()));
        let result = registry
            .execute("echo", json!({}), &ctx)
            .await
            .expect("echo");
        assert_eq!(result.output, "b1");

        let unknown = registry
            .execute("missing", json!({}), &ctx)
            .await
            .expect("unknown tool is not an error");
        assert_eq!(unknown.output, "Unknown tool: missing");
    }

    #[tokio::test]
    async fn cancelled_tool_returns_error() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = registry
            .execute_with_cancel("slow", json!({}), &ToolContext::new("p1"), cancel)
            .await
            .expect_err("cancelled");
        assert!(err.to_string().contains("cancelled"));
    }
}
