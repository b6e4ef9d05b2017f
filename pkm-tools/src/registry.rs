use crate::error::{Result, ToolError};
use crate::traits::{Tool, to_llm_tool_def};
use jsonschema::JSONSchema;
use pkm_llm::{ContentBlock, ToolDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct DispatchResult {
    /// Always a `ToolResult` block answering the call id.
    pub block: ContentBlock,
    pub is_error: bool,
    pub error_kind: Option<&'static str>,
    pub latency_ms: u64,
}

/// Argument problems reported back to the model per failed call.
const SCHEMA_ERRORS_MAX: usize = 5;

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: JSONSchema,
}

/// Name-keyed tool table. Iteration order is by name so the tool list sent to the model
/// is byte-stable between requests.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool, compiling its parameter schema once so dispatch only validates.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let spec = tool.spec();
        let name = spec.name;
        pkm_llm::validate_tool_name(&name)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        if self.tools.contains_key(&name) {
            return Err(ToolError::InvalidArguments(format!(
                "tool {name} is already registered"
            )));
        }
        let schema = JSONSchema::compile(&spec.parameters_schema).map_err(|e| {
            ToolError::InvalidArguments(format!("tool {name} has an invalid parameter schema: {e}"))
        })?;
        self.tools.insert(name, RegisteredTool { tool, schema });
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| to_llm_tool_def(t.tool.as_ref()))
            .collect()
    }

    /// Runs one tool call. Never fails: unknown tools, malformed arguments and tool
    /// errors all come back as error results so the model can correct itself.
    #[tracing::instrument(level = "info", skip_all, fields(tool = %name, tool_call_id = %call_id))]
    pub async fn dispatch(
        &self,
        call_id: &str,
        name: &str,
        arguments: &serde_json::Value,
    ) -> DispatchResult {
        let started = Instant::now();
        let result = self.run(name, arguments).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                let content = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                tracing::info!(latency_ms, result_bytes = content.len(), "tool call finished");
                DispatchResult {
                    block: ContentBlock::tool_result(call_id, content, false),
                    is_error: false,
                    error_kind: None,
                    latency_ms,
                }
            }
            Err(e) => {
                let kind = e.kind();
                tracing::warn!(latency_ms, error_kind = kind, error = %e, "tool call failed");
                let content = serde_json::json!({
                    "outcome": kind,
                    "error": e.to_string(),
                })
                .to_string();
                DispatchResult {
                    block: ContentBlock::tool_result(call_id, content, true),
                    is_error: true,
                    error_kind: Some(kind),
                    latency_ms,
                }
            }
        }
    }

    async fn run(&self, name: &str, arguments: &serde_json::Value) -> Result<serde_json::Value> {
        let Some(entry) = self.tools.get(name) else {
            return Err(ToolError::InvalidArguments(format!(
                "unknown tool {name}; available: {}",
                self.names().join(", ")
            )));
        };
        let arguments = drop_null_fields(arguments);
        if let Err(errors) = entry.schema.validate(&arguments) {
            let problems: Vec<String> = errors.take(SCHEMA_ERRORS_MAX).map(|e| e.to_string()).collect();
            return Err(ToolError::InvalidArguments(format!(
                "{name}: {}",
                problems.join("; ")
            )));
        }
        entry.tool.execute(arguments).await
    }
}

/// Models often send `null` for optional fields they mean to leave out.
fn drop_null_fields(arguments: &serde_json::Value) -> serde_json::Value {
    match arguments {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
