use crate::client::{ModelProvider, build_http_client};
use crate::error::{LlmError, Result};
use crate::types::{
    ContentBlock, Message, ModelRequest, ModelResponse, Role, SystemBlock, ToolDefinition, Usage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            http: build_http_client(timeout),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }
}

#[async_trait]
impl ModelProvider for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let req = AnthropicRequest::new(&self.model, self.max_tokens, request);

        let response = self
            .http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited(format!(
                "anthropic status={status} body={body}"
            )));
        }
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "anthropic messages status={status} body={body}"
            )));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        let out = ModelResponse::from(parsed);
        tracing::debug!(
            input_tokens = out.usage.input_tokens,
            output_tokens = out.usage.output_tokens,
            cache_creation_input_tokens = out.usage.cache_creation_input_tokens,
            cache_read_input_tokens = out.usage.cache_read_input_tokens,
            stop_reason = %out.stop_reason,
            "anthropic response parsed"
        );
        Ok(out)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<AnthropicSystemBlock>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

impl AnthropicRequest {
    fn new(model: &str, max_tokens: u32, request: &ModelRequest) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            system: to_anthropic_system(&request.system),
            messages: to_anthropic_messages(&request.messages),
            tools: request.tools.iter().map(to_anthropic_tool).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicSystemBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Empty blocks are rejected by the API, so they are dropped here rather than by callers.
fn to_anthropic_system(blocks: &[SystemBlock]) -> Vec<AnthropicSystemBlock> {
    blocks
        .iter()
        .filter(|b| !b.text.trim().is_empty())
        .map(|b| AnthropicSystemBlock {
            kind: "text",
            text: b.text.clone(),
            cache_control: b.cacheable.then_some(CacheControl { kind: "ephemeral" }),
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn to_anthropic_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
    #[serde(other)]
    Unsupported,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn wire_role(role: Role) -> &'static str {
    match role {
        // Tool results travel in user-role messages.
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    }
}

fn to_anthropic_block(block: &ContentBlock) -> Option<AnthropicContentBlock> {
    match block {
        ContentBlock::Text { text } if text.trim().is_empty() => None,
        ContentBlock::Text { text } => Some(AnthropicContentBlock::Text { text: text.clone() }),
        ContentBlock::ToolUse { id, name, input } => Some(AnthropicContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: if input.is_object() {
                input.clone()
            } else {
                serde_json::json!({})
            },
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(AnthropicContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: content.clone(),
            is_error: *is_error,
        }),
    }
}

/// Consecutive messages that land on the same wire role are merged; the API requires
/// strict user/assistant alternation.
fn to_anthropic_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());
    for m in messages {
        let role = wire_role(m.role);
        let blocks: Vec<AnthropicContentBlock> =
            m.content().iter().filter_map(to_anthropic_block).collect();
        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => out.push(AnthropicMessage {
                role,
                content: blocks,
            }),
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl From<AnthropicResponse> for ModelResponse {
    fn from(v: AnthropicResponse) -> Self {
        let mut content = Vec::with_capacity(v.content.len());
        for block in v.content {
            match block {
                AnthropicContentBlock::Text { text } => content.push(ContentBlock::Text { text }),
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    content.push(ContentBlock::ToolUse { id, name, input })
                }
                AnthropicContentBlock::ToolResult { .. } | AnthropicContentBlock::Unsupported => {}
            }
        }
        ModelResponse {
            content,
            usage: Usage {
                input_tokens: v.usage.input_tokens,
                output_tokens: v.usage.output_tokens,
                cache_creation_input_tokens: v.usage.cache_creation_input_tokens.unwrap_or(0),
                cache_read_input_tokens: v.usage.cache_read_input_tokens.unwrap_or(0),
            },
            stop_reason: v.stop_reason.unwrap_or_default(),
        }
    }
}
