use crate::tokens::TokenEstimator;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Opaque until the tool executes; schema checks happen at dispatch.
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn estimate_tokens(&self, estimator: &dyn TokenEstimator) -> usize {
        match self {
            Self::Text { text } => estimator.estimate(text),
            Self::ToolUse { name, input, .. } => {
                estimator.estimate(name) + estimator.estimate(&input.to_string())
            }
            Self::ToolResult { content, .. } => estimator.estimate(content),
        }
    }
}

/// One conversation message.
///
/// The token estimate is cached and only recomputed through the mutating methods, so
/// callers that need a fresh number after switching estimators call
/// [`Message::refresh_token_estimate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    content: Vec<ContentBlock>,
    #[serde(default)]
    token_estimate: usize,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>, estimator: &dyn TokenEstimator) -> Self {
        let mut message = Self {
            role,
            content,
            token_estimate: 0,
        };
        message.refresh_token_estimate(estimator);
        message
    }

    pub fn user_text(text: impl Into<String>, estimator: &dyn TokenEstimator) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)], estimator)
    }

    pub fn assistant_text(text: impl Into<String>, estimator: &dyn TokenEstimator) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)], estimator)
    }

    pub fn content(&self) -> &[ContentBlock] {
        &self.content
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    pub fn refresh_token_estimate(&mut self, estimator: &dyn TokenEstimator) {
        let total: usize = self
            .content
            .iter()
            .map(|b| b.estimate_tokens(estimator))
            .sum();
        self.token_estimate = total.max(1);
    }

    /// Replace one block in place and re-estimate. Out-of-range indices are ignored.
    pub fn replace_block(&mut self, index: usize, block: ContentBlock, estimator: &dyn TokenEstimator) {
        if let Some(slot) = self.content.get_mut(index) {
            *slot = block;
            self.refresh_token_estimate(estimator);
        }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// A user message carrying typed input, as opposed to a tool-result carrier.
    pub fn starts_turn(&self) -> bool {
        self.role == Role::User
            && self
                .content
                .iter()
                .all(|b| matches!(b, ContentBlock::Text { .. }))
    }

    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    /// Marks the end of a prefix the provider may cache.
    pub cacheable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a `ToolDefinition` after validating the name against provider constraints.
    pub fn validated(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> crate::error::Result<Self> {
        let name = name.into();
        crate::client::validate_tool_name(&name)?;
        Ok(Self {
            name,
            description: description.into(),
            parameters,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: Vec<SystemBlock>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(other.cache_read_input_tokens);
    }
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    pub stop_reason: String,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    pub fn has_tool_uses(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharRatioEstimator;
    use serde_json::json;

    #[test]
    fn message_estimate_sums_blocks() {
        let est = CharRatioEstimator::default();
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("a".repeat(40)),
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "shell".to_string(),
                    input: json!({}),
                },
            ],
            &est,
        );
        // 10 for text, 2 for the name, 1 for "{}".
        assert_eq!(msg.token_estimate(), 13);
    }

    #[test]
    fn replace_block_recomputes_estimate() {
        let est = CharRatioEstimator::default();
        let mut msg = Message::new(
            Role::Tool,
            vec![ContentBlock::tool_result("t1", "x".repeat(400), false)],
            &est,
        );
        assert_eq!(msg.token_estimate(), 100);
        msg.replace_block(0, ContentBlock::tool_result("t1", "short", false), &est);
        assert_eq!(msg.token_estimate(), 2);
    }

    #[test]
    fn tool_result_carrier_does_not_start_turn() {
        let est = CharRatioEstimator::default();
        let carrier = Message::new(
            Role::User,
            vec![ContentBlock::tool_result("t1", "ok", false)],
            &est,
        );
        assert!(!carrier.starts_turn());
        assert!(Message::user_text("hi", &est).starts_turn());
    }

    #[test]
    fn content_block_serde_is_tagged() {
        let block = ContentBlock::tool_result("t9", "done", true);
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["tool_use_id"], "t9");
        assert_eq!(v["is_error"], true);
    }
}
