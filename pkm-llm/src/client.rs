use crate::error::{LlmError, Result};
use crate::types::{ModelRequest, ModelResponse};
use async_trait::async_trait;
use std::time::Duration;

/// A chat model that accepts system blocks, conversation and tool schemas.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
}

/// Tool names must match `^[a-zA-Z0-9_-]{1,64}$`.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(LlmError::InvalidInput(format!(
            "tool name must be 1-64 characters, got {} ({name:?})",
            name.len()
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_follow_provider_rules() {
        validate_tool_name("execute_shell").expect("plain name is valid");
        validate_tool_name("semantic-search2").expect("dash and digits are valid");
        assert!(validate_tool_name("").is_err());
        assert!(validate_tool_name("shell.execute").is_err());
        assert!(validate_tool_name(&"x".repeat(65)).is_err());
    }
}
