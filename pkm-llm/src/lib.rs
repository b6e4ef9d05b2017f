//! Model-facing conversation types and provider clients.
//!
//! Pure HTTP clients: nothing in here knows about sessions, retrieval or tools.

mod anthropic;
mod client;
mod embeddings;
mod error;
mod tokens;
mod types;

pub use anthropic::AnthropicClient;
pub use client::{ModelProvider, build_http_client, validate_tool_name};
pub use embeddings::{EmbeddingProvider, VoyageEmbeddings};
pub use error::{LlmError, Result};
pub use tokens::{CharRatioEstimator, TokenEstimator};
pub use types::{
    ContentBlock, Message, ModelRequest, ModelResponse, Role, SystemBlock, ToolDefinition, Usage,
};
