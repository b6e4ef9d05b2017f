use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<pkm_llm::LlmError> for ContextError {
    fn from(e: pkm_llm::LlmError) -> Self {
        Self::Provider(e.to_string())
    }
}

impl From<rusqlite::Error> for ContextError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<std::io::Error> for ContextError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
