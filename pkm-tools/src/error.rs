use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("blocked: {0}")]
    Blocked(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl ToolError {
    /// Stable tag reported back to the model in error tool results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Blocked(_) => "blocked",
            Self::Timeout(_) => "timeout",
            Self::Provider(_) => "provider_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::ExecutionFailed(_) => "exception",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<pkm_context::ContextError> for ToolError {
    fn from(e: pkm_context::ContextError) -> Self {
        match e {
            pkm_context::ContextError::Provider(msg) => Self::Provider(msg),
            pkm_context::ContextError::InvalidInput(msg) => Self::InvalidArguments(msg),
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}
