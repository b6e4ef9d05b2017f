//! Tools the agent can call against the notes directory.
//!
//! Shell access goes through [`CommandValidator`] and then [`SandboxedExecutor`]. The
//! validator is a blacklist and only a first filter; the real boundary is the working
//! directory confinement, the timeouts and whatever OS isolation the host process runs
//! under.

mod audit;
mod error;
mod executor;
mod files;
mod journal;
mod notes_search;
mod registry;
mod search;
mod shell;
mod traits;
mod validator;

pub use audit::{AuditEntry, AuditSink, JsonlAuditSink, MemoryAuditSink, NullAuditSink};
pub use error::{Result, ToolError};
pub use executor::{
    ExecutionKind, ExecutionOutcome, ExecutionOutput, ExecutionPolicy, ExecutionRecord,
    SandboxedExecutor,
};
pub use files::{ListFilesTool, ReadNoteTool};
pub use journal::{AddJournalNoteTool, DEFAULT_JOURNAL_PATH, insert_journal_note};
pub use notes_search::SearchNotesTool;
pub use registry::{DispatchResult, ToolRegistry};
pub use search::SemanticSearchTool;
pub use shell::{ExecuteScriptTool, ExecuteShellTool};
pub use traits::{Tool, ToolSpec, to_llm_tool_def};
pub use validator::{CommandValidationResult, CommandValidator, MatchedPattern};
