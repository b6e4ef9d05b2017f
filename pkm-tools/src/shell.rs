use crate::error::{Result, ToolError};
use crate::executor::{
    ExecutionKind, ExecutionOutcome, ExecutionOutput, SandboxedExecutor, cap_chars,
};
use crate::traits::{Tool, ToolSpec, optional_string, require_string, resolve_under_root};
use crate::validator::CommandValidator;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TIMEOUT_EXCERPT_CHARS: usize = 2_000;

fn outcome_json(output: &ExecutionOutput, notes_root: &Path) -> serde_json::Value {
    let record = &output.record;
    let working_directory = Path::new(&record.cwd)
        .strip_prefix(notes_root)
        .map(|p| {
            if p.as_os_str().is_empty() {
                ".".to_string()
            } else {
                p.display().to_string()
            }
        })
        .unwrap_or_else(|_| record.cwd.clone());
    serde_json::json!({
        "outcome": record.outcome.as_str(),
        "exit_code": record.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
        "stdout_truncated": record.stdout_truncated,
        "stderr_truncated": record.stderr_truncated,
        "elapsed_ms": record.elapsed_ms,
        "working_directory": working_directory,
    })
}

/// Success and non-zero exits are returned as data; the model decides what to do with
/// a failing command. Everything else becomes a tool error.
fn into_tool_result(output: ExecutionOutput, notes_root: &Path) -> Result<serde_json::Value> {
    match output.record.outcome {
        ExecutionOutcome::Success | ExecutionOutcome::Error => {
            Ok(outcome_json(&output, notes_root))
        }
        ExecutionOutcome::Timeout => {
            let mut message = output
                .record
                .error
                .clone()
                .unwrap_or_else(|| "execution timed out".to_string());
            if !output.stdout.is_empty() {
                message.push_str("; partial stdout: ");
                message.push_str(&cap_chars(&output.stdout, TIMEOUT_EXCERPT_CHARS));
            }
            Err(ToolError::Timeout(message))
        }
        ExecutionOutcome::Blocked => Err(ToolError::Blocked(format!(
            "refused by blocked pattern {}",
            output.record.blocked_pattern.as_deref().unwrap_or("unknown")
        ))),
        ExecutionOutcome::Exception => Err(ToolError::ExecutionFailed(
            output
                .record
                .error
                .unwrap_or_else(|| "execution failed".to_string()),
        )),
    }
}

pub struct ExecuteShellTool {
    validator: Arc<CommandValidator>,
    executor: Arc<SandboxedExecutor>,
    notes_root: PathBuf,
}

impl ExecuteShellTool {
    pub fn new(
        validator: Arc<CommandValidator>,
        executor: Arc<SandboxedExecutor>,
        notes_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            validator,
            executor,
            notes_root: notes_root.into(),
        }
    }
}

#[async_trait]
impl Tool for ExecuteShellTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "execute_shell".to_string(),
            description: format!(
                "Run one shell command in the notes directory ({}). Useful tools: rg, fd, \
                 cat/head/tail, git, emacs --batch. Output is capped at {} bytes per stream and \
                 the command is killed after {}s.",
                self.notes_root.display(),
                self.executor.policy().output_bytes_max,
                self.executor.policy().command_timeout.as_secs()
            ),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "command": { "type": "string", "description": "Shell command to execute" },
                    "working_dir": {
                        "type": "string",
                        "description": "Directory relative to the notes root"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let command = require_string(&arguments, "command")?;
        if command.trim().is_empty() {
            return Err(ToolError::InvalidArguments(
                "command must not be empty".to_string(),
            ));
        }
        let requested_dir = optional_string(&arguments, "working_dir")?;
        let cwd = resolve_under_root(&self.notes_root, requested_dir.as_deref())?;

        let validation = self.validator.validate(&command);
        let output = if validation.allowed {
            self.executor.run(&command, &cwd, None).await
        } else {
            self.executor
                .reject(ExecutionKind::Command, &command, None, &cwd, &validation)
        };
        into_tool_result(output, &self.notes_root)
    }
}

pub struct ExecuteScriptTool {
    validator: Arc<CommandValidator>,
    executor: Arc<SandboxedExecutor>,
    notes_root: PathBuf,
}

impl ExecuteScriptTool {
    pub fn new(
        validator: Arc<CommandValidator>,
        executor: Arc<SandboxedExecutor>,
        notes_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            validator,
            executor,
            notes_root: notes_root.into(),
        }
    }
}

#[async_trait]
impl Tool for ExecuteScriptTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "execute_script".to_string(),
            description: format!(
                "Run a multi-line bash script in the notes directory. The script runs with \
                 `set -euo pipefail` and is killed after {}s. Prefer execute_shell for single \
                 commands.",
                self.executor.policy().script_timeout.as_secs()
            ),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "script": { "type": "string", "description": "Script body without shebang" },
                    "description": {
                        "type": "string",
                        "description": "One line saying what the script does"
                    },
                    "working_dir": {
                        "type": "string",
                        "description": "Directory relative to the notes root"
                    }
                },
                "required": ["script", "description"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let script = require_string(&arguments, "script")?;
        let description = require_string(&arguments, "description")?;
        if script.trim().is_empty() {
            return Err(ToolError::InvalidArguments(
                "script must not be empty".to_string(),
            ));
        }
        let requested_dir = optional_string(&arguments, "working_dir")?;
        let cwd = resolve_under_root(&self.notes_root, requested_dir.as_deref())?;

        let validation = self.validator.validate(&script);
        let output = if validation.allowed {
            self.executor
                .run_script(&script, &description, &cwd, None)
                .await
        } else {
            self.executor.reject(
                ExecutionKind::Script,
                &script,
                Some(&description),
                &cwd,
                &validation,
            )
        };
        into_tool_result(output, &self.notes_root)
    }
}
