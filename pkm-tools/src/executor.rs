use crate::audit::{AuditEntry, AuditSink, NullAuditSink};
use crate::validator::CommandValidationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

const COLLECTOR_GRACE: Duration = Duration::from_millis(500);
const READ_CHUNK_BYTES: usize = 8 * 1024;
const SCRIPT_PREAMBLE: &str = "#!/usr/bin/env bash\nset -euo pipefail\n\n";

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub command_timeout: Duration,
    pub script_timeout: Duration,
    /// Per stream.
    pub output_bytes_max: usize,
    pub keep_scripts: bool,
    /// Where script files are written. Defaults to the system temp dir.
    pub script_dir: Option<PathBuf>,
    pub audit_command_chars_max: usize,
    pub audit_stderr_chars_max: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            script_timeout: Duration::from_secs(300),
            output_bytes_max: 20_000,
            keep_scripts: false,
            script_dir: None,
            audit_command_chars_max: 2_000,
            audit_stderr_chars_max: 4_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Command,
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Error,
    Blocked,
    Timeout,
    Exception,
}

impl ExecutionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Blocked => "blocked",
            Self::Timeout => "timeout",
            Self::Exception => "exception",
        }
    }
}

/// Write-once description of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub kind: ExecutionKind,
    pub command: String,
    pub description: Option<String>,
    pub cwd: String,
    pub exit_code: Option<i32>,
    /// Bytes produced, including any beyond the capture cap.
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed_ms: u64,
    pub outcome: ExecutionOutcome,
    pub blocked_pattern: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub record: ExecutionRecord,
    pub stdout: String,
    pub stderr: String,
}

/// Runs already-validated commands and scripts under `bash`.
///
/// Each child gets its own process group so a timeout can kill everything it spawned.
pub struct SandboxedExecutor {
    policy: ExecutionPolicy,
    audit: Arc<dyn AuditSink>,
}

impl SandboxedExecutor {
    pub fn new(policy: ExecutionPolicy, audit: Arc<dyn AuditSink>) -> Self {
        Self { policy, audit }
    }

    pub fn without_audit(policy: ExecutionPolicy) -> Self {
        Self::new(policy, Arc::new(NullAuditSink))
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    #[tracing::instrument(level = "info", skip_all, fields(cwd = %cwd.display()))]
    pub async fn run(&self, command: &str, cwd: &Path, timeout: Option<Duration>) -> ExecutionOutput {
        let timeout = timeout.unwrap_or(self.policy.command_timeout);
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        let output = self
            .spawn_and_wait(ExecutionKind::Command, command, None, cmd, cwd, timeout)
            .await;
        self.audit(&output);
        output
    }

    #[tracing::instrument(level = "info", skip_all, fields(cwd = %cwd.display(), description = %description))]
    pub async fn run_script(
        &self,
        body: &str,
        description: &str,
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> ExecutionOutput {
        let timeout = timeout.unwrap_or(self.policy.script_timeout);
        let script_dir = self
            .policy
            .script_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let path = script_dir.join(format!("pkm-script-{}.sh", uuid::Uuid::new_v4().simple()));
        let contents = format!("{SCRIPT_PREAMBLE}{}\n", body.trim_end());

        let written = match tokio::fs::create_dir_all(&script_dir).await {
            Ok(()) => tokio::fs::write(&path, contents).await,
            Err(e) => Err(e),
        };
        let output = match written {
            Ok(()) => {
                let mut cmd = Command::new("bash");
                cmd.arg(&path);
                self.spawn_and_wait(
                    ExecutionKind::Script,
                    body,
                    Some(description),
                    cmd,
                    cwd,
                    timeout,
                )
                .await
            }
            Err(e) => self.exception(
                ExecutionKind::Script,
                body,
                Some(description),
                cwd,
                format!("write script file {}: {e}", path.display()),
            ),
        };

        if self.policy.keep_scripts {
            tracing::debug!(path = %path.display(), "script file kept");
        } else if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove script file");
            }
        }

        self.audit(&output);
        output
    }

    /// Record a command the validator refused. Nothing is spawned.
    pub fn reject(
        &self,
        kind: ExecutionKind,
        command: &str,
        description: Option<&str>,
        cwd: &Path,
        validation: &CommandValidationResult,
    ) -> ExecutionOutput {
        let pattern = validation.matched.as_ref().map(|m| m.name.clone());
        let output = ExecutionOutput {
            record: ExecutionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                command: command.to_string(),
                description: description.map(str::to_string),
                cwd: cwd.display().to_string(),
                exit_code: None,
                stdout_bytes: 0,
                stderr_bytes: 0,
                stdout_truncated: false,
                stderr_truncated: false,
                elapsed_ms: 0,
                outcome: ExecutionOutcome::Blocked,
                error: Some(format!(
                    "matched blocked pattern {}",
                    pattern.as_deref().unwrap_or("unknown")
                )),
                blocked_pattern: pattern,
                started_at: Utc::now(),
            },
            stdout: String::new(),
            stderr: String::new(),
        };
        self.audit(&output);
        output
    }

    async fn spawn_and_wait(
        &self,
        kind: ExecutionKind,
        text: &str,
        description: Option<&str>,
        mut cmd: Command,
        cwd: &Path,
        timeout: Duration,
    ) -> ExecutionOutput {
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let started_at = Utc::now();
        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return self.exception(kind, text, description, cwd, format!("spawn failed: {e}"));
            }
        };
        let pid = child.id();
        let mut group = GroupKillGuard::new(pid);

        let stdout_buf = Arc::new(Mutex::new(CappedBuffer::new(self.policy.output_bytes_max)));
        let stderr_buf = Arc::new(Mutex::new(CappedBuffer::new(self.policy.output_bytes_max)));
        let mut collectors: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            collectors.push(spawn_output_collector(out, stdout_buf.clone()));
        }
        if let Some(err) = child.stderr.take() {
            collectors.push(spawn_output_collector(err, stderr_buf.clone()));
        }

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        if waited.is_ok() {
            group.disarm();
        }
        let (outcome, exit_code, error) = match waited {
            Ok(Ok(status)) if status.success() => (ExecutionOutcome::Success, status.code(), None),
            Ok(Ok(status)) => (ExecutionOutcome::Error, status.code(), None),
            Ok(Err(e)) => (ExecutionOutcome::Exception, None, Some(format!("wait failed: {e}"))),
            Err(_) => {
                group.kill();
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid = ?pid, error = %e, "killing timed-out child failed");
                }
                (
                    ExecutionOutcome::Timeout,
                    None,
                    Some(format!("timed out after {}s", timeout.as_secs_f64())),
                )
            }
        };

        // Grandchildren may still hold the pipes open; give the readers a moment, then stop.
        for mut handle in collectors {
            if tokio::time::timeout(COLLECTOR_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        let (stdout, stdout_bytes, stdout_truncated) = take_buffer(&stdout_buf);
        let (stderr, stderr_bytes, stderr_truncated) = take_buffer(&stderr_buf);

        ExecutionOutput {
            record: ExecutionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                command: text.to_string(),
                description: description.map(str::to_string),
                cwd: cwd.display().to_string(),
                exit_code,
                stdout_bytes,
                stderr_bytes,
                stdout_truncated,
                stderr_truncated,
                elapsed_ms: started.elapsed().as_millis() as u64,
                outcome,
                blocked_pattern: None,
                error,
                started_at,
            },
            stdout,
            stderr,
        }
    }

    fn exception(
        &self,
        kind: ExecutionKind,
        text: &str,
        description: Option<&str>,
        cwd: &Path,
        error: String,
    ) -> ExecutionOutput {
        ExecutionOutput {
            record: ExecutionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                command: text.to_string(),
                description: description.map(str::to_string),
                cwd: cwd.display().to_string(),
                exit_code: None,
                stdout_bytes: 0,
                stderr_bytes: 0,
                stdout_truncated: false,
                stderr_truncated: false,
                elapsed_ms: 0,
                outcome: ExecutionOutcome::Exception,
                blocked_pattern: None,
                error: Some(error),
                started_at: Utc::now(),
            },
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn audit(&self, output: &ExecutionOutput) {
        let record = &output.record;
        let command = cap_chars(&record.command, self.policy.audit_command_chars_max);
        let failed = record.outcome != ExecutionOutcome::Success;
        let stderr = (failed && !output.stderr.is_empty())
            .then(|| cap_chars(&output.stderr, self.policy.audit_stderr_chars_max));

        if failed {
            tracing::warn!(
                target: "pkm_audit",
                id = %record.id,
                kind = ?record.kind,
                cwd = %record.cwd,
                command = %command,
                exit_code = ?record.exit_code,
                elapsed_ms = record.elapsed_ms,
                stdout_bytes = record.stdout_bytes,
                stderr_bytes = record.stderr_bytes,
                outcome = record.outcome.as_str(),
                blocked_pattern = ?record.blocked_pattern,
                error = ?record.error,
                stderr = stderr.as_deref().unwrap_or(""),
                "execution finished"
            );
        } else {
            tracing::info!(
                target: "pkm_audit",
                id = %record.id,
                kind = ?record.kind,
                cwd = %record.cwd,
                command = %command,
                exit_code = ?record.exit_code,
                elapsed_ms = record.elapsed_ms,
                stdout_bytes = record.stdout_bytes,
                stderr_bytes = record.stderr_bytes,
                outcome = record.outcome.as_str(),
                "execution finished"
            );
        }

        let entry = AuditEntry {
            record: ExecutionRecord {
                command,
                ..record.clone()
            },
            stderr,
        };
        if let Err(e) = self.audit.append(&entry) {
            tracing::error!(error = %e, id = %record.id, "failed to append audit entry");
        }
    }
}

struct CappedBuffer {
    bytes: Vec<u8>,
    total: usize,
    max: usize,
}

impl CappedBuffer {
    fn new(max: usize) -> Self {
        Self {
            bytes: Vec::new(),
            total: 0,
            max,
        }
    }

    /// Keeps the head of the stream; later bytes are only counted.
    fn push(&mut self, chunk: &[u8]) {
        self.total = self.total.saturating_add(chunk.len());
        let room = self.max.saturating_sub(self.bytes.len());
        if room > 0 {
            self.bytes
                .extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }
}

/// Kills the child's process group when dropped while armed, so a run abandoned by its
/// caller (for example on a turn deadline) does not leave the command running.
struct GroupKillGuard {
    pid: Option<u32>,
    armed: bool,
}

impl GroupKillGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn kill(&mut self) {
        if self.armed {
            kill_process_group(self.pid);
            self.armed = false;
        }
    }
}

impl Drop for GroupKillGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(pid = ?self.pid, "execution abandoned, killing process group");
            kill_process_group(self.pid);
        }
    }
}

fn spawn_output_collector<R>(mut reader: R, buffer: Arc<Mutex<CappedBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "reading command output failed, keeping what was read");
                    break;
                }
                Ok(n) => {
                    if let Ok(mut guard) = buffer.lock() {
                        guard.push(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn take_buffer(buffer: &Arc<Mutex<CappedBuffer>>) -> (String, usize, bool) {
    match buffer.lock() {
        Ok(guard) => (
            String::from_utf8_lossy(&guard.bytes).to_string(),
            guard.total,
            guard.total > guard.bytes.len(),
        ),
        Err(_) => (String::new(), 0, false),
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal. The child was spawned with process_group(0),
    // so its pid is the id of a group that contains nothing but its own descendants.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

pub(crate) fn cap_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}...[truncated]", &text[..cut]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::validator::CommandValidator;

    fn executor(policy: ExecutionPolicy) -> (SandboxedExecutor, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (SandboxedExecutor::new(policy, sink.clone()), sink)
    }

    #[tokio::test]
    async fn successful_command_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.org"), "* heading\n").unwrap();
        let (exec, sink) = executor(ExecutionPolicy::default());

        let out = exec.run("ls && echo done", dir.path(), None).await;
        assert_eq!(out.record.outcome, ExecutionOutcome::Success);
        assert_eq!(out.record.exit_code, Some(0));
        assert!(out.stdout.contains("a.org"));
        assert!(out.stdout.contains("done"));
        assert_eq!(out.record.stdout_bytes, out.stdout.len());

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.cwd, dir.path().display().to_string());
        assert!(entries[0].stderr.is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_is_error_outcome_with_stderr_audited() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, sink) = executor(ExecutionPolicy::default());

        let out = exec.run("echo broken >&2; exit 3", dir.path(), None).await;
        assert_eq!(out.record.outcome, ExecutionOutcome::Error);
        assert_eq!(out.record.exit_code, Some(3));
        assert!(out.stderr.contains("broken"));
        assert_eq!(sink.entries()[0].stderr.as_deref(), Some("broken\n"));
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _) = executor(ExecutionPolicy::default());

        let started = Instant::now();
        let out = exec
            .run(
                "echo started; sleep 30 & sleep 30",
                dir.path(),
                Some(Duration::from_millis(300)),
            )
            .await;
        assert_eq!(out.record.outcome, ExecutionOutcome::Timeout);
        assert_eq!(out.record.exit_code, None);
        assert!(out.stdout.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn abandoned_run_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _) = executor(ExecutionPolicy::default());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(300),
            exec.run("(sleep 1; touch late.txt) & sleep 1; touch also_late.txt", dir.path(), None),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!dir.path().join("late.txt").exists());
        assert!(!dir.path().join("also_late.txt").exists());
    }

    #[tokio::test]
    async fn output_is_capped_and_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _) = executor(ExecutionPolicy {
            output_bytes_max: 100,
            ..ExecutionPolicy::default()
        });

        let out = exec
            .run("head -c 5000 /dev/zero | tr '\\0' x", dir.path(), None)
            .await;
        assert_eq!(out.record.outcome, ExecutionOutcome::Success);
        assert_eq!(out.stdout.len(), 100);
        assert_eq!(out.record.stdout_bytes, 5000);
        assert!(out.record.stdout_truncated);
    }

    #[tokio::test]
    async fn missing_cwd_is_an_exception() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, _) = executor(ExecutionPolicy::default());
        let out = exec.run("true", &dir.path().join("nope"), None).await;
        assert_eq!(out.record.outcome, ExecutionOutcome::Exception);
        assert!(out.record.error.unwrap().contains("spawn failed"));
    }

    #[tokio::test]
    async fn scripts_run_strict_and_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = tempfile::tempdir().unwrap();
        let (exec, _) = executor(ExecutionPolicy {
            script_dir: Some(scripts.path().to_path_buf()),
            ..ExecutionPolicy::default()
        });

        let ok = exec
            .run_script("echo one\necho two", "two lines", dir.path(), None)
            .await;
        assert_eq!(ok.record.outcome, ExecutionOutcome::Success);
        assert_eq!(ok.stdout, "one\ntwo\n");
        assert_eq!(ok.record.description.as_deref(), Some("two lines"));

        let unset = exec
            .run_script("echo \"$UNDEFINED_THING\"\necho after", "unset var", dir.path(), None)
            .await;
        assert_eq!(unset.record.outcome, ExecutionOutcome::Error);
        assert!(!unset.stdout.contains("after"));

        let piped = exec
            .run_script("false | true\necho after", "pipefail", dir.path(), None)
            .await;
        assert_eq!(piped.record.outcome, ExecutionOutcome::Error);

        assert_eq!(std::fs::read_dir(scripts.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn kept_scripts_stay_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = tempfile::tempdir().unwrap();
        let (exec, _) = executor(ExecutionPolicy {
            script_dir: Some(scripts.path().to_path_buf()),
            keep_scripts: true,
            ..ExecutionPolicy::default()
        });
        exec.run_script("true", "noop", dir.path(), None).await;

        let kept: Vec<_> = std::fs::read_dir(scripts.path()).unwrap().collect();
        assert_eq!(kept.len(), 1);
        let path = kept[0].as_ref().unwrap().path();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("#!/usr/bin/env bash\nset -euo pipefail\n"));
    }

    #[tokio::test]
    async fn reject_records_blocked_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let (exec, sink) = executor(ExecutionPolicy::default());
        let validation = CommandValidator::new().unwrap().validate("rm -rf /");

        let out = exec.reject(ExecutionKind::Command, "rm -rf /", None, dir.path(), &validation);
        assert_eq!(out.record.outcome, ExecutionOutcome::Blocked);
        assert_eq!(out.record.blocked_pattern.as_deref(), Some("root_deletion"));
        assert_eq!(sink.entries()[0].record.outcome, ExecutionOutcome::Blocked);
    }

    #[test]
    fn cap_chars_respects_char_boundaries() {
        assert_eq!(cap_chars("héllo", 10), "héllo");
        assert_eq!(cap_chars("héllo", 2), "hé...[truncated]");
    }
}
