use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolSpec, optional_string, optional_u64, require_string, resolve_under_root};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub(crate) const NOTE_EXTENSIONS: &[&str] = &["org", "md"];
/// Upper bound on files visited by one walk, so a huge tree cannot stall a turn.
const WALK_FILES_MAX: usize = 20_000;
const LIST_DEFAULT: usize = 100;
const LIST_MAX: usize = 500;
const READ_LINES_DEFAULT: usize = 200;
const READ_LINES_MAX: usize = 2_000;

#[derive(Debug, Clone)]
pub(crate) struct NoteFile {
    pub path: PathBuf,
    pub rel_path: String,
    pub bytes: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Default)]
pub(crate) struct NoteWalk {
    pub files: Vec<NoteFile>,
    /// The walk stopped at `WALK_FILES_MAX`.
    pub truncated: bool,
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|want| want.eq_ignore_ascii_case(e)))
}

/// Collects regular files below `start`, skipping dotfiles and dot-directories such as
/// `.git`. Blocking; call from `spawn_blocking`. Results are sorted by relative path.
pub(crate) fn walk_notes(root: &Path, start: &Path, extensions: &[&str]) -> Result<NoteWalk> {
    let meta = std::fs::metadata(start)
        .map_err(|e| ToolError::InvalidArguments(format!("cannot open {}: {e}", start.display())))?;
    if !meta.is_dir() {
        return Err(ToolError::InvalidArguments(format!(
            "{} is not a directory",
            start.display()
        )));
    }

    let mut walk = NoteWalk::default();
    let mut pending = vec![start.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if is_hidden(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(path);
            } else if meta.is_file() && has_extension(&path, extensions) {
                if walk.files.len() >= WALK_FILES_MAX {
                    walk.truncated = true;
                    pending.clear();
                    break;
                }
                let rel_path = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                walk.files.push(NoteFile {
                    path,
                    rel_path,
                    bytes: meta.len(),
                    modified: meta.modified().ok(),
                });
            }
        }
    }
    walk.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(walk)
}

fn format_modified(modified: Option<SystemTime>) -> Option<String> {
    modified.map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
}

/// Lists note files with size and modification time, newest first by default.
pub struct ListFilesTool {
    notes_root: PathBuf,
}

impl ListFilesTool {
    pub fn new(notes_root: impl Into<PathBuf>) -> Self {
        Self {
            notes_root: notes_root.into(),
        }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_files".to_string(),
            description: format!(
                "List note files (.org and .md by default) under the notes directory with their \
                 size and last modification time. Sorted newest first unless sort is \"name\". \
                 At most {LIST_MAX} entries."
            ),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "directory": {
                        "type": "string",
                        "description": "Subdirectory relative to the notes root"
                    },
                    "extensions": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "File extensions without the dot; empty for all files"
                    },
                    "sort": { "type": "string", "enum": ["modified", "name"] },
                    "limit": { "type": "integer", "minimum": 1 }
                }
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let directory = optional_string(&arguments, "directory")?;
        let start = resolve_under_root(&self.notes_root, directory.as_deref())?;
        let extensions: Vec<String> = match arguments.get("extensions") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim_start_matches('.').to_string())
                .collect(),
            _ => NOTE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        };
        let by_name = optional_string(&arguments, "sort")?.as_deref() == Some("name");
        let limit = optional_u64(&arguments, "limit")?
            .map(|n| n as usize)
            .unwrap_or(LIST_DEFAULT)
            .clamp(1, LIST_MAX);

        let root = self.notes_root.clone();
        let walk = tokio::task::spawn_blocking(move || {
            let wanted: Vec<&str> = extensions.iter().map(String::as_str).collect();
            walk_notes(&root, &start, &wanted)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("file walk failed: {e}")))??;

        let mut files = walk.files;
        if !by_name {
            files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.rel_path.cmp(&b.rel_path)));
        }
        let total = files.len();
        let listed: Vec<serde_json::Value> = files
            .iter()
            .take(limit)
            .map(|f| {
                serde_json::json!({
                    "path": f.rel_path,
                    "bytes": f.bytes,
                    "modified": format_modified(f.modified),
                })
            })
            .collect();
        Ok(serde_json::json!({
            "files": listed,
            "total": total,
            "truncated": walk.truncated || total > limit,
        }))
    }
}

#[derive(Debug)]
struct LineRange {
    lines: Vec<String>,
    total_lines: usize,
    truncated_bytes: bool,
}

/// Reads lines `[start, start + count)` (zero-based) and counts the rest. Blocking.
fn read_line_range(path: &Path, start: usize, count: usize, bytes_max: usize) -> Result<LineRange> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut range = LineRange {
        lines: Vec::new(),
        total_lines: 0,
        truncated_bytes: false,
    };
    let mut bytes = 0usize;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let index = range.total_lines;
        range.total_lines += 1;
        if index < start || index >= start.saturating_add(count) || range.truncated_bytes {
            continue;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if bytes + line.len() > bytes_max {
            range.truncated_bytes = true;
            continue;
        }
        bytes += line.len() + 1;
        range.lines.push(line.to_string());
    }
    Ok(range)
}

/// Reads a line range of one note, so large files can be paged through.
pub struct ReadNoteTool {
    notes_root: PathBuf,
    bytes_max: usize,
}

impl ReadNoteTool {
    pub fn new(notes_root: impl Into<PathBuf>, bytes_max: usize) -> Self {
        Self {
            notes_root: notes_root.into(),
            bytes_max,
        }
    }
}

#[async_trait]
impl Tool for ReadNoteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_note".to_string(),
            description: format!(
                "Read lines of a note file. Lines are numbered from 1; by default \
                 {READ_LINES_DEFAULT} lines from start_line are returned (max {READ_LINES_MAX}). \
                 Use the returned total_lines to page through long files."
            ),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string", "description": "File path relative to the notes root" },
                    "start_line": { "type": "integer", "minimum": 1 },
                    "max_lines": { "type": "integer", "minimum": 1 }
                },
                "required": ["path"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let requested = require_string(&arguments, "path")?;
        let path = resolve_under_root(&self.notes_root, Some(&requested))?;
        let start_line = optional_u64(&arguments, "start_line")?.unwrap_or(1).max(1) as usize;
        let max_lines = optional_u64(&arguments, "max_lines")?
            .map(|n| n as usize)
            .unwrap_or(READ_LINES_DEFAULT)
            .clamp(1, READ_LINES_MAX);

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ToolError::InvalidArguments(format!("cannot open {requested}: {e}")))?;
        if !meta.is_file() {
            return Err(ToolError::InvalidArguments(format!("{requested} is not a file")));
        }

        let bytes_max = self.bytes_max;
        let range = tokio::task::spawn_blocking(move || {
            read_line_range(&path, start_line - 1, max_lines, bytes_max)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("read failed: {e}")))??;

        Ok(serde_json::json!({
            "path": requested,
            "start_line": start_line,
            "end_line": start_line - 1 + range.lines.len(),
            "total_lines": range.total_lines,
            "content": range.lines.join("\n"),
            "truncated": range.truncated_bytes,
        }))
    }
}
