use crate::error::{Result, ToolError};
use crate::executor::cap_chars;
use crate::files::{NoteFile, walk_notes};
use crate::traits::{Tool, ToolSpec, optional_string, optional_u64, require_string, resolve_under_root};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::path::PathBuf;

const CONTEXT_DEFAULT: usize = 3;
const CONTEXT_MAX: usize = 20;
const RESULTS_DEFAULT: usize = 50;
const RESULTS_MAX: usize = 500;
/// Files larger than this are skipped; notes are text and rarely approach it.
const FILE_BYTES_MAX: u64 = 8 * 1024 * 1024;
const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Default)]
struct SearchReport {
    output: String,
    matches: usize,
    files_matched: usize,
    files_searched: usize,
    truncated: bool,
}

struct FileHits {
    hits: usize,
    /// More lines matched than the remaining result budget allowed.
    overflow: bool,
    rendered: String,
}

/// Renders the matching lines of one file grep-style: `path:line:text` for hits,
/// `path-line-text` for context, overlapping windows merged and separated by `--`.
fn render_file_hits(
    rel_path: &str,
    text: &str,
    regex: &Regex,
    context: usize,
    hits_max: usize,
) -> Option<FileHits> {
    let lines: Vec<&str> = text.lines().collect();
    let mut hits: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| regex.is_match(line))
        .map(|(i, _)| i)
        .take(hits_max + 1)
        .collect();
    let overflow = hits.len() > hits_max;
    hits.truncate(hits_max);
    let last_line = lines.len().checked_sub(1)?;
    if hits.is_empty() {
        return None;
    }

    let mut windows: Vec<(usize, usize)> = Vec::new();
    for &i in &hits {
        let lo = i.saturating_sub(context);
        let hi = (i + context).min(last_line);
        match windows.last_mut() {
            Some(prev) if lo <= prev.1 + 1 => prev.1 = prev.1.max(hi),
            _ => windows.push((lo, hi)),
        }
    }

    let mut out = String::new();
    for (n, &(lo, hi)) in windows.iter().enumerate() {
        if n > 0 {
            out.push_str("--\n");
        }
        for (i, line) in lines.iter().enumerate().take(hi + 1).skip(lo) {
            let sep = if hits.binary_search(&i).is_ok() { ':' } else { '-' };
            out.push_str(&format!("{rel_path}{sep}{}{sep}{line}\n", i + 1));
        }
    }
    Some(FileHits {
        hits: hits.len(),
        overflow,
        rendered: out,
    })
}

fn search_files(
    files: &[NoteFile],
    regex: &Regex,
    context: usize,
    results_max: usize,
    output_chars_max: usize,
) -> SearchReport {
    let mut report = SearchReport::default();
    for file in files {
        if report.matches >= results_max {
            report.truncated = true;
            break;
        }
        if file.bytes > FILE_BYTES_MAX {
            continue;
        }
        let bytes = match std::fs::read(&file.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(file = %file.rel_path, error = %e, "skipping unreadable note");
                continue;
            }
        };
        if bytes.iter().take(8_192).any(|&b| b == 0) {
            continue;
        }
        report.files_searched += 1;
        let text = String::from_utf8_lossy(&bytes);
        let remaining = results_max - report.matches;
        let Some(found) = render_file_hits(&file.rel_path, &text, regex, context, remaining) else {
            continue;
        };
        if report.files_matched > 0 {
            report.output.push_str("--\n");
        }
        report.matches += found.hits;
        report.files_matched += 1;
        report.truncated |= found.overflow;
        report.output.push_str(&found.rendered);
        if report.output.chars().count() > output_chars_max {
            report.output = cap_chars(&report.output, output_chars_max);
            report.truncated = true;
            break;
        }
    }
    report
}

/// Case-insensitive regex search over the notes with surrounding context lines.
pub struct SearchNotesTool {
    notes_root: PathBuf,
    output_chars_max: usize,
}

impl SearchNotesTool {
    pub fn new(notes_root: impl Into<PathBuf>, output_chars_max: usize) -> Self {
        Self {
            notes_root: notes_root.into(),
            output_chars_max,
        }
    }
}

#[async_trait]
impl Tool for SearchNotesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search_notes".to_string(),
            description: format!(
                "Full-text search of the notes with a case-insensitive regular expression. \
                 Returns matching lines as path:line:text with context lines as path-line-text. \
                 Use this for exact words, tags, TODO keywords or dates; use semantic_search for \
                 topics. Output is capped at {} characters.",
                self.output_chars_max
            ),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "pattern": { "type": "string", "description": "Regex to search for" },
                    "context_lines": {
                        "type": "integer",
                        "minimum": 0,
                        "description": format!("Lines of context on each side (default {CONTEXT_DEFAULT}, max {CONTEXT_MAX})")
                    },
                    "max_results": {
                        "type": "integer",
                        "minimum": 1,
                        "description": format!("Maximum matching lines (default {RESULTS_DEFAULT}, max {RESULTS_MAX})")
                    },
                    "directory": {
                        "type": "string",
                        "description": "Subdirectory relative to the notes root"
                    }
                },
                "required": ["pattern"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let pattern = require_string(&arguments, "pattern")?;
        if pattern.is_empty() {
            return Err(ToolError::InvalidArguments("pattern must not be empty".to_string()));
        }
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| ToolError::InvalidArguments(format!("invalid regex: {e}")))?;
        let context = optional_u64(&arguments, "context_lines")?
            .map(|n| n as usize)
            .unwrap_or(CONTEXT_DEFAULT)
            .min(CONTEXT_MAX);
        let results_max = optional_u64(&arguments, "max_results")?
            .map(|n| n as usize)
            .unwrap_or(RESULTS_DEFAULT)
            .clamp(1, RESULTS_MAX);
        let directory = optional_string(&arguments, "directory")?;
        let start = resolve_under_root(&self.notes_root, directory.as_deref())?;

        let root = self.notes_root.clone();
        let output_chars_max = self.output_chars_max;
        let report = tokio::task::spawn_blocking(move || -> Result<SearchReport> {
            let walk = walk_notes(&root, &start, &[])?;
            let mut report = search_files(&walk.files, &regex, context, results_max, output_chars_max);
            report.truncated |= walk.truncated;
            Ok(report)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("search failed: {e}")))??;

        tracing::info!(
            matches = report.matches,
            files_matched = report.files_matched,
            files_searched = report.files_searched,
            truncated = report.truncated,
            "note search finished"
        );
        Ok(serde_json::json!({
            "matches": report.matches,
            "files_matched": report.files_matched,
            "files_searched": report.files_searched,
            "truncated": report.truncated,
            "output": report.output,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notes() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("projects")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(
            root.join("projects/boat.org"),
            "* Boat\n** Sails\nOrder new jib\n** Hull\nsand and paint\n** Engine\nImpeller due\n",
        )
        .unwrap();
        std::fs::write(root.join("inbox.md"), "# Inbox\n- call about the JIB repair\n").unwrap();
        std::fs::write(root.join(".git/config"), "jib = hidden\n").unwrap();
        std::fs::write(root.join("blob.bin"), b"jib\0\0\0").unwrap();
        tmp
    }

    #[tokio::test]
    async fn finds_matches_case_insensitively_with_context() {
        let tmp = notes();
        let tool = SearchNotesTool::new(tmp.path(), 10_000);
        let out = tool
            .execute(json!({ "pattern": "jib", "context_lines": 1 }))
            .await
            .unwrap();
        assert_eq!(out["matches"], 2);
        assert_eq!(out["files_matched"], 2);
        assert_eq!(
            out["output"],
            "inbox.md-1-# Inbox\n\
             inbox.md:2:- call about the JIB repair\n\
             --\n\
             projects/boat.org-2-** Sails\n\
             projects/boat.org:3:Order new jib\n\
             projects/boat.org-4-** Hull\n"
        );
        assert_eq!(out["truncated"], false);
    }

    #[tokio::test]
    async fn overlapping_context_windows_merge() {
        let tmp = notes();
        let tool = SearchNotesTool::new(tmp.path(), 10_000);
        let out = tool
            .execute(json!({ "pattern": "^\\*\\* (sails|hull)", "context_lines": 1, "directory": "projects" }))
            .await
            .unwrap();
        assert_eq!(out["matches"], 2);
        let output = out["output"].as_str().unwrap();
        assert!(!output.contains("--"), "{output}");
        assert!(output.starts_with("projects/boat.org-1-* Boat\n"));
        assert!(output.ends_with("projects/boat.org-5-sand and paint\n"));
    }

    #[tokio::test]
    async fn limits_results_and_output_size() {
        let tmp = notes();
        let limited = SearchNotesTool::new(tmp.path(), 10_000)
            .execute(json!({ "pattern": "\\*", "context_lines": 0, "max_results": 2 }))
            .await
            .unwrap();
        assert_eq!(limited["matches"], 2);
        assert_eq!(limited["truncated"], true);

        let capped = SearchNotesTool::new(tmp.path(), 20)
            .execute(json!({ "pattern": "e" }))
            .await
            .unwrap();
        assert_eq!(capped["truncated"], true);
        assert!(capped["output"].as_str().unwrap().ends_with("...[truncated]"));
    }

    #[tokio::test]
    async fn bad_patterns_and_escapes_are_rejected() {
        let tmp = notes();
        let tool = SearchNotesTool::new(tmp.path(), 10_000);
        let err = tool.execute(json!({ "pattern": "(" })).await.unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
        let err = tool
            .execute(json!({ "pattern": "x", "directory": "../" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unauthorized(_)));

        let none = tool.execute(json!({ "pattern": "zebra" })).await.unwrap();
        assert_eq!(none["matches"], 0);
        assert_eq!(none["output"], "");
    }
}
