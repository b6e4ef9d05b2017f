use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolSpec, optional_string, require_string, resolve_under_root};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::PathBuf;
use tokio::sync::Mutex;

pub const DEFAULT_JOURNAL_PATH: &str = "journals/journal.org";

fn heading_level(line: &str) -> Option<usize> {
    let stars = line.chars().take_while(|c| *c == '*').count();
    (stars > 0 && line[stars..].starts_with(' ')).then_some(stars)
}

fn heading_key(line: &str) -> &str {
    line.trim_start_matches('*')
        .split_whitespace()
        .next()
        .unwrap_or("")
}

/// First line after `idx` that opens a heading at `level` or shallower.
fn section_end(lines: &[String], idx: usize, level: usize, limit: usize) -> usize {
    (idx + 1..limit)
        .find(|&j| heading_level(&lines[j]).is_some_and(|l| l <= level))
        .unwrap_or(limit)
}

/// Finds the child heading whose first word is `key`, or inserts `heading` in key order.
/// Returns the heading's index and the new end of the parent range.
fn find_or_insert(
    lines: &mut Vec<String>,
    start: usize,
    end: usize,
    level: usize,
    key: &str,
    heading: String,
) -> (usize, usize) {
    let mut insert_at = end;
    for i in start..end {
        if heading_level(&lines[i]) != Some(level) {
            continue;
        }
        let existing = heading_key(&lines[i]);
        if existing == key {
            return (i, end);
        }
        if existing > key {
            insert_at = i;
            break;
        }
    }
    lines.insert(insert_at, heading);
    (insert_at, end + 1)
}

/// Adds `note` as a list item under the `* YYYY` / `** YYYY-MM Month` /
/// `*** YYYY-MM-DD Weekday` heading for `date`, creating missing headings in date order.
pub fn insert_journal_note(existing: &str, date: NaiveDate, note: &str) -> String {
    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();

    let year = date.format("%Y").to_string();
    let month = date.format("%Y-%m").to_string();
    let day = date.format("%Y-%m-%d").to_string();

    let len = lines.len();
    let (year_idx, _) = find_or_insert(&mut lines, 0, len, 1, &year, format!("* {year}"));
    let year_end = section_end(&lines, year_idx, 1, lines.len());

    let (month_idx, month_parent_end) = find_or_insert(
        &mut lines,
        year_idx + 1,
        year_end,
        2,
        &month,
        format!("** {}", date.format("%Y-%m %B")),
    );
    let month_end = section_end(&lines, month_idx, 2, month_parent_end);

    let (day_idx, day_parent_end) = find_or_insert(
        &mut lines,
        month_idx + 1,
        month_end,
        3,
        &day,
        format!("*** {}", date.format("%Y-%m-%d %A")),
    );
    let mut at = section_end(&lines, day_idx, 3, day_parent_end);
    while at > day_idx + 1 && lines[at - 1].trim().is_empty() {
        at -= 1;
    }

    let mut note_lines = note.trim().lines();
    let mut entry: Vec<String> = Vec::new();
    if let Some(first) = note_lines.next() {
        entry.push(format!("- {first}"));
    }
    entry.extend(note_lines.map(|l| format!("  {l}")));
    lines.splice(at..at, entry);

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Appends notes to the org journal. Writes are serialised so concurrent sessions do
/// not lose each other's entries.
pub struct AddJournalNoteTool {
    journal_path: PathBuf,
    write_lock: Mutex<()>,
}

impl AddJournalNoteTool {
    pub fn new(notes_root: impl Into<PathBuf>, relative_path: &str) -> Result<Self> {
        let root = notes_root.into();
        let journal_path = resolve_under_root(&root, Some(relative_path))?;
        Ok(Self {
            journal_path,
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl Tool for AddJournalNoteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "add_journal_note".to_string(),
            description: "Add a note to today's journal entry. Creates the year, month and day \
                          headings when missing. Always use this instead of editing the journal \
                          file directly."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "note": { "type": "string", "description": "Note text; may span lines" },
                    "date": {
                        "type": "string",
                        "description": "Day to file under (YYYY-MM-DD), defaults to today"
                    }
                },
                "required": ["note"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let note = require_string(&arguments, "note")?;
        if note.trim().is_empty() {
            return Err(ToolError::InvalidArguments("note must not be empty".to_string()));
        }
        let date = match optional_string(&arguments, "date")? {
            Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
                ToolError::InvalidArguments(format!("date must be YYYY-MM-DD, got {raw:?}"))
            })?,
            None => chrono::Local::now().date_naive(),
        };

        let _guard = self.write_lock.lock().await;
        let existing = match tokio::fs::read_to_string(&self.journal_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let updated = insert_journal_note(&existing, date, &note);

        if let Some(parent) = self.journal_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.journal_path.with_extension("org.tmp");
        tokio::fs::write(&tmp, &updated).await?;
        tokio::fs::rename(&tmp, &self.journal_path).await?;

        tracing::info!(%date, note_chars = note.chars().count(), "journal note added");
        Ok(serde_json::json!({
            "status": "ok",
            "date": date.format("%Y-%m-%d").to_string(),
            "file": self.journal_path.display().to_string(),
        }))
    }
}
