use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolSpec, optional_f64, optional_string, optional_u64, require_string};
use async_trait::async_trait;
use chrono::NaiveDate;
use pkm_context::VectorRetriever;
use std::path::Path;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 50;
/// Raw cosine similarity; 0.6 on a `(1 + cos) / 2` scale.
const DEFAULT_MIN_SIMILARITY: f32 = 0.2;

/// Lets the model run its own retrieval with a different query, threshold or date floor
/// than the automatic per-turn excerpts.
pub struct SemanticSearchTool {
    retriever: VectorRetriever,
}

impl SemanticSearchTool {
    pub fn new(retriever: VectorRetriever) -> Self {
        Self { retriever }
    }
}

fn parse_date_floor(raw: Option<String>) -> Result<Option<NaiveDate>> {
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(Some)
        .map_err(|_| ToolError::InvalidArguments(format!("newer must be YYYY-MM-DD, got {raw:?}")))
}

#[async_trait]
impl Tool for SemanticSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "semantic_search".to_string(),
            description: "Search the user's notes by meaning rather than exact words. Returns \
                          excerpts ranked by similarity with their file, date and heading path."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "query": { "type": "string", "description": "What to look for" },
                    "limit": {
                        "type": "integer",
                        "description": format!("Maximum results (default {DEFAULT_LIMIT}, max {MAX_LIMIT})")
                    },
                    "min_similarity": {
                        "type": "number",
                        "description": format!("Cosine similarity threshold between 0 and 1 (default {DEFAULT_MIN_SIMILARITY})")
                    },
                    "newer": {
                        "type": "string",
                        "description": "Only notes dated on or after this day (YYYY-MM-DD)"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let query = require_string(&arguments, "query")?;
        if query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("query must not be empty".to_string()));
        }
        let limit = optional_u64(&arguments, "limit")?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT);
        let min_similarity = optional_f64(&arguments, "min_similarity")?
            .map(|v| v as f32)
            .unwrap_or(DEFAULT_MIN_SIMILARITY);
        if !(0.0..=1.0).contains(&min_similarity) {
            return Err(ToolError::InvalidArguments(format!(
                "min_similarity must be between 0 and 1, got {min_similarity}"
            )));
        }
        let date_floor = parse_date_floor(optional_string(&arguments, "newer")?)?;

        let chunks = self
            .retriever
            .retrieve(&query, limit, min_similarity, date_floor)
            .await?;

        let results: Vec<serde_json::Value> = chunks
            .iter()
            .map(|c| {
                let file_type = Path::new(&c.source)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_string();
                serde_json::json!({
                    "file": c.source,
                    "file_type": file_type,
                    "similarity": (c.similarity * 1000.0).round() / 1000.0,
                    "date": c.date.map(|d| d.format("%Y-%m-%d").to_string()),
                    "heading_path": c.heading_path,
                    "start_line": c.start_line,
                    "content": c.content,
                })
            })
            .collect();

        tracing::info!(results = results.len(), limit, "semantic search complete");
        Ok(serde_json::json!({
            "query": query,
            "count": results.len(),
            "results": results,
        }))
    }
}
