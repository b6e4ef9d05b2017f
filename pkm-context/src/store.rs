use crate::error::{ContextError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One pre-embedded note excerpt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChunk {
    pub source: String,
    pub heading_path: Option<String>,
    pub content: String,
    pub date: Option<NaiveDate>,
    pub start_line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreCandidate {
    pub chunk: StoredChunk,
    pub similarity: f32,
}

/// Nearest-neighbour lookup over pre-embedded chunks.
///
/// Implementations return at most `candidate_limit` candidates ordered by descending
/// similarity. Filtering by threshold or date is left to the caller.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn nearest(&self, embedding: &[f32], candidate_limit: usize)
    -> Result<Vec<StoreCandidate>>;
}

/// Cosine similarity in `[-1, 1]`. Mismatched dimensions or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}

fn keep_nearest(mut candidates: Vec<StoreCandidate>, candidate_limit: usize) -> Vec<StoreCandidate> {
    candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    candidates.truncate(candidate_limit);
    candidates
}

/// Store backed by a vector list held in memory. Used for tests and small corpora.
#[derive(Debug, Default, Clone)]
pub struct InMemoryChunkStore {
    entries: Vec<(Vec<f32>, StoredChunk)>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, embedding: Vec<f32>, chunk: StoredChunk) {
        self.entries.push((embedding, chunk));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryChunkStore {
    async fn nearest(
        &self,
        embedding: &[f32],
        candidate_limit: usize,
    ) -> Result<Vec<StoreCandidate>> {
        let candidates = self
            .entries
            .iter()
            .map(|(vector, chunk)| StoreCandidate {
                chunk: chunk.clone(),
                similarity: cosine_similarity(embedding, vector),
            })
            .collect();
        Ok(keep_nearest(candidates, candidate_limit))
    }
}

/// Read-only view over the ingestion database.
///
/// Expects `documents(id, file_path, date_extracted)` and
/// `document_chunks(document_id, content, heading_path, start_line, embedding)`, with
/// embeddings stored as little-endian `f32` blobs. Each lookup opens its own read-only
/// connection so concurrent queries never share a handle.
#[derive(Debug, Clone)]
pub struct SqliteChunkStore {
    path: PathBuf,
}

impl SqliteChunkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of chunks with an embedding. Used by `doctor`.
    pub async fn embedded_chunk_count(&self) -> Result<u64> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = open_readonly(&path)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM document_chunks WHERE embedding IS NOT NULL",
                [],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
        .map_err(|e| ContextError::Store(format!("chunk count task failed: {e}")))?
    }
}

fn open_readonly(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(ContextError::Store(format!(
            "vector database not found at {}",
            path.display()
        )));
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn parse_chunk_date(raw: Option<String>) -> Option<NaiveDate> {
    let raw = raw?;
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn scan_nearest(path: &Path, query: &[f32], candidate_limit: usize) -> Result<Vec<StoreCandidate>> {
    let conn = open_readonly(path)?;
    let mut stmt = conn.prepare(
        "SELECT d.file_path, d.date_extracted, c.heading_path, c.content, c.start_line, c.embedding
         FROM document_chunks c
         JOIN documents d ON c.document_id = d.id
         WHERE c.embedding IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<i64>>(4)?,
            row.get::<_, Vec<u8>>(5)?,
        ))
    })?;

    let mut candidates = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        let (source, date, heading_path, content, start_line, blob) = row?;
        let Some(vector) = decode_embedding(&blob) else {
            skipped += 1;
            continue;
        };
        if vector.len() != query.len() {
            skipped += 1;
            continue;
        }
        candidates.push(StoreCandidate {
            similarity: cosine_similarity(query, &vector),
            chunk: StoredChunk {
                source,
                heading_path: heading_path.filter(|h| !h.trim().is_empty()),
                content,
                date: parse_chunk_date(date),
                start_line: start_line.and_then(|n| u32::try_from(n).ok()),
            },
        });
    }
    if skipped > 0 {
        tracing::warn!(skipped, "skipped chunks with unreadable or mismatched embeddings");
    }
    Ok(keep_nearest(candidates, candidate_limit))
}

#[async_trait]
impl VectorStore for SqliteChunkStore {
    #[tracing::instrument(level = "debug", skip_all, fields(candidate_limit = candidate_limit))]
    async fn nearest(
        &self,
        embedding: &[f32],
        candidate_limit: usize,
    ) -> Result<Vec<StoreCandidate>> {
        let path = self.path.clone();
        let query = embedding.to_vec();
        tokio::task::spawn_blocking(move || scan_nearest(&path, &query, candidate_limit))
            .await
            .map_err(|e| ContextError::Store(format!("vector scan task failed: {e}")))?
    }
}
