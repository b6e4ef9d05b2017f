use crate::error::Result;
use crate::store::VectorStore;
use chrono::NaiveDate;
use pkm_llm::EmbeddingProvider;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::Arc;

const DEFAULT_CANDIDATE_LIMIT: usize = 50;

/// A ranked excerpt for one request. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub similarity: f32,
    pub source: String,
    pub heading_path: Option<String>,
    pub content: String,
    pub date: Option<NaiveDate>,
    pub start_line: Option<u32>,
}

/// Embeds a query and ranks stored chunks against it.
///
/// The store is asked for a fixed-size candidate pool that does not depend on the
/// threshold, so raising `min_similarity` can only shrink the result.
#[derive(Clone)]
pub struct VectorRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    candidate_limit: usize,
}

impl VectorRetriever {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
        }
    }

    pub fn with_candidate_limit(mut self, candidate_limit: usize) -> Self {
        self.candidate_limit = candidate_limit.max(1);
        self
    }

    #[tracing::instrument(level = "debug", skip_all, fields(limit = limit, min_similarity = min_similarity, date_floor = ?date_floor))]
    pub async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f32,
        date_floor: Option<NaiveDate>,
    ) -> Result<Vec<RetrievedChunk>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed_query(query).await?;
        let pool = self.candidate_limit.max(limit);
        let candidates = self.store.nearest(&embedding, pool).await?;
        let candidate_count = candidates.len();

        let mut chunks: Vec<RetrievedChunk> = candidates
            .into_iter()
            .filter(|c| c.similarity.is_finite() && c.similarity >= min_similarity)
            .filter(|c| match (date_floor, c.chunk.date) {
                (Some(floor), Some(date)) => date >= floor,
                // Undated chunks are kept.
                _ => true,
            })
            .map(|c| RetrievedChunk {
                similarity: c.similarity,
                source: c.chunk.source,
                heading_path: c.chunk.heading_path,
                content: c.chunk.content,
                date: c.chunk.date,
                start_line: c.chunk.start_line,
            })
            .collect();

        chunks.sort_by(rank);
        chunks.truncate(limit);

        tracing::debug!(
            candidates = candidate_count,
            returned = chunks.len(),
            "retrieval complete"
        );
        Ok(chunks)
    }

    pub async fn retrieve_and_format(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f32,
        date_floor: Option<NaiveDate>,
    ) -> Result<String> {
        let chunks = self
            .retrieve(query, limit, min_similarity, date_floor)
            .await?;
        Ok(format_excerpts(&chunks))
    }
}

/// Similarity descending, then newer source first. Undated sorts after dated.
fn rank(a: &RetrievedChunk, b: &RetrievedChunk) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| b.date.cmp(&a.date))
}

/// Renders ranked chunks as one markdown block. Empty input renders as an empty string.
pub fn format_excerpts(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "# RETRIEVED NOTE CONTEXT\n\n\
         The following excerpts from the user's notes matched this query. \
         Use them when relevant and cite the file when you do.\n",
    );
    for (i, chunk) in chunks.iter().enumerate() {
        let _ = write!(
            out,
            "\n## Excerpt {} (similarity: {:.2})\n",
            i + 1,
            chunk.similarity
        );
        if let Some(date) = chunk.date {
            let _ = writeln!(out, "**Date:** {}", date.format("%Y-%m-%d"));
        }
        match chunk.start_line {
            Some(line) => {
                let _ = writeln!(out, "**File:** {}:{}", chunk.source, line);
            }
            None => {
                let _ = writeln!(out, "**File:** {}", chunk.source);
            }
        }
        if let Some(path) = chunk.heading_path.as_deref() {
            let _ = writeln!(out, "**Context:** {path}");
        }
        out.push('\n');
        out.push_str(chunk.content.trim_end());
        out.push_str("\n\n---\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContextError;
    use crate::store::{InMemoryChunkStore, StoredChunk};
    use async_trait::async_trait;
    use pkm_llm::LlmError;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed_query(&self, _text: &str) -> pkm_llm::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed_query(&self, _text: &str) -> pkm_llm::Result<Vec<f32>> {
            Err(LlmError::RateLimited("slow down".to_string()))
        }
    }

    /// A unit vector whose cosine with `[1, 0]` is exactly `s`.
    fn at_similarity(s: f32) -> Vec<f32> {
        vec![s, (1.0 - s * s).sqrt()]
    }

    fn chunk(source: &str, date: Option<(i32, u32, u32)>) -> StoredChunk {
        StoredChunk {
            source: source.to_string(),
            heading_path: Some("Trips > Summer".to_string()),
            content: format!("notes from {source}"),
            date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            start_line: None,
        }
    }

    fn retriever(store: InMemoryChunkStore) -> VectorRetriever {
        VectorRetriever::new(Arc::new(FixedEmbedder(vec![1.0, 0.0])), Arc::new(store))
    }

    #[tokio::test]
    async fn threshold_keeps_only_relevant_chunk() {
        let mut store = InMemoryChunkStore::new();
        store.insert(at_similarity(0.82), chunk("sailing.org", None));
        store.insert(at_similarity(0.55), chunk("groceries.org", None));

        let out = retriever(store)
            .retrieve("sailing trip", 10, 0.60, None)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, "sailing.org");
        assert!((out[0].similarity - 0.82).abs() < 1e-4);
    }

    #[tokio::test]
    async fn raising_threshold_never_adds_results() {
        let mut store = InMemoryChunkStore::new();
        for (i, s) in [0.95, 0.9, 0.8, 0.7, 0.61, 0.4, 0.1].iter().enumerate() {
            store.insert(at_similarity(*s), chunk(&format!("n{i}.org"), None));
        }
        let r = retriever(store);

        let mut previous = usize::MAX;
        for threshold in [0.0, 0.3, 0.6, 0.75, 0.85, 0.92, 0.99] {
            let n = r.retrieve("q", 10, threshold, None).await.unwrap().len();
            assert!(n <= previous, "threshold {threshold} returned {n} > {previous}");
            previous = n;
        }
    }

    #[tokio::test]
    async fn date_floor_filters_old_chunks_but_keeps_undated() {
        let mut store = InMemoryChunkStore::new();
        store.insert(at_similarity(0.9), chunk("old.org", Some((2023, 1, 5))));
        store.insert(at_similarity(0.9), chunk("new.org", Some((2025, 6, 1))));
        store.insert(at_similarity(0.9), chunk("undated.org", None));

        let floor = NaiveDate::from_ymd_opt(2025, 1, 1);
        let out = retriever(store).retrieve("q", 10, 0.5, floor).await.unwrap();
        let sources: Vec<&str> = out.iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["new.org", "undated.org"]);
    }

    #[tokio::test]
    async fn ties_prefer_newer_sources_and_limit_applies() {
        let mut store = InMemoryChunkStore::new();
        store.insert(at_similarity(0.8), chunk("a.org", Some((2024, 2, 1))));
        store.insert(at_similarity(0.8), chunk("b.org", Some((2025, 2, 1))));
        store.insert(at_similarity(0.9), chunk("c.org", Some((2020, 1, 1))));

        let out = retriever(store).retrieve("q", 2, 0.5, None).await.unwrap();
        let sources: Vec<&str> = out.iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["c.org", "b.org"]);
    }

    #[tokio::test]
    async fn embedding_failure_is_a_provider_error() {
        let r = VectorRetriever::new(Arc::new(FailingEmbedder), Arc::new(InMemoryChunkStore::new()));
        let err = r.retrieve("q", 5, 0.5, None).await.unwrap_err();
        assert!(matches!(err, ContextError::Provider(_)));
    }

    #[test]
    fn format_includes_metadata_per_excerpt() {
        let text = format_excerpts(&[RetrievedChunk {
            similarity: 0.8234,
            source: "journals/journal.org".to_string(),
            heading_path: Some("2025 > 2025-06 June".to_string()),
            content: "Sailed to the island.\n".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 6, 14),
            start_line: Some(42),
        }]);
        assert!(text.starts_with("# RETRIEVED NOTE CONTEXT"));
        assert!(text.contains("## Excerpt 1 (similarity: 0.82)"));
        assert!(text.contains("**Date:** 2025-06-14"));
        assert!(text.contains("**File:** journals/journal.org:42"));
        assert!(text.contains("**Context:** 2025 > 2025-06 June"));
        assert!(text.contains("Sailed to the island."));
        assert_eq!(format_excerpts(&[]), "");
    }
}
