use crate::history::{HistoryBudgeter, TruncatedHistory};
use crate::profile::ProfileSource;
use crate::retriever::{VectorRetriever, format_excerpts};
use chrono::NaiveDate;
use pkm_llm::{Message, SystemBlock};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextBlockKind {
    StaticInstructions,
    UserProfile,
    RetrievedExcerpts,
    CurrentDate,
}

/// One system-content segment. Blocks are always produced in the order of
/// [`ContextBlockKind`]; an absent profile or empty retrieval yields an empty text
/// rather than a missing block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextBlock {
    pub kind: ContextBlockKind,
    pub text: String,
    pub cacheable: bool,
}

impl ContextBlock {
    pub fn to_system_block(&self) -> SystemBlock {
        SystemBlock {
            text: self.text.clone(),
            cacheable: self.cacheable,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssemblerSettings {
    pub history_token_budget: usize,
    pub preserve_turns: usize,
    pub retrieval_limit: usize,
    pub min_similarity: f32,
}

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub blocks: Vec<ContextBlock>,
    pub history: TruncatedHistory,
    pub retrieved_chunks: usize,
}

impl AssembledContext {
    pub fn system_blocks(&self) -> Vec<SystemBlock> {
        self.blocks.iter().map(ContextBlock::to_system_block).collect()
    }
}

pub struct ContextAssembler {
    instructions: String,
    profile: Arc<dyn ProfileSource>,
    retriever: Option<VectorRetriever>,
    budgeter: HistoryBudgeter,
    settings: AssemblerSettings,
}

impl ContextAssembler {
    pub fn new(
        instructions: impl Into<String>,
        profile: Arc<dyn ProfileSource>,
        retriever: Option<VectorRetriever>,
        budgeter: HistoryBudgeter,
        settings: AssemblerSettings,
    ) -> Self {
        Self {
            instructions: instructions.into(),
            profile,
            retriever,
            budgeter,
            settings,
        }
    }

    pub fn budgeter(&self) -> &HistoryBudgeter {
        &self.budgeter
    }

    pub fn settings(&self) -> AssemblerSettings {
        self.settings
    }

    pub async fn assemble(&self, history: &[Message], user_query: &str) -> AssembledContext {
        let today = chrono::Local::now().date_naive();
        self.assemble_on(history, user_query, today).await
    }

    /// Never fails: profile and retrieval problems degrade to empty blocks with a warning.
    #[tracing::instrument(level = "debug", skip_all, fields(history_len = history.len(), today = %today))]
    pub async fn assemble_on(
        &self,
        history: &[Message],
        user_query: &str,
        today: NaiveDate,
    ) -> AssembledContext {
        let profile = match self.profile.load().await {
            Ok(text) => text.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "user profile unavailable, continuing without it");
                String::new()
            }
        };

        let (retrieved, retrieved_chunks) = self.retrieve(user_query).await;

        let blocks = vec![
            ContextBlock {
                kind: ContextBlockKind::StaticInstructions,
                text: self.instructions.clone(),
                cacheable: true,
            },
            ContextBlock {
                kind: ContextBlockKind::UserProfile,
                text: profile,
                cacheable: true,
            },
            // Changes with every query, so it sits after the cached prefix.
            ContextBlock {
                kind: ContextBlockKind::RetrievedExcerpts,
                text: retrieved,
                cacheable: false,
            },
            ContextBlock {
                kind: ContextBlockKind::CurrentDate,
                text: format!("Current date: {}", today.format("%A, %Y-%m-%d")),
                cacheable: false,
            },
        ];

        let history = self.budgeter.truncate(
            history,
            self.settings.history_token_budget,
            self.settings.preserve_turns,
        );

        AssembledContext {
            blocks,
            history,
            retrieved_chunks,
        }
    }

    async fn retrieve(&self, user_query: &str) -> (String, usize) {
        let Some(retriever) = self.retriever.as_ref() else {
            return (String::new(), 0);
        };
        if user_query.trim().is_empty() {
            return (String::new(), 0);
        }
        match retriever
            .retrieve(
                user_query,
                self.settings.retrieval_limit,
                self.settings.min_similarity,
                None,
            )
            .await
        {
            Ok(chunks) => (format_excerpts(&chunks), chunks.len()),
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, continuing without excerpts");
                (String::new(), 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::StaticProfile;
    use crate::store::{InMemoryChunkStore, StoredChunk};
    use async_trait::async_trait;
    use pkm_llm::{CharRatioEstimator, EmbeddingProvider, LlmError};

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed_query(&self, _text: &str) -> pkm_llm::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl EmbeddingProvider for DownEmbedder {
        async fn embed_query(&self, _text: &str) -> pkm_llm::Result<Vec<f32>> {
            Err(LlmError::Http("503".to_string()))
        }
    }

    fn settings() -> AssemblerSettings {
        AssemblerSettings {
            history_token_budget: 10_000,
            preserve_turns: 10,
            retrieval_limit: 12,
            min_similarity: 0.6,
        }
    }

    fn store() -> InMemoryChunkStore {
        let mut store = InMemoryChunkStore::new();
        store.insert(
            vec![0.9, 0.1],
            StoredChunk {
                source: "trips/sailing.org".to_string(),
                heading_path: Some("Summer".to_string()),
                content: "Sailed around the bay.".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 7, 1),
                start_line: Some(3),
            },
        );
        store
    }

    fn assembler(embedder: Arc<dyn EmbeddingProvider>) -> ContextAssembler {
        let retriever = VectorRetriever::new(embedder, Arc::new(store()));
        ContextAssembler::new(
            "You are a notes assistant.",
            Arc::new(StaticProfile::new("Lives near the coast.")),
            Some(retriever),
            HistoryBudgeter::new(Arc::new(CharRatioEstimator::default()), 1_000),
            settings(),
        )
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    #[tokio::test]
    async fn blocks_come_in_fixed_order_with_cache_markers() {
        let ctx = assembler(Arc::new(FixedEmbedder))
            .assemble_on(&[], "sailing trip", today())
            .await;

        let kinds: Vec<ContextBlockKind> = ctx.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ContextBlockKind::StaticInstructions,
                ContextBlockKind::UserProfile,
                ContextBlockKind::RetrievedExcerpts,
                ContextBlockKind::CurrentDate,
            ]
        );
        let cacheable: Vec<bool> = ctx.blocks.iter().map(|b| b.cacheable).collect();
        assert_eq!(cacheable, vec![true, true, false, false]);
        assert_eq!(ctx.retrieved_chunks, 1);
        assert!(ctx.blocks[2].text.contains("trips/sailing.org:3"));
        assert_eq!(ctx.blocks[3].text, "Current date: Saturday, 2026-10-17");
    }

    #[tokio::test]
    async fn cacheable_prefix_is_stable_across_queries() {
        let a = assembler(Arc::new(FixedEmbedder));
        let first = a.assemble_on(&[], "sailing trip", today()).await;
        let second = a.assemble_on(&[], "something else", today()).await;
        assert_eq!(first.blocks[..2], second.blocks[..2]);
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_empty_excerpts() {
        let ctx = assembler(Arc::new(DownEmbedder))
            .assemble_on(&[], "sailing trip", today())
            .await;
        assert_eq!(ctx.blocks.len(), 4);
        assert_eq!(ctx.blocks[2].text, "");
        assert_eq!(ctx.retrieved_chunks, 0);
    }

    #[tokio::test]
    async fn history_goes_through_the_budgeter() {
        let est = CharRatioEstimator::default();
        let history = vec![
            Message::user_text("hello", &est),
            Message::assistant_text("hi there", &est),
        ];
        let ctx = assembler(Arc::new(FixedEmbedder))
            .assemble_on(&history, "sailing trip", today())
            .await;
        assert_eq!(ctx.history.messages, history);
        assert!(!ctx.history.over_budget);
    }
}
