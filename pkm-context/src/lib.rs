//! Per-query context assembly: retrieval, history budgeting and prompt blocks.
//!
//! The chunk store is read-only from here; ingestion happens in an offline job.

mod assembler;
mod error;
mod history;
mod profile;
mod retriever;
mod store;

pub use assembler::{
    AssembledContext, AssemblerSettings, ContextAssembler, ContextBlock, ContextBlockKind,
};
pub use error::{ContextError, Result};
pub use history::{HistoryBudgeter, HistoryStats, MessageSize, TruncatedHistory};
pub use profile::{FileProfile, ProfileSource, StaticProfile};
pub use retriever::{RetrievedChunk, VectorRetriever, format_excerpts};
pub use store::{
    InMemoryChunkStore, SqliteChunkStore, StoreCandidate, StoredChunk, VectorStore,
    cosine_similarity,
};
