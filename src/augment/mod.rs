//! Prompt augmentation with retrieved knowledge, web results, and capability
//! output.
//!
//! The [`ContextAugmenter`] is best-effort throughout. Each collaborator call
//! is bounded by a timeout, and a collaborator that fails only removes its own
//! contribution.

mod augmenter;
mod embedding;
mod sources;
mod types;

pub use augmenter::{fit_to_budget, ContextAugmenter};
pub use embedding::{chunk_text, EmbeddingRetrievalStore, DEFAULT_EMBEDDING_MODEL};
pub use sources::{
    dedup_web_results, CombinedWebSearch, Document, DuckDuckGoSearch, InMemoryRetrievalStore,
    RetrievalStore, WebSearch, WikipediaSearch,
};
pub use types::{
    AugmentationNeed, AugmentedPrompt, DegradedSource, RetrievedSnippet, Supplement,
    SupplementKind, WebResult,
};
