//! Embedding index and similarity search for knowledge-base articles.
//!
//! Articles are embedded into fixed-length vectors, kept in a durable
//! [`VectorStore`](vector::VectorStore) and served from an exact, partitioned
//! [`SimilarityIndex`](vector::SimilarityIndex). A
//! [`KnowledgeIndex`](semantic::KnowledgeIndex) handle keeps the two in step
//! as articles are created, edited and deleted, and answers top-K queries.

pub mod articles;
pub mod config;
pub mod display;
pub mod error;
pub mod io;
pub mod logging;
pub mod semantic;
pub mod vector;

// Explicit exports for better API clarity
pub use articles::{ArticleEvent, ArticleSource, ArticleText, JsonArticleSource};
pub use config::Settings;
pub use error::{KbError, KbResult};
pub use semantic::{
    ArticleState, HealthReport, ImportReport, KnowledgeIndex, RemoveOutcome, SearchQuery,
    UpsertOutcome,
};
pub use vector::{
    ArticleId, CategoryId, EmbeddingGenerator, HashingEmbedder, Score, SearchFilters,
    SearchResult, VectorDimension,
};
