//! Vector layer: embedding adapters, durable vector storage and the
//! similarity index.
//!
//! # Architecture
//! Embeddings are produced by an [`EmbeddingGenerator`], persisted in a
//! log-structured [`VectorStore`] (the source of truth) and served from an
//! in-memory [`SimilarityIndex`]. The index is an inverted-file layout over
//! K-means partitions with exact angular pruning, so it can always be rebuilt
//! from the store and always agrees with a brute-force scan.

mod clustering;
mod embedding;
mod index;
mod storage;
mod types;

// Re-export core types for public API
pub use clustering::{
    ClusteringError, KMeansResult, angle_between, assign_to_nearest_centroid, cosine_similarity,
    kmeans_clustering, normalize_vector, normalized,
};
#[cfg(test)]
pub use embedding::MockEmbeddingGenerator;
pub use embedding::{
    EmbeddingGenerator, FastEmbedGenerator, HASHING_MODEL_NAME, HashingEmbedder,
    create_article_text, model_to_string, parse_embedding_model,
};
pub use index::{
    IndexOptions, IndexStats, METRIC_NAME, QueryGuard, SearchFilters, SimilarityIndex,
    brute_force_top_k,
};
pub use storage::{
    LOG_FILE_NAME, StoreIter, StoreOptions, StoredVector, VectorStorageError, VectorStore,
};
pub use types::{
    ArticleId, CategoryId, ClusterId, Score, SearchResult, VECTOR_DIMENSION_384, VectorDimension,
    VectorError,
};
