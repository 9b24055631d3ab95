//! Knowledge-base semantic search.
//!
//! This module ties the vector layer together: embedding with retries,
//! maintenance of the similarity index as articles change, and the query
//! path. [`KnowledgeIndex`] is the entry point.

mod embedder;
mod knowledge;
mod maintainer;
mod metadata;
mod search;

use std::sync::Arc;

pub use embedder::RetryPolicy;
pub use knowledge::{HealthReport, KnowledgeIndex};
pub use maintainer::{ArticleState, ImportReport, IndexMaintainer, RemoveOutcome, UpsertOutcome};
pub use metadata::{METADATA_FILE_NAME, SemanticMetadata};
pub use search::{SearchQuery, SearchService};

// Re-export key types
pub use fastembed::EmbeddingModel;

use crate::config::EmbeddingConfig;
use crate::error::{KbError, KbResult};
use crate::vector::{
    EmbeddingGenerator, FastEmbedGenerator, HASHING_MODEL_NAME, HashingEmbedder, VectorDimension,
    parse_embedding_model,
};

/// Similarity threshold recommendations based on testing
pub mod thresholds {
    /// Threshold for very similar articles (e.g., same question, different wording)
    pub const VERY_SIMILAR: f32 = 0.75;

    /// Threshold for similar articles (e.g., related topics)
    pub const SIMILAR: f32 = 0.60;

    /// Threshold for somewhat related articles
    pub const RELATED: f32 = 0.40;

    /// Default threshold for semantic search
    pub const DEFAULT: f32 = SIMILAR;
}

/// Creates the embedder named by `config.model`.
///
/// `"hashing"` selects the offline [`HashingEmbedder`] with
/// `config.dimension` components; anything else must name a fastembed model,
/// which is downloaded into `config.cache_dir` on first use.
pub fn build_embedder(config: &EmbeddingConfig) -> KbResult<Arc<dyn EmbeddingGenerator>> {
    if config.model.eq_ignore_ascii_case(HASHING_MODEL_NAME) {
        let dimension = VectorDimension::new(config.dimension)?;
        return Ok(Arc::new(HashingEmbedder::new(dimension)));
    }

    let model = parse_embedding_model(&config.model).map_err(|e| KbError::Config {
        reason: e.to_string(),
    })?;
    std::fs::create_dir_all(&config.cache_dir).map_err(|e| KbError::Config {
        reason: format!(
            "cannot create model cache {}: {e}",
            config.cache_dir.display()
        ),
    })?;
    let generator =
        FastEmbedGenerator::new(model, &config.cache_dir, config.show_download_progress)?;
    Ok(Arc::new(generator))
}
