//! Metadata tracking for the persisted index.
//!
//! This module records which embedding model and metric produced the stored
//! vectors, so that opening the data directory with a different model is
//! detected instead of silently mixing incomparable embeddings.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};
use crate::vector::METRIC_NAME;

/// File name of the metadata inside the data directory.
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Get current UTC timestamp in seconds since UNIX_EPOCH
pub fn get_utc_timestamp() -> u64 {
    Utc::now().timestamp() as u64
}

fn default_metric() -> String {
    METRIC_NAME.to_string()
}

/// Metadata for index persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMetadata {
    /// Name of the embedding model used
    pub model_name: String,

    /// Similarity metric the vectors are compared with
    #[serde(default = "default_metric")]
    pub metric: String,

    /// Dimension of embeddings
    pub dimension: usize,

    /// Number of embeddings stored
    pub embedding_count: usize,

    /// Unix timestamp when created
    pub created_at: u64,

    /// Unix timestamp when last updated
    pub updated_at: u64,

    /// Version of the metadata format
    pub version: u32,
}

impl SemanticMetadata {
    /// Current metadata version
    const CURRENT_VERSION: u32 = 1;

    /// Create new metadata with current timestamp
    pub fn new(model_name: String, dimension: usize, embedding_count: usize) -> Self {
        let now = get_utc_timestamp();
        Self {
            model_name,
            metric: default_metric(),
            dimension,
            embedding_count,
            created_at: now,
            updated_at: now,
            version: Self::CURRENT_VERSION,
        }
    }

    /// Update the metadata with new embedding count and timestamp
    pub fn update(&mut self, embedding_count: usize) {
        self.embedding_count = embedding_count;
        self.updated_at = get_utc_timestamp();
    }

    /// Whether vectors described by this metadata are comparable with the
    /// output of `model_name` at `dimension`.
    #[must_use]
    pub fn is_compatible(&self, model_name: &str, dimension: usize) -> bool {
        self.model_name == model_name && self.dimension == dimension && self.metric == METRIC_NAME
    }

    /// Save metadata to a JSON file
    pub fn save(&self, path: &Path) -> KbResult<()> {
        let metadata_path = path.join(METADATA_FILE_NAME);

        let json = serde_json::to_string_pretty(self).map_err(|e| KbError::Metadata {
            reason: format!("Failed to serialize metadata: {e}"),
        })?;

        // Write then rename so a crash never leaves a half-written file
        let tmp_path = metadata_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .and_then(|()| std::fs::rename(&tmp_path, &metadata_path))
            .map_err(|e| KbError::Metadata {
                reason: format!("Failed to write metadata: {e}"),
            })?;

        Ok(())
    }

    /// Load metadata from a JSON file
    pub fn load(path: &Path) -> KbResult<Self> {
        let metadata_path = path.join(METADATA_FILE_NAME);

        let json = std::fs::read_to_string(&metadata_path).map_err(|e| KbError::Metadata {
            reason: format!("Failed to read metadata: {e}"),
        })?;

        let metadata: Self = serde_json::from_str(&json).map_err(|e| KbError::Metadata {
            reason: format!("Failed to parse metadata: {e}"),
        })?;

        // Check version compatibility
        if metadata.version > Self::CURRENT_VERSION {
            return Err(KbError::Metadata {
                reason: format!(
                    "Metadata version {} is newer than supported version {}",
                    metadata.version,
                    Self::CURRENT_VERSION
                ),
            });
        }

        Ok(metadata)
    }

    /// Check if metadata file exists
    pub fn exists(path: &Path) -> bool {
        path.join(METADATA_FILE_NAME).exists()
    }
}
