//! Type-safe wrappers and core types for the article vector index.
//!
//! This module provides newtypes and error types following the project's
//! strict type safety guidelines. All types implement necessary traits
//! for ergonomic usage while preventing primitive obsession.

use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard vector dimension for article embeddings (all-MiniLM-L6-v2 model).
pub const VECTOR_DIMENSION_384: usize = 384;

/// Identifier of an article, shared with the external article store.
///
/// Uses `NonZeroU64` internally because the article store hands out
/// positive primary keys; zero never names a real article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleId(NonZeroU64);

impl ArticleId {
    /// Creates a new `ArticleId` from a non-zero u64.
    ///
    /// Returns `None` if the provided ID is zero.
    #[must_use]
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    /// Creates a new `ArticleId`, panicking if zero.
    ///
    /// # Panics
    /// Panics if `id` is zero. Use `new()` for fallible construction.
    #[must_use]
    pub fn new_unchecked(id: u64) -> Self {
        Self(NonZeroU64::new(id).expect("ArticleId cannot be zero"))
    }

    /// Returns the underlying u64 value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    /// Converts to little-endian bytes for storage.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.get().to_le_bytes()
    }

    /// Creates from little-endian bytes.
    ///
    /// Returns `None` if the bytes represent zero.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Option<Self> {
        Self::new(u64::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for ArticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an article category. Only used for search filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(NonZeroU64);

impl CategoryId {
    #[must_use]
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    /// Encodes an optional category; zero stands for "no category".
    #[must_use]
    pub fn encode(category: Option<Self>) -> u64 {
        category.map_or(0, |c| c.get())
    }

    #[must_use]
    pub fn decode(raw: u64) -> Option<Self> {
        Self::new(raw)
    }
}

impl std::fmt::Display for CategoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a partition inside the similarity index.
///
/// Partitions are addressed by their position in the centroid table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(u32);

impl ClusterId {
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Type-safe wrapper for cosine similarity scores.
///
/// Scores live in the range [-1.0, 1.0] where:
/// - 1.0 indicates identical direction
/// - 0.0 indicates orthogonal vectors
/// - -1.0 indicates opposite direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(f32);

impl Score {
    /// Builds a score from a raw cosine value, clamping float drift
    /// (e.g. 1.0000001) back into range. NaN maps to 0.0 and -0.0 to +0.0.
    #[must_use]
    pub fn from_similarity(value: f32) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(-1.0, 1.0) + 0.0)
        }
    }

    /// Returns the underlying f32 value.
    #[must_use]
    pub fn get(&self) -> f32 {
        self.0
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Adding +0.0 folds -0.0 into +0.0, which total_cmp would order apart
        (self.0 + 0.0).total_cmp(&(other.0 + 0.0))
    }
}

/// Type-safe wrapper for vector dimensions.
///
/// Ensures runtime validation of vector dimensions to prevent
/// dimension mismatches during operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Creates a standard 384-dimensional vector dimension.
    #[must_use]
    pub const fn dimension_384() -> Self {
        Self(VECTOR_DIMENSION_384)
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Validates dimension and rejects NaN or infinite components.
    pub fn validate_embedding(&self, vector: &[f32]) -> Result<(), VectorError> {
        self.validate_vector(vector)?;
        if let Some(position) = vector.iter().position(|v| !v.is_finite()) {
            return Err(VectorError::NonFiniteComponent { position });
        }
        Ok(())
    }
}

impl TryFrom<usize> for VectorDimension {
    type Error = VectorError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VectorDimension> for usize {
    fn from(value: VectorDimension) -> Self {
        value.0
    }
}

impl std::fmt::Display for VectorDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One ranked hit: the article and its cosine similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub article_id: ArticleId,
    pub score: Score,
}

impl SearchResult {
    #[must_use]
    pub fn new(article_id: ArticleId, score: Score) -> Self {
        Self { article_id, score }
    }

    /// Ranking order: higher score first, then ascending article id.
    #[must_use]
    pub fn rank_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.article_id.cmp(&other.article_id))
    }
}

/// Errors that can occur during vector operations.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error(
        "Embedding contains a non-finite value at position {position}\nSuggestion: Check the embedding model output for NaN or infinity"
    )]
    NonFiniteComponent { position: usize },

    #[error("Storage error: {0}\nSuggestion: Check disk space and file permissions")]
    Storage(#[from] std::io::Error),

    #[error(
        "Embedding generation failed: {0}\nSuggestion: Verify the embedding model is properly initialized"
    )]
    EmbeddingFailed(String),

    #[error(
        "Clustering failed: {0}\nSuggestion: Ensure sufficient vectors are available for clustering (minimum: k clusters)"
    )]
    ClusteringFailed(String),

    #[error("Query cancelled before completion")]
    Cancelled,

    #[error(
        "Invalid storage version: expected {expected}, got {actual}\nSuggestion: Migrate the storage format or use a compatible version"
    )]
    VersionMismatch { expected: u32, actual: u32 },
}
