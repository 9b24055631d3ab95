//! Error types for the knowledge-base search engine
//!
//! This module provides the crate-level error type. Lower layers keep their
//! own `thiserror` enums (`VectorError`, `VectorStorageError`) and convert
//! into [`KbError`] at the service boundary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::vector::{ArticleId, VectorError, VectorStorageError};

/// Main error type for index maintenance and search
#[derive(Error, Debug)]
pub enum KbError {
    #[error(
        "Embedding dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all embeddings come from the configured model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding contains a non-finite value at position {position}")]
    InvalidEmbedding { position: usize },

    #[error("Embedding unavailable after {attempts} attempt(s): {reason}")]
    EmbeddingUnavailable { attempts: u32, reason: String },

    #[error("No embedding stored for article {id}")]
    NotFound { id: ArticleId },

    #[error("Article {id} not found in the article source")]
    ArticleNotFound { id: ArticleId },

    #[error("Similarity index is inconsistent with the vector store: {reason}")]
    IndexInconsistent { reason: String },

    #[error("Vector storage failed during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: VectorStorageError,
    },

    #[error("Index metadata error: {reason}")]
    Metadata { reason: String },

    #[error("Failed to read articles from '{path}': {reason}")]
    ArticleSource { path: PathBuf, reason: String },

    #[error("Search was cancelled")]
    Cancelled,

    #[error("Search timed out after {}ms", .timeout.as_millis())]
    TimedOut { timeout: Duration },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Knowledge index has been shut down")]
    ShutDown,

    #[error("{0}")]
    General(String),
}

impl KbError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::InvalidEmbedding { .. } => "INVALID_EMBEDDING",
            Self::EmbeddingUnavailable { .. } => "EMBEDDING_UNAVAILABLE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ArticleNotFound { .. } => "ARTICLE_NOT_FOUND",
            Self::IndexInconsistent { .. } => "INDEX_INCONSISTENT",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Metadata { .. } => "METADATA_ERROR",
            Self::ArticleSource { .. } => "ARTICLE_SOURCE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut { .. } => "TIMED_OUT",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::ShutDown => "SHUT_DOWN",
            Self::General(_) => "GENERAL_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::DimensionMismatch { .. } => vec![
                "The embedding model changed since the data was written",
                "Run 'kbsearch import <articles.json> --force' to re-embed every article",
            ],
            Self::EmbeddingUnavailable { .. } => vec![
                "Check that the embedding model is downloaded and loadable",
                "Raise embedding.max_attempts or embedding.embed_timeout_ms",
            ],
            Self::ArticleNotFound { .. } => vec![
                "Check the article id against the article file passed with --articles",
            ],
            Self::IndexInconsistent { .. } => vec![
                "A background rebuild from the vector store has been scheduled",
                "Run 'kbsearch rebuild' to rebuild immediately",
            ],
            Self::Storage { .. } => vec![
                "Check disk space and permissions in the data directory",
                "Run 'kbsearch compact' to rewrite the vector log",
            ],
            Self::Metadata { .. } => vec![
                "Delete metadata.json to have it regenerated on next open",
            ],
            Self::TimedOut { .. } => vec![
                "Raise search.timeout_ms or lower k",
            ],
            Self::Config { .. } => vec![
                "Run 'kbsearch config' to inspect the effective settings",
                "Run 'kbsearch init --force' to regenerate the settings file",
            ],
            _ => vec![],
        }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable { .. } | Self::Storage { .. } | Self::TimedOut { .. }
        )
    }

    pub(crate) fn storage(operation: &'static str) -> impl FnOnce(VectorStorageError) -> Self {
        move |source| match source {
            VectorStorageError::Vector(e) => e.into(),
            VectorStorageError::NotFound(id) => Self::NotFound { id },
            source => Self::Storage { operation, source },
        }
    }
}

impl From<VectorError> for KbError {
    fn from(error: VectorError) -> Self {
        match error {
            VectorError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            VectorError::NonFiniteComponent { position } => Self::InvalidEmbedding { position },
            VectorError::EmbeddingFailed(reason) => Self::EmbeddingUnavailable {
                attempts: 1,
                reason,
            },
            VectorError::Cancelled => Self::Cancelled,
            VectorError::InvalidDimension { dimension, reason } => Self::Config {
                reason: format!("invalid dimension {dimension}: {reason}"),
            },
            VectorError::Storage(io) => Self::Storage {
                operation: "io",
                source: VectorStorageError::Io(io),
            },
            other => Self::General(other.to_string()),
        }
    }
}

impl From<VectorStorageError> for KbError {
    fn from(error: VectorStorageError) -> Self {
        Self::storage("storage")(error)
    }
}

/// Result type alias for knowledge index operations
pub type KbResult<T> = Result<T, KbError>;
