//! Exit codes for CLI operations following Unix conventions.
//!
//! # Exit Code Semantics
//!
//! - `0`: Success - operation completed (an empty result is still success)
//! - `1`: General error - unspecified failure
//! - `2`: Blocking error - the data directory needs attention before retrying
//! - `3-125`: Specific recoverable errors
//! - `126-255`: Reserved by shell

use crate::error::KbError;

/// Standard exit codes for CLI operations.
///
/// These codes follow Unix conventions where 0 indicates success,
/// and non-zero values indicate various error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Operation succeeded (code 0)
    Success = 0,

    /// Unspecified error occurred (code 1)
    GeneralError = 1,

    /// Critical error that should halt automation (code 2)
    BlockingError = 2,

    /// Article or vector not found (code 3)
    NotFound = 3,

    /// Embedding model unavailable or misbehaving (code 4)
    EmbeddingError = 4,

    /// Storage I/O error (code 5)
    IoError = 5,

    /// Configuration error (code 6)
    ConfigError = 6,

    /// Index and store disagree (code 7)
    IndexInconsistent = 7,

    /// Query cancelled or timed out (code 8)
    Interrupted = 8,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl ExitCode {
    /// Determine exit code for a search based on whether anything matched.
    pub fn from_search_results<T>(results: &[T]) -> Self {
        if results.is_empty() {
            ExitCode::NotFound
        } else {
            ExitCode::Success
        }
    }

    /// Convert a `KbError` to the appropriate exit code.
    ///
    /// Maps specific error types to semantic exit codes that scripts
    /// can use to determine appropriate recovery actions.
    pub fn from_error(error: &KbError) -> Self {
        match error {
            KbError::NotFound { .. } | KbError::ArticleNotFound { .. } => ExitCode::NotFound,

            KbError::EmbeddingUnavailable { .. }
            | KbError::DimensionMismatch { .. }
            | KbError::InvalidEmbedding { .. } => ExitCode::EmbeddingError,

            KbError::Storage { .. } | KbError::ArticleSource { .. } => ExitCode::IoError,
            KbError::Config { .. } => ExitCode::ConfigError,
            KbError::IndexInconsistent { .. } => ExitCode::IndexInconsistent,
            KbError::Cancelled | KbError::TimedOut { .. } => ExitCode::Interrupted,

            // Unreadable metadata blocks every further operation
            KbError::Metadata { .. } => ExitCode::BlockingError,

            // Everything else is a general error
            _ => ExitCode::GeneralError,
        }
    }

    /// Check if this exit code indicates a blocking error.
    ///
    /// Blocking errors should halt automation pipelines.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(self, ExitCode::BlockingError)
    }

    /// Check if this exit code indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }

    /// Get a human-readable description of the exit code.
    pub fn description(&self) -> &str {
        match self {
            ExitCode::Success => "Success",
            ExitCode::GeneralError => "General error",
            ExitCode::BlockingError => "Blocking error - automation should halt",
            ExitCode::NotFound => "Not found",
            ExitCode::EmbeddingError => "Embedding error",
            ExitCode::IoError => "I/O error",
            ExitCode::ConfigError => "Configuration error",
            ExitCode::IndexInconsistent => "Index inconsistent",
            ExitCode::Interrupted => "Cancelled or timed out",
        }
    }
}
