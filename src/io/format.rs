//! Output formats for CLI commands.
//!
//! JSON output uses one envelope for success and error responses so scripts
//! can branch on `status` and `exit_code` without parsing messages.

use crate::error::KbError;
use crate::io::exit_code::ExitCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text (default)
    Text,
    /// JSON for scripts
    Json,
}

impl OutputFormat {
    /// Create format from JSON flag.
    #[must_use]
    pub fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }

    /// Check if format is JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Standard JSON response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonResponse<T = serde_json::Value>
where
    T: Serialize,
{
    /// Status: "success" or "error"
    pub status: String,

    /// Result code (e.g., "OK", "NOT_FOUND", "EMBEDDING_UNAVAILABLE")
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Actual data payload (only for success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    /// Error details and suggestions (only for errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,

    /// Exit code for shell scripts
    pub exit_code: u8,

    /// Metadata (execution time, version, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

/// Error details for JSON responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Recovery suggestions
    pub suggestions: Vec<String>,
}

/// Response metadata.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Version of the tool
    pub version: String,
    /// Timestamp of the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Execution time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl ResponseMeta {
    #[must_use]
    pub fn now(execution_time_ms: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Some(format_utc_timestamp()),
            execution_time_ms: Some(execution_time_ms),
        }
    }
}

impl<T> JsonResponse<T>
where
    T: Serialize,
{
    /// Create a success response with data.
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            code: "OK".to_string(),
            message: "Operation completed successfully".to_string(),
            data: Some(data),
            error: None,
            exit_code: ExitCode::Success as u8,
            meta: None,
        }
    }

    /// Replace the default message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Add metadata to the response.
    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl JsonResponse<serde_json::Value> {
    /// Create an error response from a `KbError`.
    pub fn from_error(error: &KbError) -> Self {
        Self {
            status: "error".to_string(),
            code: error.status_code(),
            message: error.to_string(),
            data: None,
            error: Some(ErrorDetails {
                suggestions: error
                    .recovery_suggestions()
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            }),
            exit_code: ExitCode::from_error(error) as u8,
            meta: None,
        }
    }
}

/// Format current time as UTC timestamp string.
///
/// Returns a string in the format "YYYY-MM-DD HH:MM:SS UTC".
pub fn format_utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
