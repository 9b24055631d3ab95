//! Query side: embeds the query text and ranks it against the live index.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::SearchConfig;
use crate::error::{KbError, KbResult};
use crate::semantic::embedder::RetryingEmbedder;
use crate::vector::{QueryGuard, SearchFilters, SearchResult, SimilarityIndex, VectorError};

/// What to search for.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// Free text, embedded with the configured model.
    Text(String),
    /// A ready embedding of the index dimension.
    Vector(Vec<f32>),
}

impl From<&str> for SearchQuery {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for SearchQuery {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<f32>> for SearchQuery {
    fn from(vector: Vec<f32>) -> Self {
        Self::Vector(vector)
    }
}

/// Answers top-K queries against the shared similarity index.
#[derive(Debug)]
pub struct SearchService {
    index: Arc<RwLock<SimilarityIndex>>,
    embedder: RetryingEmbedder,
    config: SearchConfig,
}

impl SearchService {
    pub(crate) fn new(
        index: Arc<RwLock<SimilarityIndex>>,
        embedder: RetryingEmbedder,
        config: SearchConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    /// Returns up to `k` articles most similar to `query`, best first.
    ///
    /// `k` defaults to `search.default_k` and is capped at `search.max_k`.
    /// Without an explicit `min_score` the configured threshold applies; a
    /// threshold can leave fewer than `k` results. A blank text query
    /// matches nothing.
    ///
    /// The whole query, embedding included, is bounded by `search.timeout_ms`
    /// and stops early when `cancel` fires.
    pub async fn search(
        &self,
        query: SearchQuery,
        k: Option<usize>,
        mut filters: SearchFilters,
        cancel: Option<CancellationToken>,
    ) -> KbResult<Vec<SearchResult>> {
        let k = k.unwrap_or(self.config.default_k).min(self.config.max_k);
        if filters.min_score.is_none() {
            filters.min_score = self.config.threshold;
        }

        let timeout = self.config.timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let token = cancel.unwrap_or_default();

        let vector = match query {
            SearchQuery::Vector(vector) => vector,
            SearchQuery::Text(text) if text.trim().is_empty() => {
                tracing::debug!("Blank query, nothing to search");
                return Ok(Vec::new());
            }
            SearchQuery::Text(text) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(KbError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(KbError::TimedOut { timeout });
                    }
                    embedded = self.embedder.embed(&text) => embedded?,
                }
            }
        };

        if k == 0 {
            self.index.read().dimension().validate_embedding(&vector)?;
            return Ok(Vec::new());
        }

        let guard = QueryGuard::none()
            .with_token(token.clone())
            .with_deadline(deadline.into_std());
        let index = Arc::clone(&self.index);
        let scan = tokio::task::spawn_blocking(move || {
            let index = index.read();
            index.search_with_stats(&vector, k, &filters, &guard)
        })
        .await
        .map_err(|e| KbError::General(format!("Search task failed: {e}")))?;

        match scan {
            Ok((results, scanned)) => {
                tracing::debug!(
                    "Search returned {} results after scanning {scanned} partitions",
                    results.len()
                );
                Ok(results)
            }
            Err(VectorError::Cancelled) if token.is_cancelled() => Err(KbError::Cancelled),
            Err(VectorError::Cancelled) => Err(KbError::TimedOut { timeout }),
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }
}
