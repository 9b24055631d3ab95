//! Async front for an [`EmbeddingGenerator`] with retry, backoff and
//! per-attempt timeouts.
//!
//! Model inference blocks, so every attempt runs on tokio's blocking pool.
//! A timed-out attempt is abandoned, not aborted: the blocking task finishes
//! in the background and its result is dropped.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{KbError, KbResult};
use crate::vector::{EmbeddingGenerator, VectorDimension, VectorError};

/// How embedding calls are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every further one.
    pub initial_backoff: Duration,
    /// Upper bound for one attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, for `attempt >= 1`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << doublings)
    }
}

#[derive(Clone)]
pub(crate) struct RetryingEmbedder {
    inner: Arc<dyn EmbeddingGenerator>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RetryingEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingEmbedder")
            .field("model", &self.inner.model_name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryingEmbedder {
    pub(crate) fn new(inner: Arc<dyn EmbeddingGenerator>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub(crate) fn dimension(&self) -> VectorDimension {
        self.inner.dimension()
    }

    pub(crate) fn model_name(&self) -> String {
        self.inner.model_name()
    }

    /// Embeds one text.
    pub(crate) async fn embed(&self, text: &str) -> KbResult<Vec<f32>> {
        let mut batch = self.embed_batch(vec![text.to_string()]).await?;
        batch.pop().ok_or_else(|| KbError::EmbeddingUnavailable {
            attempts: 1,
            reason: "model returned no embedding".to_string(),
        })
    }

    /// Embeds a batch, retrying the whole batch on transient failures.
    ///
    /// Output vectors are validated against the model dimension; a wrong
    /// length or a non-finite value is not retried.
    pub(crate) async fn embed_batch(&self, texts: Vec<String>) -> KbResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let texts = Arc::new(texts);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            let inner = Arc::clone(&self.inner);
            let batch = Arc::clone(&texts);
            let task = tokio::task::spawn_blocking(move || {
                let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
                inner.generate_embeddings(&refs)
            });

            match tokio::time::timeout(self.policy.attempt_timeout, task).await {
                Ok(Ok(Ok(embeddings))) => return self.validate(embeddings, texts.len()),
                Ok(Ok(Err(VectorError::EmbeddingFailed(reason)))) => last_failure = reason,
                Ok(Ok(Err(other))) => return Err(other.into()),
                Ok(Err(join_error)) => {
                    last_failure = format!("embedding task failed: {join_error}");
                }
                Err(_) => {
                    last_failure = format!(
                        "attempt timed out after {}ms",
                        self.policy.attempt_timeout.as_millis()
                    );
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.backoff(attempt);
                tracing::warn!(
                    "Embedding attempt {attempt}/{max_attempts} failed: {last_failure}; retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(KbError::EmbeddingUnavailable {
            attempts: max_attempts,
            reason: last_failure,
        })
    }

    fn validate(&self, embeddings: Vec<Vec<f32>>, expected: usize) -> KbResult<Vec<Vec<f32>>> {
        if embeddings.len() != expected {
            return Err(KbError::EmbeddingUnavailable {
                attempts: 1,
                reason: format!(
                    "model returned {} embeddings for {expected} texts",
                    embeddings.len()
                ),
            });
        }
        let dimension = self.inner.dimension();
        for embedding in &embeddings {
            dimension.validate_embedding(embedding)?;
        }
        Ok(embeddings)
    }
}
