//! Keeps the similarity index consistent with the vector store as articles
//! change.
//!
//! Every article moves through a small lifecycle:
//!
//! ```text
//! Absent -> Embedding -> Indexed -> Updating -> Indexed
//!                                \-> Removing -> Absent
//! ```
//!
//! plus `Failed` when the embedder gave up. Operations on the same article
//! are serialized by a per-article async mutex, so at most one embedding per
//! article is in flight. Embedding happens before any lock on the store or
//! the index is taken; the store write and the index splice then run back to
//! back while holding a shared rebuild gate. A full rebuild holds the gate
//! exclusively, which pauses writers (never readers) between the store scan
//! and the swap so no mutation is lost.
//!
//! The vector store is the source of truth. When the index cannot follow a
//! store write, or the two are found to disagree, a repair request goes to
//! the background worker, which rebuilds the index from the store.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::articles::{ArticleSource, ArticleText, content_fingerprint};
use crate::error::{KbError, KbResult};
use crate::semantic::embedder::{RetryPolicy, RetryingEmbedder};
use crate::vector::{
    ArticleId, CategoryId, IndexOptions, IndexStats, SimilarityIndex, VectorStore,
};

/// Lifecycle state of one article in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleState {
    /// No vector stored.
    Absent,
    /// First embedding in flight.
    Embedding,
    /// Vector stored and searchable.
    Indexed,
    /// Re-embedding in flight; the previous vector stays searchable.
    Updating,
    /// Removal in progress, or store deletion pending a retry. Hidden from
    /// search either way.
    Removing,
    /// The last embedding attempt failed. Any previous vector is untouched.
    Failed,
}

/// What an upsert ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new vector was written with this store version.
    Indexed { version: u64 },
    /// Content unchanged; nothing was embedded or written.
    Unchanged,
    /// The article had no text, so its vector (if any) was removed.
    Removed,
}

/// What a removal ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Nothing was stored for the article.
    Absent,
    /// Hidden from search, but the store deletion failed and will be retried
    /// in the background.
    Pending,
}

/// Summary of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: Vec<(ArticleId, String)>,
}

/// Work for the background repair worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RepairRequest {
    /// Rebuild unconditionally.
    Rebuild { reason: String },
    /// Rebuild if the amortized policy asks for it.
    MaybeRebuild,
    /// Retry store deletions that failed earlier.
    RetryRemovals,
}

/// Decision taken before embedding.
enum Plan {
    Unchanged,
    /// Same text, different category: rewrite the stored vector.
    Recategorize(Arc<[f32]>),
    Embed,
}

/// Holds the per-article mutex; forgets the mutex once nobody waits on it.
struct ArticleLock<'a> {
    id: ArticleId,
    locks: &'a DashMap<ArticleId, Arc<AsyncMutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ArticleLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Applies article changes to the vector store and the similarity index.
pub struct IndexMaintainer {
    store: Arc<VectorStore>,
    index: Arc<RwLock<SimilarityIndex>>,
    embedder: RetryingEmbedder,
    options: IndexOptions,
    retry: RetryPolicy,
    states: DashMap<ArticleId, ArticleState>,
    fingerprints: DashMap<ArticleId, String>,
    locks: DashMap<ArticleId, Arc<AsyncMutex<()>>>,
    rebuild_gate: AsyncRwLock<()>,
    pending_removals: DashSet<ArticleId>,
    repair_tx: Option<mpsc::Sender<RepairRequest>>,
    /// Set with every forced rebuild request; survives a full repair queue.
    rebuild_requested: AtomicBool,
}

impl std::fmt::Debug for IndexMaintainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexMaintainer")
            .field("stored", &self.store.len())
            .field("indexed", &self.index.read().len())
            .field("pending_removals", &self.pending_removals.len())
            .field("embedder", &self.embedder)
            .finish()
    }
}

impl IndexMaintainer {
    pub(crate) fn new(
        store: Arc<VectorStore>,
        index: Arc<RwLock<SimilarityIndex>>,
        embedder: RetryingEmbedder,
        options: IndexOptions,
        retry: RetryPolicy,
        repair_tx: Option<mpsc::Sender<RepairRequest>>,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            options,
            retry,
            states: DashMap::new(),
            fingerprints: DashMap::new(),
            locks: DashMap::new(),
            rebuild_gate: AsyncRwLock::new(()),
            pending_removals: DashSet::new(),
            repair_tx,
            rebuild_requested: AtomicBool::new(false),
        }
    }

    /// Embeds `text` and stores it as the article's vector.
    ///
    /// Unchanged text is not re-embedded. Blank text removes the article.
    /// On embedding failure the previous vector (if any) stays searchable.
    pub async fn upsert(
        &self,
        id: ArticleId,
        text: &str,
        category: Option<CategoryId>,
    ) -> KbResult<UpsertOutcome> {
        let _lock = self.lock_article(id).await;
        self.upsert_locked(id, text, category, false).await
    }

    /// Removes the article's vector from the store and the index.
    pub async fn remove(&self, id: ArticleId) -> KbResult<RemoveOutcome> {
        let _lock = self.lock_article(id).await;
        self.remove_locked(id).await
    }

    /// Re-fetches the article text and re-embeds it even when unchanged.
    pub async fn reindex(
        &self,
        id: ArticleId,
        source: &dyn ArticleSource,
    ) -> KbResult<UpsertOutcome> {
        let article = source.article(id)?.ok_or(KbError::ArticleNotFound { id })?;
        let _lock = self.lock_article(id).await;
        self.upsert_locked(id, &article.embedding_text(), article.category, true)
            .await
    }

    /// Embeds many articles in batches of `batch_size`.
    ///
    /// Later duplicates of an id win. Per-article failures are collected in
    /// the report instead of aborting the import.
    pub async fn index_articles(
        &self,
        articles: Vec<ArticleText>,
        batch_size: usize,
        force: bool,
    ) -> KbResult<ImportReport> {
        let latest: BTreeMap<ArticleId, ArticleText> =
            articles.into_iter().map(|a| (a.id, a)).collect();
        let articles: Vec<ArticleText> = latest.into_values().collect();
        let mut report = ImportReport::default();

        for chunk in articles.chunks(batch_size.max(1)) {
            // Ascending id order, so concurrent imports cannot deadlock
            let mut locks = Vec::with_capacity(chunk.len());
            for article in chunk {
                locks.push(self.lock_article(article.id).await);
            }

            let mut pending = Vec::new();
            for article in chunk {
                let text = article.embedding_text();
                if text.trim().is_empty() {
                    match self.remove_locked(article.id).await {
                        Ok(_) => report.removed += 1,
                        Err(e) => report.failed.push((article.id, e.to_string())),
                    }
                    continue;
                }
                let fingerprint = content_fingerprint(&text);
                match self.plan(article.id, &fingerprint, article.category, force) {
                    Plan::Unchanged => {
                        self.states.remove(&article.id);
                        report.unchanged += 1;
                    }
                    Plan::Recategorize(embedding) => {
                        match self.write(article.id, &embedding, article.category).await {
                            Ok(_) => report.indexed += 1,
                            Err(e) => report.failed.push((article.id, e.to_string())),
                        }
                    }
                    Plan::Embed => {
                        self.begin_embedding(article.id);
                        pending.push((article, text, fingerprint));
                    }
                }
            }

            let texts: Vec<String> = pending.iter().map(|(_, text, _)| text.clone()).collect();
            match self.embedder.embed_batch(texts).await {
                Ok(embeddings) => {
                    for ((article, _, fingerprint), embedding) in pending.into_iter().zip(embeddings)
                    {
                        let result = self.write(article.id, &embedding, article.category).await;
                        match self.finish(article.id, fingerprint, result) {
                            Ok(_) => report.indexed += 1,
                            Err(e) => report.failed.push((article.id, e.to_string())),
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Embedding batch of {} articles failed: {e}", pending.len());
                    for (article, _, _) in pending {
                        self.states.insert(article.id, ArticleState::Failed);
                        report.failed.push((article.id, e.to_string()));
                    }
                }
            }
            drop(locks);
        }

        tracing::info!(
            "Imported articles: {} indexed, {} unchanged, {} removed, {} failed",
            report.indexed,
            report.unchanged,
            report.removed,
            report.failed.len()
        );
        self.maybe_rebuild().await?;
        Ok(report)
    }

    /// Current lifecycle state of the article.
    #[must_use]
    pub fn state(&self, id: ArticleId) -> ArticleState {
        if let Some(state) = self.states.get(&id).map(|s| *s) {
            return state;
        }
        if self.pending_removals.contains(&id) {
            ArticleState::Removing
        } else if self.store.contains(id) {
            ArticleState::Indexed
        } else {
            ArticleState::Absent
        }
    }

    /// Rebuilds the similarity index from the vector store.
    ///
    /// Writers wait for the swap; searches keep using the old index until
    /// then.
    pub async fn rebuild(&self) -> KbResult<IndexStats> {
        let _gate = self.rebuild_gate.write().await;

        let store = Arc::clone(&self.store);
        let hidden: HashSet<ArticleId> = self.pending_removals.iter().map(|id| *id).collect();
        let options = self.options;
        let rebuilt = tokio::task::spawn_blocking(move || {
            SimilarityIndex::build(
                store.dimension(),
                options,
                store
                    .iter_all()
                    .filter(|(id, _)| !hidden.contains(id))
                    .map(|(id, entry)| (id, entry.embedding, entry.category)),
            )
        })
        .await
        .map_err(|e| KbError::General(format!("Index rebuild task failed: {e}")))??;

        let stats = {
            let mut index = self.index.write();
            let generation = index.generation() + 1;
            *index = rebuilt.with_generation(generation);
            index.stats()
        };

        tracing::info!(
            "Rebuilt similarity index: {} entries in {} partitions",
            stats.entries,
            stats.partitions
        );
        Ok(stats)
    }

    /// Rebuilds when the amortized policy asks for it. Returns whether a
    /// rebuild ran.
    pub async fn maybe_rebuild(&self) -> KbResult<bool> {
        if self.index.read().needs_rebuild() {
            self.rebuild().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Checks that the index holds exactly the searchable store entries.
    ///
    /// On divergence a background rebuild is scheduled and
    /// `IndexInconsistent` is returned. Returns the number of entries checked.
    pub async fn verify(&self) -> KbResult<usize> {
        let (missing, extra, checked) = {
            let _gate = self.rebuild_gate.write().await;
            let stored: BTreeSet<ArticleId> = self
                .store
                .iter_all()
                .map(|(id, _)| id)
                .filter(|id| !self.pending_removals.contains(id))
                .collect();
            let indexed: BTreeSet<ArticleId> = self.index.read().ids().into_iter().collect();
            (
                stored.difference(&indexed).count(),
                indexed.difference(&stored).count(),
                stored.len(),
            )
        };

        if missing == 0 && extra == 0 {
            tracing::debug!("Index verified: {checked} entries consistent");
            return Ok(checked);
        }

        let reason = format!(
            "{missing} stored vectors missing from the index, {extra} indexed vectors not in the store"
        );
        tracing::error!("Index inconsistent: {reason}");
        self.schedule(RepairRequest::Rebuild {
            reason: reason.clone(),
        });
        Err(KbError::IndexInconsistent { reason })
    }

    /// Retries failed store deletions. Returns how many are still pending.
    pub async fn retry_pending_removals(&self) -> usize {
        let pending: Vec<ArticleId> = self.pending_removals.iter().map(|id| *id).collect();
        for id in pending {
            let _lock = self.lock_article(id).await;
            if !self.pending_removals.contains(&id) {
                continue;
            }
            match self.store.delete(id) {
                Ok(_) => {
                    self.pending_removals.remove(&id);
                    self.states.remove(&id);
                    tracing::info!("Completed pending removal of article {id}");
                }
                Err(e) => tracing::warn!("Pending removal of article {id} failed again: {e}"),
            }
        }
        self.pending_removals.len()
    }

    #[must_use]
    pub fn pending_removals(&self) -> usize {
        self.pending_removals.len()
    }

    #[must_use]
    pub fn model_name(&self) -> String {
        self.embedder.model_name()
    }

    pub(crate) fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub(crate) fn index(&self) -> &Arc<RwLock<SimilarityIndex>> {
        &self.index
    }

    async fn lock_article(&self, id: ArticleId) -> ArticleLock<'_> {
        let mutex = Arc::clone(self.locks.entry(id).or_default().value());
        let guard = mutex.lock_owned().await;
        ArticleLock {
            id,
            locks: &self.locks,
            guard: Some(guard),
        }
    }

    fn plan(
        &self,
        id: ArticleId,
        fingerprint: &str,
        category: Option<CategoryId>,
        force: bool,
    ) -> Plan {
        if force || self.pending_removals.contains(&id) {
            return Plan::Embed;
        }
        let same_text = self
            .fingerprints
            .get(&id)
            .is_some_and(|known| known.as_str() == fingerprint);
        match self.store.entry(id) {
            Some(entry) if same_text && entry.category == category => Plan::Unchanged,
            Some(entry) if same_text => Plan::Recategorize(entry.embedding),
            _ => Plan::Embed,
        }
    }

    fn begin_embedding(&self, id: ArticleId) {
        let state = if self.store.contains(id) {
            ArticleState::Updating
        } else {
            ArticleState::Embedding
        };
        tracing::debug!("Article {id}: {state:?}");
        self.states.insert(id, state);
    }

    async fn upsert_locked(
        &self,
        id: ArticleId,
        text: &str,
        category: Option<CategoryId>,
        force: bool,
    ) -> KbResult<UpsertOutcome> {
        if text.trim().is_empty() {
            self.remove_locked(id).await?;
            return Ok(UpsertOutcome::Removed);
        }

        let fingerprint = content_fingerprint(text);
        let embedding = match self.plan(id, &fingerprint, category, force) {
            Plan::Unchanged => {
                tracing::debug!("Article {id} unchanged, skipping embedding");
                // The stored vector matches the text, whatever failed before
                self.states.remove(&id);
                return Ok(UpsertOutcome::Unchanged);
            }
            Plan::Recategorize(embedding) => {
                let version = self.write(id, &embedding, category).await?;
                return Ok(UpsertOutcome::Indexed { version });
            }
            Plan::Embed => {
                self.begin_embedding(id);
                match self.embedder.embed(text).await {
                    Ok(embedding) => embedding,
                    Err(e) => {
                        tracing::warn!("Embedding article {id} failed: {e}");
                        self.states.insert(id, ArticleState::Failed);
                        return Err(e);
                    }
                }
            }
        };

        let result = self.write(id, &embedding, category).await;
        let version = self.finish(id, fingerprint, result)?;
        Ok(UpsertOutcome::Indexed { version })
    }

    /// Records the outcome of a store write for an embedded article.
    fn finish(&self, id: ArticleId, fingerprint: String, result: KbResult<u64>) -> KbResult<u64> {
        match result {
            Ok(version) => {
                self.fingerprints.insert(id, fingerprint);
                self.states.remove(&id);
                tracing::debug!("Article {id}: Indexed at version {version}");
                Ok(version)
            }
            // The store took the write; the index catches up on repair
            Err(e @ KbError::IndexInconsistent { .. }) => {
                self.fingerprints.insert(id, fingerprint);
                self.states.remove(&id);
                Err(e)
            }
            Err(e) => {
                self.states.insert(id, ArticleState::Failed);
                Err(e)
            }
        }
    }

    /// Store write followed by the index splice, under the shared gate.
    async fn write(
        &self,
        id: ArticleId,
        embedding: &[f32],
        category: Option<CategoryId>,
    ) -> KbResult<u64> {
        let _gate = self.rebuild_gate.read().await;

        let version = match self.store.put_tagged(id, embedding, category) {
            Ok(version) => version,
            Err(e) => {
                let error = KbError::storage("put")(e);
                // An I/O failure may come after the record reached the log
                if matches!(error, KbError::Storage { .. }) {
                    self.schedule(RepairRequest::Rebuild {
                        reason: format!("store write for article {id} failed: {error}"),
                    });
                }
                return Err(error);
            }
        };
        self.pending_removals.remove(&id);

        let spliced = self.index.write().add(id, embedding, category);
        if let Err(e) = spliced {
            let reason = format!("index update for article {id} failed after store write: {e}");
            tracing::error!("{reason}");
            self.schedule(RepairRequest::Rebuild {
                reason: reason.clone(),
            });
            return Err(KbError::IndexInconsistent { reason });
        }

        if self.index.read().needs_rebuild() {
            self.schedule(RepairRequest::MaybeRebuild);
        }
        Ok(version)
    }

    async fn remove_locked(&self, id: ArticleId) -> KbResult<RemoveOutcome> {
        self.states.insert(id, ArticleState::Removing);
        let _gate = self.rebuild_gate.read().await;

        // Hide it first; the store deletion may need retries
        let was_indexed = self.index.write().remove(id);
        self.fingerprints.remove(&id);

        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.store.delete(id) {
                Ok(deleted) => {
                    self.pending_removals.remove(&id);
                    self.states.remove(&id);
                    tracing::debug!("Article {id}: Absent");
                    return Ok(if deleted || was_indexed {
                        RemoveOutcome::Removed
                    } else {
                        RemoveOutcome::Absent
                    });
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        "Deleting article {id} failed (attempt {attempt}/{max_attempts}): {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Deleting article {id} failed after {max_attempts} attempts, will retry: {e}"
                    );
                }
            }
        }

        self.pending_removals.insert(id);
        self.schedule(RepairRequest::RetryRemovals);
        Ok(RemoveOutcome::Pending)
    }

    fn schedule(&self, request: RepairRequest) {
        let Some(tx) = &self.repair_tx else {
            return;
        };
        if matches!(request, RepairRequest::Rebuild { .. }) {
            self.rebuild_requested.store(true, Ordering::SeqCst);
        }
        match tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(RepairRequest::Rebuild { reason })) => {
                tracing::warn!(
                    "Repair queue full, rebuild ({reason}) runs with the queued requests"
                );
            }
            Err(e) => tracing::debug!("Repair request not queued: {e}"),
        }
    }

    /// Handles a drained set of repair requests.
    pub(crate) async fn repair(&self, requests: &[RepairRequest]) {
        if requests.contains(&RepairRequest::RetryRemovals) || !self.pending_removals.is_empty() {
            let remaining = self.retry_pending_removals().await;
            if remaining > 0 {
                tracing::warn!("{remaining} removals still pending");
            }
        }

        let flagged = self.rebuild_requested.swap(false, Ordering::SeqCst);
        let forced = requests
            .iter()
            .find_map(|r| match r {
                RepairRequest::Rebuild { reason } => Some(reason.as_str()),
                _ => None,
            })
            .or(flagged.then_some("rebuild requested while the repair queue was full"));
        let result = if let Some(reason) = forced {
            tracing::info!("Repairing similarity index: {reason}");
            self.rebuild().await.map(|_| true)
        } else if requests.contains(&RepairRequest::MaybeRebuild) {
            self.maybe_rebuild().await
        } else {
            Ok(false)
        };

        if let Err(e) = result {
            tracing::error!("Index repair failed: {e}");
        }
    }
}

/// Serves repair requests until `shutdown` fires.
pub(crate) async fn run_repair_worker(
    maintainer: Arc<IndexMaintainer>,
    mut requests: mpsc::Receiver<RepairRequest>,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let mut batch = vec![first];
        while let Ok(request) = requests.try_recv() {
            batch.push(request);
        }
        maintainer.repair(&batch).await;
    }
    tracing::debug!("Repair worker stopped");
}
