//! Process-wide handle over one data directory.
//!
//! [`KnowledgeIndex::open`] loads the vector store, checks that it was
//! written by the configured model, builds the similarity index and starts
//! the repair worker. Clones share all state. [`KnowledgeIndex::shutdown`]
//! stops the worker, flushes the store and records metadata; every later
//! call fails with `ShutDown`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::articles::{ArticleEvent, ArticleSource, ArticleText};
use crate::config::Settings;
use crate::error::{KbError, KbResult};
use crate::semantic::embedder::RetryingEmbedder;
use crate::semantic::maintainer::{
    ArticleState, ImportReport, IndexMaintainer, RemoveOutcome, UpsertOutcome, run_repair_worker,
};
use crate::semantic::metadata::SemanticMetadata;
use crate::semantic::search::{SearchQuery, SearchService};
use crate::semantic::build_embedder;
use crate::vector::{
    ArticleId, EmbeddingGenerator, IndexStats, METRIC_NAME, SearchFilters, SearchResult,
    SimilarityIndex, VectorStore,
};

/// Queued repair requests beyond this are dropped; one pending rebuild is
/// as good as many.
const REPAIR_QUEUE_CAPACITY: usize = 16;

/// Snapshot of the index state for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Live vectors in the store.
    pub corpus_size: usize,
    /// Vectors in the similarity index.
    pub indexed: usize,
    /// Bumped on every index mutation and rebuild.
    pub index_version: u64,
    pub partitions: usize,
    pub flat: bool,
    pub mutations_since_build: usize,
    /// Stored vectors from an older model, waiting for re-embedding.
    pub stale_entries: usize,
    pub pending_removals: usize,
    pub model: String,
    pub dimension: usize,
    pub metric: String,
    pub needs_rebuild: bool,
    /// Index and store agree on the number of searchable vectors.
    pub consistent: bool,
    pub log_bytes: u64,
    pub data_dir: PathBuf,
}

struct Inner {
    data_dir: PathBuf,
    batch_size: usize,
    maintainer: Arc<IndexMaintainer>,
    search: SearchService,
    source: Option<Arc<dyn ArticleSource>>,
    metadata: Mutex<SemanticMetadata>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Shared handle to an open knowledge-base index.
#[derive(Clone)]
pub struct KnowledgeIndex {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for KnowledgeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeIndex")
            .field("data_dir", &self.inner.data_dir)
            .field("maintainer", &self.inner.maintainer)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl KnowledgeIndex {
    /// Opens the data directory with the embedding model from `settings`.
    pub async fn open(settings: &Settings) -> KbResult<Self> {
        let embedder = build_embedder(&settings.embedding)?;
        Self::open_with_embedder(settings, embedder, None).await
    }

    /// Opens the data directory with an explicit embedder.
    ///
    /// When the stored vectors came from another model, metric or dimension,
    /// they are discarded. With an article `source` the affected articles
    /// are re-embedded right away; otherwise they stay out of the index
    /// until they are imported again.
    pub async fn open_with_embedder(
        settings: &Settings,
        embedder: Arc<dyn EmbeddingGenerator>,
        source: Option<Arc<dyn ArticleSource>>,
    ) -> KbResult<Self> {
        let data_dir = settings.data_dir.clone();
        let dimension = embedder.dimension();
        let model_name = embedder.model_name();

        let store = Arc::new(
            VectorStore::open(&data_dir, dimension, settings.storage.options())
                .map_err(KbError::storage("open"))?,
        );

        let (metadata, reembed) = reconcile_metadata(&data_dir, &store, &model_name)?;

        let options = settings.index.options();
        let index = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || {
                SimilarityIndex::build(
                    store.dimension(),
                    options,
                    store
                        .iter_all()
                        .map(|(id, entry)| (id, entry.embedding, entry.category)),
                )
            })
            .await
            .map_err(|e| KbError::General(format!("Index build task failed: {e}")))??
        };
        let stats = index.stats();
        tracing::info!(
            "Opened knowledge index at {}: {} vectors, {} partitions, model {model_name}",
            data_dir.display(),
            stats.entries,
            stats.partitions
        );
        let index = Arc::new(RwLock::new(index));

        let retry = settings.embedding.retry_policy();
        let embedder = RetryingEmbedder::new(embedder, retry);
        let (repair_tx, repair_rx) = mpsc::channel(REPAIR_QUEUE_CAPACITY);
        let maintainer = Arc::new(IndexMaintainer::new(
            store,
            Arc::clone(&index),
            embedder.clone(),
            options,
            retry,
            Some(repair_tx),
        ));
        let search = SearchService::new(index, embedder, settings.search.clone());

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_repair_worker(
            Arc::clone(&maintainer),
            repair_rx,
            shutdown.clone(),
        ));

        let handle = Self {
            inner: Arc::new(Inner {
                data_dir,
                batch_size: settings.embedding.batch_size.max(1),
                maintainer,
                search,
                source,
                metadata: Mutex::new(metadata),
                shutdown,
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
            }),
        };

        if !reembed.is_empty() {
            handle.reembed(&reembed).await?;
        }
        handle.save_metadata()?;
        Ok(handle)
    }

    /// Applies one change notification from the article store and returns
    /// the article's resulting state.
    pub async fn apply(&self, event: ArticleEvent) -> KbResult<ArticleState> {
        self.ensure_open()?;
        let id = event.article_id();
        match event {
            ArticleEvent::Created(article) | ArticleEvent::Updated(article) => {
                self.upsert(&article).await?;
            }
            ArticleEvent::Deleted { .. } => {
                self.remove(id).await?;
            }
        }
        Ok(self.state(id))
    }

    pub async fn upsert(&self, article: &ArticleText) -> KbResult<UpsertOutcome> {
        self.ensure_open()?;
        self.inner
            .maintainer
            .upsert(article.id, &article.embedding_text(), article.category)
            .await
    }

    pub async fn remove(&self, id: ArticleId) -> KbResult<RemoveOutcome> {
        self.ensure_open()?;
        self.inner.maintainer.remove(id).await
    }

    /// Embeds and indexes many articles; `force` re-embeds unchanged ones.
    pub async fn index_articles(
        &self,
        articles: Vec<ArticleText>,
        force: bool,
    ) -> KbResult<ImportReport> {
        self.ensure_open()?;
        let report = self
            .inner
            .maintainer
            .index_articles(articles, self.inner.batch_size, force)
            .await?;
        self.save_metadata()?;
        Ok(report)
    }

    /// Top-`k` articles for `query` with the configured timeout.
    pub async fn search(
        &self,
        query: impl Into<SearchQuery>,
        k: Option<usize>,
        filters: SearchFilters,
    ) -> KbResult<Vec<SearchResult>> {
        self.ensure_open()?;
        self.inner.search.search(query.into(), k, filters, None).await
    }

    /// Like [`search`](Self::search), stopping early once `cancel` fires.
    pub async fn search_with_cancel(
        &self,
        query: impl Into<SearchQuery>,
        k: Option<usize>,
        filters: SearchFilters,
        cancel: CancellationToken,
    ) -> KbResult<Vec<SearchResult>> {
        self.ensure_open()?;
        self.inner
            .search
            .search(query.into(), k, filters, Some(cancel))
            .await
    }

    /// Re-embeds the article from the configured article source.
    pub async fn reindex(&self, id: ArticleId) -> KbResult<UpsertOutcome> {
        let Some(source) = self.inner.source.clone() else {
            return Err(KbError::Config {
                reason: "no article source configured for reindexing".to_string(),
            });
        };
        self.reindex_from(id, source.as_ref()).await
    }

    /// Re-embeds the article using text from `source`.
    pub async fn reindex_from(
        &self,
        id: ArticleId,
        source: &dyn ArticleSource,
    ) -> KbResult<UpsertOutcome> {
        self.ensure_open()?;
        self.inner.maintainer.reindex(id, source).await
    }

    #[must_use]
    pub fn state(&self, id: ArticleId) -> ArticleState {
        self.inner.maintainer.state(id)
    }

    /// Rebuilds the similarity index from the vector store.
    pub async fn rebuild(&self) -> KbResult<IndexStats> {
        self.ensure_open()?;
        self.inner.maintainer.rebuild().await
    }

    /// Compares index membership with the store; schedules a repair and
    /// fails with `IndexInconsistent` when they differ.
    pub async fn verify(&self) -> KbResult<usize> {
        self.ensure_open()?;
        self.inner.maintainer.verify().await
    }

    /// Rewrites the vector log without superseded records. Returns the log
    /// size in bytes before and after.
    pub fn compact(&self) -> KbResult<(u64, u64)> {
        self.ensure_open()?;
        let store = self.inner.maintainer.store();
        let before = store.file_size().unwrap_or(0);
        store.compact().map_err(KbError::storage("compact"))?;
        let after = store.file_size().unwrap_or(0);
        tracing::info!("Compacted vector log from {before} to {after} bytes");
        Ok((before, after))
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        let maintainer = &self.inner.maintainer;
        let store = maintainer.store();
        let (stats, needs_rebuild, dimension) = {
            let index = maintainer.index().read();
            (index.stats(), index.needs_rebuild(), index.dimension())
        };
        let pending_removals = maintainer.pending_removals();
        let corpus_size = store.len();

        HealthReport {
            corpus_size,
            indexed: stats.entries,
            index_version: stats.generation,
            partitions: stats.partitions,
            flat: stats.flat,
            mutations_since_build: stats.mutations_since_build,
            stale_entries: store.stale_entries().len(),
            pending_removals,
            model: maintainer.model_name(),
            dimension: dimension.get(),
            metric: METRIC_NAME.to_string(),
            needs_rebuild,
            consistent: stats.entries + pending_removals == corpus_size,
            log_bytes: store.file_size().unwrap_or(0),
            data_dir: self.inner.data_dir.clone(),
        }
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Stops the repair worker, flushes the store and saves metadata.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> KbResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.cancel();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!("Repair worker ended abnormally: {e}");
            }
        }

        self.inner
            .maintainer
            .store()
            .flush()
            .map_err(KbError::storage("flush"))?;
        self.save_metadata()?;
        tracing::info!("Knowledge index shut down");
        Ok(())
    }

    fn ensure_open(&self) -> KbResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(KbError::ShutDown);
        }
        Ok(())
    }

    fn save_metadata(&self) -> KbResult<()> {
        let count = self.inner.maintainer.store().len();
        let mut metadata = self.inner.metadata.lock();
        metadata.update(count);
        metadata.save(&self.inner.data_dir)
    }

    async fn reembed(&self, ids: &[ArticleId]) -> KbResult<()> {
        let Some(source) = self.inner.source.clone() else {
            tracing::warn!(
                "{} articles were embedded with another model and need re-importing",
                ids.len()
            );
            return Ok(());
        };

        let mut articles = Vec::with_capacity(ids.len());
        for id in ids {
            match source.article(*id)? {
                Some(article) => articles.push(article),
                None => tracing::debug!("Article {id} no longer exists, not re-embedding"),
            }
        }
        tracing::info!("Re-embedding {} articles with the new model", articles.len());
        let report = self.index_articles(articles, true).await?;
        if !report.failed.is_empty() {
            tracing::warn!(
                "{} articles could not be re-embedded",
                report.failed.len()
            );
        }
        Ok(())
    }
}

/// Loads or creates the metadata file. When the stored vectors are not
/// comparable with the current model the store is cleared and the affected
/// ids are returned for re-embedding.
fn reconcile_metadata(
    data_dir: &Path,
    store: &VectorStore,
    model_name: &str,
) -> KbResult<(SemanticMetadata, Vec<ArticleId>)> {
    let dimension = store.dimension().get();
    let fresh = || SemanticMetadata::new(model_name.to_string(), dimension, store.len());

    if !SemanticMetadata::exists(data_dir) {
        let stale = store.stale_entries();
        return Ok((fresh(), stale));
    }

    let metadata = SemanticMetadata::load(data_dir)?;
    if metadata.is_compatible(model_name, dimension) {
        return Ok((metadata, store.stale_entries()));
    }

    let mut ids: Vec<ArticleId> = store.iter_all().map(|(id, _)| id).collect();
    ids.extend(store.stale_entries());
    ids.sort_unstable();
    ids.dedup();

    tracing::warn!(
        "Embedding model changed from {} ({}d, {}) to {model_name} ({dimension}d, {METRIC_NAME}); discarding {} stored vectors",
        metadata.model_name,
        metadata.dimension,
        metadata.metric,
        ids.len()
    );
    store.clear().map_err(KbError::storage("clear"))?;
    Ok((fresh(), ids))
}
