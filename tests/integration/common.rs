//! Shared fixtures for the knowledge index integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kbsearch::vector::VectorError;
use kbsearch::{
    ArticleId, EmbeddingGenerator, HashingEmbedder, KnowledgeIndex, Settings, VectorDimension,
};
use parking_lot::Mutex;
use tempfile::TempDir;

/// Embedder returning scripted vectors, falling back to feature hashing.
pub struct ScriptedEmbedder {
    dimension: VectorDimension,
    fallback: HashingEmbedder,
    scripted: Mutex<HashMap<String, Vec<f32>>>,
    model_name: String,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new(dimension: usize, model_name: &str) -> Arc<Self> {
        let dimension = VectorDimension::new(dimension).unwrap();
        Arc::new(Self {
            dimension,
            fallback: HashingEmbedder::new(dimension),
            scripted: Mutex::new(HashMap::new()),
            model_name: model_name.to_string(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, text: &str, embedding: Vec<f32>) {
        self.scripted.lock().insert(text.to_string(), embedding);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingGenerator for ScriptedEmbedder {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(VectorError::EmbeddingFailed("scripted failure".to_string()));
        }
        let scripted = self.scripted.lock();
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            match scripted.get(*text) {
                Some(embedding) => out.push(embedding.clone()),
                None => out.extend(self.fallback.generate_embeddings(&[*text])?),
            }
        }
        Ok(out)
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }
}

/// Settings pointing at a fresh data directory, tuned for fast tests.
pub fn test_settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.data_dir = dir.path().join("data");
    settings.embedding.model = "hashing".to_string();
    settings.embedding.max_attempts = 2;
    settings.embedding.backoff_ms = 1;
    settings.embedding.embed_timeout_ms = 5_000;
    settings.embedding.batch_size = 16;
    settings.index.exact_threshold = 8;
    settings.index.rebuild_min_mutations = 16;
    settings
}

pub fn id(n: u64) -> ArticleId {
    ArticleId::new(n).unwrap()
}

pub fn ids(results: &[kbsearch::SearchResult]) -> Vec<u64> {
    results.iter().map(|r| r.article_id.get()).collect()
}

/// Opens an index over `dir` with the scripted embedder and no article source.
pub async fn open(dir: &TempDir, embedder: &Arc<ScriptedEmbedder>) -> KnowledgeIndex {
    let settings = test_settings(dir);
    KnowledgeIndex::open_with_embedder(&settings, embedder.clone(), None)
        .await
        .unwrap()
}
