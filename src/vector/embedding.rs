//! Embedding generation for article text.
//!
//! [`EmbeddingGenerator`] is the single capability the rest of the crate
//! needs from a model: turn text into fixed-length vectors. Two adapters ship
//! with the crate:
//!
//! - [`FastEmbedGenerator`] runs a local ONNX model through fastembed. The
//!   model is downloaded into the cache directory on first use.
//! - [`HashingEmbedder`] is a deterministic bag-of-words feature hasher. It
//!   needs no download, which makes it suitable for tests and air-gapped
//!   deployments, but it only captures lexical overlap.

use std::path::Path;
use std::sync::Mutex;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::vector::clustering::normalize_vector;
use crate::vector::{VectorDimension, VectorError};

/// Model name selecting the [`HashingEmbedder`].
pub const HASHING_MODEL_NAME: &str = "hashing";

/// Trait for generating embeddings from text.
///
/// Implementations must be thread-safe. Calls may block for a long time
/// (model inference), so async callers run them on the blocking pool.
pub trait EmbeddingGenerator: Send + Sync {
    /// Generate embeddings for multiple texts, one per input in order.
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        self.generate_embeddings(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| VectorError::EmbeddingFailed("model returned no embedding".into()))
    }

    /// Get the dimension of embeddings produced by this generator.
    #[must_use]
    fn dimension(&self) -> VectorDimension;

    /// Stable name recorded in index metadata to detect model changes.
    #[must_use]
    fn model_name(&self) -> String;
}

/// FastEmbed-backed generator.
///
/// The model handle is not `Sync`, so inference is serialized behind a mutex.
pub struct FastEmbedGenerator {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimension: VectorDimension,
}

impl std::fmt::Debug for FastEmbedGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedGenerator")
            .field("model", &self.model_name)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedGenerator {
    /// Loads `model` from `cache_dir`, downloading it on first use.
    ///
    /// # Errors
    /// Returns an error if the model fails to initialize or download.
    pub fn new(
        model: EmbeddingModel,
        cache_dir: &Path,
        show_download_progress: bool,
    ) -> Result<Self, VectorError> {
        let model_name = model_to_string(&model);
        let mut text_model = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(show_download_progress),
        )
        .map_err(|e| VectorError::EmbeddingFailed(
            format!("Failed to initialize embedding model: {e}. Ensure you have internet connection for first-time model download")
        ))?;

        // Probe the output size instead of trusting a lookup table
        let probe = text_model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| VectorError::EmbeddingFailed(format!("Model probe failed: {e}")))?;
        let dimension = probe
            .first()
            .map(Vec::len)
            .ok_or_else(|| VectorError::EmbeddingFailed("Model probe returned nothing".into()))
            .and_then(VectorDimension::new)?;

        tracing::info!("Loaded embedding model {model_name} ({dimension} dimensions)");

        Ok(Self {
            model: Mutex::new(text_model),
            model_name,
            dimension,
        })
    }
}

impl EmbeddingGenerator for FastEmbedGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // fastembed expects owned strings
        let text_strings: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();

        let embeddings = self
            .model
            .lock()
            .map_err(|_| {
                VectorError::EmbeddingFailed(
                    "Failed to acquire embedding model lock - model may be poisoned".to_string(),
                )
            })?
            .embed(text_strings, None)
            .map_err(|e| {
                VectorError::EmbeddingFailed(format!("Failed to generate embeddings: {e}"))
            })?;

        for embedding in &embeddings {
            self.dimension.validate_embedding(embedding)?;
        }

        Ok(embeddings)
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed (FNV-1a) to a bucket and a
/// sign; the bucket counts are L2-normalized. Texts sharing words point in
/// similar directions. Texts with no tokens map to the zero vector.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: VectorDimension,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(dimension: VectorDimension) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let dim = self.dimension.get();
        let mut embedding = vec![0.0f32; dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % dim as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }
        normalize_vector(&mut embedding);
        embedding
    }
}

impl EmbeddingGenerator for HashingEmbedder {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> String {
        format!("{HASHING_MODEL_NAME}-{}", self.dimension)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// Parses a configured model name into a fastembed model.
///
/// Accepts the enum spelling (`AllMiniLML6V2`) and the short hyphenated form
/// (`all-minilm-l6-v2`), case-insensitively.
pub fn parse_embedding_model(model_name: &str) -> Result<EmbeddingModel, VectorError> {
    match model_name.to_lowercase().as_str() {
        "allminilml6v2" | "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "allminilml12v2" | "all-minilm-l12-v2" => Ok(EmbeddingModel::AllMiniLML12V2),
        "bgesmallenv15" | "bge-small-en" => Ok(EmbeddingModel::BGESmallENV15),
        "bgebaseenv15" | "bge-base-en" => Ok(EmbeddingModel::BGEBaseENV15),
        "multilinguale5small" | "multilingual-e5-small" => {
            Ok(EmbeddingModel::MultilingualE5Small)
        }
        _ => Err(VectorError::EmbeddingFailed(format!(
            "Unknown embedding model '{model_name}'. Supported: AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15, BGEBaseENV15, MultilingualE5Small, {HASHING_MODEL_NAME}"
        ))),
    }
}

/// Canonical name for a fastembed model, as stored in metadata.
#[must_use]
pub fn model_to_string(model: &EmbeddingModel) -> String {
    match model {
        EmbeddingModel::AllMiniLML6V2 => "AllMiniLML6V2".to_string(),
        EmbeddingModel::AllMiniLML12V2 => "AllMiniLML12V2".to_string(),
        EmbeddingModel::BGESmallENV15 => "BGESmallENV15".to_string(),
        EmbeddingModel::BGEBaseENV15 => "BGEBaseENV15".to_string(),
        EmbeddingModel::MultilingualE5Small => "MultilingualE5Small".to_string(),
        other => format!("{other:?}"),
    }
}

/// Text that represents an article for embedding: its content, or the title
/// when the content is blank. Returns an empty string when both are blank.
#[must_use]
pub fn create_article_text(title: &str, content: &str) -> String {
    if content.trim().is_empty() {
        title.trim().to_string()
    } else {
        content.to_string()
    }
}

/// Scriptable embedder for unit tests.
///
/// Texts registered with [`set`](Self::set) return the given vector; other
/// texts fall back to the hashing embedder. Failures can be switched on.
#[cfg(test)]
pub struct MockEmbeddingGenerator {
    dimension: VectorDimension,
    fallback: HashingEmbedder,
    scripted: Mutex<std::collections::HashMap<String, Vec<f32>>>,
    failing: std::sync::atomic::AtomicBool,
    calls: std::sync::atomic::AtomicUsize,
    name: Mutex<String>,
}

#[cfg(test)]
impl MockEmbeddingGenerator {
    #[must_use]
    pub fn with_dimension(dimension: VectorDimension) -> Self {
        Self {
            dimension,
            fallback: HashingEmbedder::new(dimension),
            scripted: Mutex::new(std::collections::HashMap::new()),
            failing: std::sync::atomic::AtomicBool::new(false),
            calls: std::sync::atomic::AtomicUsize::new(0),
            name: Mutex::new("mock".to_string()),
        }
    }

    pub fn set(&self, text: &str, embedding: Vec<f32>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(text.to_string(), embedding);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_model_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl EmbeddingGenerator for MockEmbeddingGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(VectorError::EmbeddingFailed("mock failure".to_string()));
        }
        let scripted = self.scripted.lock().unwrap();
        texts
            .iter()
            .map(|text| match scripted.get(*text) {
                Some(v) => Ok(v.clone()),
                None => self.fallback.embed(text),
            })
            .collect()
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> String {
        self.name.lock().unwrap().clone()
    }
}
