//! Configuration module for the knowledge-base search engine.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `KB_` and use double underscores
//! to separate nested levels:
//! - `KB_EMBEDDING__MODEL=hashing` sets `embedding.model`
//! - `KB_SEARCH__MAX_K=50` sets `search.max_k`
//! - `KB_STORAGE__SYNC_WRITES=true` sets `storage.sync_writes`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::semantic::RetryPolicy;
use crate::vector::{IndexOptions, StoreOptions};

/// Directory holding the configuration file and, by default, the data.
pub const CONFIG_DIR_NAME: &str = ".kbsearch";

const CONFIG_FILE_NAME: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory with the vector log and index metadata
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    /// fastembed model name, or "hashing" for the built-in feature hasher
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Output dimension of the hashing model (fastembed models report their own)
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Where downloaded models are cached
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_false")]
    pub show_download_progress: bool,

    /// Texts per embedding call during bulk import
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per embedding before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubles on every further attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Upper bound for a single embedding attempt
    #[serde(default = "default_embed_timeout_ms")]
    pub embed_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexConfig {
    #[serde(default = "default_exact_threshold")]
    pub exact_threshold: usize,

    #[serde(default = "default_max_partitions")]
    pub max_partitions: usize,

    #[serde(default = "default_rebuild_ratio")]
    pub rebuild_ratio: f32,

    #[serde(default = "default_rebuild_min_mutations")]
    pub rebuild_min_mutations: usize,

    #[serde(default = "default_compaction_deletes")]
    pub compaction_deletes: usize,

    #[serde(default = "default_kmeans_seed")]
    pub kmeans_seed: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// fsync the vector log after every write
    #[serde(default = "default_false")]
    pub sync_writes: bool,

    /// Compact when superseded records exceed this multiple of live entries
    #[serde(default = "default_compaction_ratio")]
    pub compaction_ratio: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Requests asking for more results are clamped to this
    #[serde(default = "default_max_k")]
    pub max_k: usize,

    /// Minimum score for results; unset means no threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,

    #[serde(default = "default_search_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default filter when `KB_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable logs
    #[serde(default = "default_false")]
    pub json: bool,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR_NAME).join("data")
}
fn default_false() -> bool {
    false
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}
fn default_dimension() -> usize {
    crate::vector::VECTOR_DIMENSION_384
}
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR_NAME))
        .join("kbsearch")
        .join("models")
}
fn default_batch_size() -> usize {
    64
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    200
}
fn default_embed_timeout_ms() -> u64 {
    30_000
}
fn default_exact_threshold() -> usize {
    IndexOptions::default().exact_threshold
}
fn default_max_partitions() -> usize {
    IndexOptions::default().max_partitions
}
fn default_rebuild_ratio() -> f32 {
    IndexOptions::default().rebuild_ratio
}
fn default_rebuild_min_mutations() -> usize {
    IndexOptions::default().rebuild_min_mutations
}
fn default_compaction_deletes() -> usize {
    IndexOptions::default().compaction_deletes
}
fn default_kmeans_seed() -> u64 {
    IndexOptions::default().kmeans_seed
}
fn default_compaction_ratio() -> f32 {
    StoreOptions::default().compaction_ratio
}
fn default_k() -> usize {
    10
}
fn default_max_k() -> usize {
    100
}
fn default_search_timeout_ms() -> u64 {
    5_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            storage: StorageConfig::default(),
            search: SearchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_dimension(),
            cache_dir: default_cache_dir(),
            show_download_progress: false,
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            embed_timeout_ms: default_embed_timeout_ms(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        let options = IndexOptions::default();
        Self {
            exact_threshold: options.exact_threshold,
            max_partitions: options.max_partitions,
            rebuild_ratio: options.rebuild_ratio,
            rebuild_min_mutations: options.rebuild_min_mutations,
            compaction_deletes: options.compaction_deletes,
            kmeans_seed: options.kmeans_seed,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_writes: false,
            compaction_ratio: default_compaction_ratio(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            threshold: None,
            timeout_ms: default_search_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl EmbeddingConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.backoff_ms),
            attempt_timeout: Duration::from_millis(self.embed_timeout_ms),
        }
    }
}

impl IndexConfig {
    #[must_use]
    pub fn options(&self) -> IndexOptions {
        IndexOptions {
            exact_threshold: self.exact_threshold,
            max_partitions: self.max_partitions.max(1),
            rebuild_ratio: self.rebuild_ratio,
            rebuild_min_mutations: self.rebuild_min_mutations,
            compaction_deletes: self.compaction_deletes,
            kmeans_seed: self.kmeans_seed,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            sync_writes: self.sync_writes,
            compaction_ratio: self.compaction_ratio,
        }
    }
}

impl SearchConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring `KB_` overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels; single underscores
            // stay part of the field name
            .merge(Env::prefixed("KB_").ignore(&["LOG"]).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the nearest `.kbsearch/settings.toml`, searching from the
    /// current directory up to the root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR_NAME);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE_NAME));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments under `root`
    pub fn init_config_file(
        root: impl AsRef<Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = root.as_ref().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let defaults = Settings::default();
        let template = format!(
            r#"# kbsearch configuration file

# Version of the configuration schema
version = 1

# Vector log and index metadata (relative to the working directory)
data_dir = '{data_dir}'

[embedding]
# fastembed model (AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15,
# BGEBaseENV15, MultilingualE5Small) or "hashing" for a download-free
# bag-of-words embedder
model = "{model}"

# Output dimension, only used by the hashing model
dimension = {dimension}

# Model download cache
cache_dir = '{cache_dir}'

# Texts per embedding call during bulk import
batch_size = {batch_size}

# Retry policy for embedding calls
max_attempts = {max_attempts}
backoff_ms = {backoff_ms}
embed_timeout_ms = {embed_timeout_ms}

[index]
# Corpora up to this size use a single exact partition
exact_threshold = {exact_threshold}
max_partitions = {max_partitions}

# Re-cluster after this fraction of the index changed
rebuild_ratio = {rebuild_ratio:?}
rebuild_min_mutations = {rebuild_min_mutations}
compaction_deletes = {compaction_deletes}

[storage]
# fsync after every write (slower, survives power loss)
sync_writes = false
compaction_ratio = {compaction_ratio:?}

[search]
default_k = {default_k}
max_k = {max_k}
timeout_ms = {timeout_ms}

# Minimum similarity for results (0.40 related, 0.60 similar, 0.75 very similar)
# threshold = 0.6

[logging]
# Overridden by the KB_LOG environment variable
level = "info"
json = false
"#,
            data_dir = defaults.data_dir.display(),
            model = defaults.embedding.model,
            dimension = defaults.embedding.dimension,
            cache_dir = defaults.embedding.cache_dir.display(),
            batch_size = defaults.embedding.batch_size,
            max_attempts = defaults.embedding.max_attempts,
            backoff_ms = defaults.embedding.backoff_ms,
            embed_timeout_ms = defaults.embedding.embed_timeout_ms,
            exact_threshold = defaults.index.exact_threshold,
            max_partitions = defaults.index.max_partitions,
            rebuild_ratio = defaults.index.rebuild_ratio,
            rebuild_min_mutations = defaults.index.rebuild_min_mutations,
            compaction_deletes = defaults.index.compaction_deletes,
            compaction_ratio = defaults.storage.compaction_ratio,
            default_k = defaults.search.default_k,
            max_k = defaults.search.max_k,
            timeout_ms = defaults.search.timeout_ms,
        );

        std::fs::write(&config_path, template)?;

        Ok(config_path)
    }
}
