//! Articles as seen by the index: the text that gets embedded, the change
//! events that drive maintenance, and the source consulted for reindexing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KbError, KbResult};
use crate::vector::{ArticleId, CategoryId, create_article_text};

/// The parts of an article the index cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleText {
    pub id: ArticleId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "category_id", skip_serializing_if = "Option::is_none")]
    pub category: Option<CategoryId>,
}

impl ArticleText {
    pub fn new(id: ArticleId, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            content: content.into(),
            category: None,
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: CategoryId) -> Self {
        self.category = Some(category);
        self
    }

    /// Text handed to the embedder. Empty when the article has no text.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        create_article_text(&self.title, &self.content)
    }
}

/// SHA-256 of the embedded text, used to skip re-embedding unchanged content.
#[must_use]
pub fn content_fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Change notification from the article store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArticleEvent {
    Created(ArticleText),
    Updated(ArticleText),
    Deleted { id: ArticleId },
}

impl ArticleEvent {
    #[must_use]
    pub fn article_id(&self) -> ArticleId {
        match self {
            Self::Created(article) | Self::Updated(article) => article.id,
            Self::Deleted { id } => *id,
        }
    }
}

/// Read access to the article store, used to re-fetch text on reindex.
pub trait ArticleSource: Send + Sync {
    fn article(&self, id: ArticleId) -> KbResult<Option<ArticleText>>;
}

/// Article source backed by a JSON file holding an array of articles.
///
/// The file is read once; later changes go through [`upsert`](Self::upsert)
/// and [`remove`](Self::remove) and can be written back with
/// [`save`](Self::save).
#[derive(Debug, Default)]
pub struct JsonArticleSource {
    path: Option<PathBuf>,
    articles: RwLock<BTreeMap<ArticleId, ArticleText>>,
}

impl JsonArticleSource {
    /// Loads articles from `path`. Later duplicates of an id win.
    pub fn load(path: impl AsRef<Path>) -> KbResult<Self> {
        let path = path.as_ref();
        let source_error = |reason: String| KbError::ArticleSource {
            path: path.to_path_buf(),
            reason,
        };

        let json = std::fs::read_to_string(path).map_err(|e| source_error(e.to_string()))?;
        let articles: Vec<ArticleText> =
            serde_json::from_str(&json).map_err(|e| source_error(e.to_string()))?;

        let mut source = Self::from_articles(articles);
        source.path = Some(path.to_path_buf());
        Ok(source)
    }

    #[must_use]
    pub fn from_articles(articles: impl IntoIterator<Item = ArticleText>) -> Self {
        Self {
            path: None,
            articles: RwLock::new(articles.into_iter().map(|a| (a.id, a)).collect()),
        }
    }

    /// All articles in ascending id order.
    #[must_use]
    pub fn articles(&self) -> Vec<ArticleText> {
        self.articles.read().values().cloned().collect()
    }

    pub fn upsert(&self, article: ArticleText) {
        self.articles.write().insert(article.id, article);
    }

    pub fn remove(&self, id: ArticleId) -> Option<ArticleText> {
        self.articles.write().remove(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.articles.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.articles.read().is_empty()
    }

    /// Writes the articles back to the file they were loaded from.
    pub fn save(&self) -> KbResult<()> {
        let Some(path) = &self.path else {
            return Err(KbError::General(
                "article source was not loaded from a file".to_string(),
            ));
        };
        let json = serde_json::to_string_pretty(&self.articles())
            .map_err(|e| KbError::General(format!("Failed to serialize articles: {e}")))?;
        std::fs::write(path, json).map_err(|e| KbError::ArticleSource {
            path: path.clone(),
            reason: e.to_string(),
        })
    }
}

impl ArticleSource for JsonArticleSource {
    fn article(&self, id: ArticleId) -> KbResult<Option<ArticleText>> {
        Ok(self.articles.read().get(&id).cloned())
    }
}
