//! Reopening a data directory, and what happens when the model changes.

use std::sync::Arc;

use kbsearch::semantic::SemanticMetadata;
use kbsearch::{
    ArticleSource, ArticleState, ArticleText, JsonArticleSource, KnowledgeIndex, SearchFilters,
};
use tempfile::TempDir;

use crate::common::{ScriptedEmbedder, id, ids, open, test_settings};

fn articles() -> Vec<ArticleText> {
    vec![
        ArticleText::new(id(1), "Reset password", "alpha"),
        ArticleText::new(id(2), "Shipping", "beta"),
        ArticleText::new(id(3), "Refunds", "gamma"),
    ]
}

fn first_model() -> Arc<ScriptedEmbedder> {
    let embedder = ScriptedEmbedder::new(2, "first-model");
    embedder.set("alpha", vec![1.0, 0.0]);
    embedder.set("beta", vec![0.0, 1.0]);
    embedder.set("gamma", vec![0.7, 0.7]);
    embedder
}

async fn populated(dir: &TempDir) -> Vec<kbsearch::SearchResult> {
    let index = open(dir, &first_model()).await;
    let report = index.index_articles(articles(), false).await.unwrap();
    assert_eq!(report.indexed, 3);
    let results = index
        .search(vec![1.0f32, 0.0], Some(3), SearchFilters::default())
        .await
        .unwrap();
    index.shutdown().await.unwrap();
    results
}

#[tokio::test]
async fn test_reopen_yields_same_results() {
    let dir = TempDir::new().unwrap();
    let before = populated(&dir).await;
    assert_eq!(ids(&before), vec![1, 3, 2]);

    let index = open(&dir, &first_model()).await;
    let after = index
        .search(vec![1.0f32, 0.0], Some(3), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(after, before);
    assert_eq!(index.state(id(2)), ArticleState::Indexed);
    assert_eq!(index.health().corpus_size, 3);
    assert_eq!(index.verify().await.unwrap(), 3);
    index.shutdown().await.unwrap();

    let metadata = SemanticMetadata::load(&test_settings(&dir).data_dir).unwrap();
    assert_eq!(metadata.model_name, "first-model");
    assert_eq!(metadata.embedding_count, 3);
}

#[tokio::test]
async fn test_reopen_after_deletes_and_compaction() {
    let dir = TempDir::new().unwrap();
    let index = open(&dir, &first_model()).await;
    for round in 0..5u64 {
        for n in 1..=10u64 {
            let text = format!("round {round} article {n}");
            index
                .upsert(&ArticleText::new(id(n), "", text))
                .await
                .unwrap();
        }
    }
    index.remove(id(4)).await.unwrap();
    let (before, after) = index.compact().unwrap();
    assert!(after < before);
    let query = vec![0.3f32, -0.9];
    let expected = index
        .search(query.clone(), Some(9), SearchFilters::default())
        .await
        .unwrap();
    index.shutdown().await.unwrap();

    let reopened = open(&dir, &first_model()).await;
    assert_eq!(reopened.health().corpus_size, 9);
    let results = reopened
        .search(query, Some(9), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(results, expected);
    assert!(!ids(&results).contains(&4));
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_model_change_without_source_discards_vectors() {
    let dir = TempDir::new().unwrap();
    populated(&dir).await;

    let other = ScriptedEmbedder::new(2, "second-model");
    let index = open(&dir, &other).await;
    let health = index.health();
    assert_eq!(health.corpus_size, 0);
    assert_eq!(health.model, "second-model");
    assert!(
        index
            .search(vec![1.0f32, 0.0], Some(3), SearchFilters::default())
            .await
            .unwrap()
            .is_empty()
    );
    index.shutdown().await.unwrap();

    let metadata = SemanticMetadata::load(&test_settings(&dir).data_dir).unwrap();
    assert_eq!(metadata.model_name, "second-model");
}

#[tokio::test]
async fn test_model_change_with_source_reembeds() {
    let dir = TempDir::new().unwrap();
    populated(&dir).await;

    // The new model sees the texts differently
    let second = ScriptedEmbedder::new(2, "second-model");
    second.set("alpha", vec![0.0, 1.0]);
    second.set("beta", vec![1.0, 0.0]);
    second.set("gamma", vec![-0.7, 0.7]);
    let source: Arc<dyn ArticleSource> = Arc::new(JsonArticleSource::from_articles(articles()));

    let settings = test_settings(&dir);
    let index = KnowledgeIndex::open_with_embedder(&settings, second.clone(), Some(source))
        .await
        .unwrap();
    assert_eq!(index.health().corpus_size, 3);

    let results = index
        .search(vec![1.0f32, 0.0], Some(1), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec![2]);
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dimension_change_is_a_model_change() {
    let dir = TempDir::new().unwrap();
    populated(&dir).await;

    let wider = ScriptedEmbedder::new(3, "first-model");
    let source: Arc<dyn ArticleSource> = Arc::new(JsonArticleSource::from_articles(articles()));
    let settings = test_settings(&dir);
    let index = KnowledgeIndex::open_with_embedder(&settings, wider.clone(), Some(source))
        .await
        .unwrap();

    let health = index.health();
    assert_eq!(health.dimension, 3);
    assert_eq!(health.corpus_size, 3);
    assert_eq!(health.stale_entries, 0);
    assert_eq!(index.verify().await.unwrap(), 3);
    index.shutdown().await.unwrap();
}
