//! Reindexing re-fetches article text and re-embeds it even when unchanged.

use std::sync::Arc;

use kbsearch::{
    ArticleSource, ArticleState, ArticleText, JsonArticleSource, KbError, KnowledgeIndex,
    SearchFilters, UpsertOutcome,
};
use tempfile::TempDir;

use crate::common::{ScriptedEmbedder, id, ids, open, test_settings};

#[tokio::test]
async fn test_reindex_picks_up_new_model_output() {
    let dir = TempDir::new().unwrap();
    let embedder = ScriptedEmbedder::new(2, "scripted-v1");
    embedder.set("billing faq", vec![1.0, 0.0]);
    embedder.set("shipping faq", vec![0.0, 1.0]);

    let source = Arc::new(JsonArticleSource::from_articles([
        ArticleText::new(id(1), "Billing", "billing faq"),
        ArticleText::new(id(2), "Shipping", "shipping faq"),
    ]));
    let settings = test_settings(&dir);
    let index = KnowledgeIndex::open_with_embedder(
        &settings,
        embedder.clone(),
        Some(source.clone() as Arc<dyn ArticleSource>),
    )
    .await
    .unwrap();

    let report = index.index_articles(source.articles(), false).await.unwrap();
    assert_eq!(report.indexed, 2);

    let before = index
        .search(vec![0.0f32, 1.0], Some(1), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(ids(&before), vec![2]);

    // Same text, different vector: a plain upsert would be skipped
    embedder.set("billing faq", vec![0.0, 1.0]);
    let unchanged = index
        .upsert(&ArticleText::new(id(1), "Billing", "billing faq"))
        .await
        .unwrap();
    assert_eq!(unchanged, UpsertOutcome::Unchanged);

    let outcome = index.reindex(id(1)).await.unwrap();
    assert!(matches!(outcome, UpsertOutcome::Indexed { .. }));
    assert_eq!(index.state(id(1)), ArticleState::Indexed);

    let after = index
        .search(vec![1.0f32, 0.0], Some(2), SearchFilters::default())
        .await
        .unwrap();
    assert!(after.iter().all(|r| r.score.get() < 0.5));

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reindex_from_explicit_source() {
    let dir = TempDir::new().unwrap();
    let embedder = ScriptedEmbedder::new(2, "scripted-v1");
    embedder.set("old text", vec![1.0, 0.0]);
    embedder.set("new text", vec![0.0, 1.0]);

    let index = open(&dir, &embedder).await;
    index
        .upsert(&ArticleText::new(id(7), "", "old text"))
        .await
        .unwrap();

    let source = JsonArticleSource::from_articles([ArticleText::new(id(7), "", "new text")]);
    index.reindex_from(id(7), &source).await.unwrap();

    let results = index
        .search(vec![0.0f32, 1.0], Some(1), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec![7]);
    assert!((results[0].score.get() - 1.0).abs() < 1e-5);

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reindex_errors() {
    let dir = TempDir::new().unwrap();
    let embedder = ScriptedEmbedder::new(2, "scripted-v1");
    let index = open(&dir, &embedder).await;

    // No source was given at open
    let result = index.reindex(id(1)).await;
    assert!(matches!(result, Err(KbError::Config { .. })));

    let source = JsonArticleSource::default();
    let result = index.reindex_from(id(3), &source).await;
    assert!(matches!(result, Err(KbError::ArticleNotFound { id: missing }) if missing == id(3)));
    assert_eq!(index.state(id(3)), ArticleState::Absent);

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reindex_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("articles.json");
    std::fs::write(
        &path,
        r#"[{"id": 4, "title": "Returns", "content": "return window", "category_id": 2}]"#,
    )
    .unwrap();

    let embedder = ScriptedEmbedder::new(2, "scripted-v1");
    embedder.set("return window", vec![0.6, 0.8]);
    let index = open(&dir, &embedder).await;

    let source = JsonArticleSource::load(&path).unwrap();
    assert_eq!(source.len(), 1);
    index.reindex_from(id(4), &source).await.unwrap();

    let results = index
        .search(
            vec![0.6f32, 0.8],
            Some(1),
            SearchFilters::category(kbsearch::CategoryId::new(2).unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(ids(&results), vec![4]);

    index.shutdown().await.unwrap();
}
