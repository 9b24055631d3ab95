//! End-to-end behaviour of the knowledge index through its public handle.

use kbsearch::{
    ArticleEvent, ArticleState, ArticleText, CategoryId, KbError, RemoveOutcome, SearchFilters,
    UpsertOutcome,
};
use tempfile::TempDir;

use crate::common::{ScriptedEmbedder, id, ids, open};

fn scripted() -> std::sync::Arc<ScriptedEmbedder> {
    let embedder = ScriptedEmbedder::new(2, "scripted-2");
    embedder.set("alpha", vec![1.0, 0.0]);
    embedder.set("beta", vec![0.0, 1.0]);
    embedder.set("gamma", vec![0.7, 0.7]);
    embedder.set("which is like alpha", vec![1.0, 0.0]);
    embedder
}

async fn seed(index: &kbsearch::KnowledgeIndex) {
    for (n, text) in [(1, "alpha"), (2, "beta"), (3, "gamma")] {
        index
            .upsert(&ArticleText::new(id(n), "", text))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_three_article_ranking() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;
    seed(&index).await;

    let results = index
        .search(vec![1.0f32, 0.0], Some(2), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec![1, 3]);
    assert!((results[0].score.get() - 1.0).abs() < 1e-6);
    assert!((results[1].score.get() - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-3);

    // Text queries go through the same embedder
    let by_text = index
        .search("which is like alpha", Some(2), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(by_text, results);

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deleted_article_is_never_returned() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;
    seed(&index).await;

    let state = index.apply(ArticleEvent::Deleted { id: id(2) }).await.unwrap();
    assert_eq!(state, ArticleState::Absent);

    for query in [vec![0.0f32, 1.0], vec![1.0, 0.0], vec![-1.0, 1.0]] {
        let results = index
            .search(query, Some(10), SearchFilters::default())
            .await
            .unwrap();
        assert!(!ids(&results).contains(&2));
        assert_eq!(results.len(), 2);
    }

    // Deleting again is not an error
    assert_eq!(index.remove(id(2)).await.unwrap(), RemoveOutcome::Absent);
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_category_filter_returns_k_matches() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;

    let support = CategoryId::new(1).unwrap();
    let billing = CategoryId::new(2).unwrap();
    for n in 1..=20u64 {
        let category = if n % 2 == 0 { billing } else { support };
        let article = ArticleText::new(id(n), format!("Article {n}"), format!("topic {n} text"))
            .with_category(category);
        index.upsert(&article).await.unwrap();
    }

    let results = index
        .search(
            "topic 4 text",
            Some(5),
            SearchFilters::category(billing),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.article_id.get() % 2 == 0));

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_min_score_can_return_fewer_than_k() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;
    seed(&index).await;

    let results = index
        .search(
            vec![1.0f32, 0.0],
            Some(3),
            SearchFilters::default().with_min_score(0.9),
        )
        .await
        .unwrap();
    assert_eq!(ids(&results), vec![1]);
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_drive_the_lifecycle() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;

    assert_eq!(index.state(id(7)), ArticleState::Absent);
    let created = ArticleText::new(id(7), "Gamma", "gamma");
    assert_eq!(
        index.apply(ArticleEvent::Created(created.clone())).await.unwrap(),
        ArticleState::Indexed
    );

    // Same text again: nothing is embedded
    let calls = embedder.calls();
    assert_eq!(index.upsert(&created).await.unwrap(), UpsertOutcome::Unchanged);
    assert_eq!(embedder.calls(), calls);

    let updated = ArticleText::new(id(7), "Gamma", "beta");
    index.apply(ArticleEvent::Updated(updated)).await.unwrap();
    let results = index
        .search(vec![0.0f32, 1.0], Some(1), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec![7]);
    assert!((results[0].score.get() - 1.0).abs() < 1e-6);

    // Emptied article leaves the index
    let emptied = ArticleText::new(id(7), "", "");
    assert_eq!(index.upsert(&emptied).await.unwrap(), UpsertOutcome::Removed);
    assert_eq!(index.state(id(7)), ArticleState::Absent);

    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_update_keeps_previous_vector() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;
    seed(&index).await;

    embedder.set_failing(true);
    let error = index
        .upsert(&ArticleText::new(id(1), "", "beta"))
        .await
        .unwrap_err();
    assert!(matches!(error, KbError::EmbeddingUnavailable { attempts: 2, .. }));
    assert_eq!(error.status_code(), "EMBEDDING_UNAVAILABLE");
    assert!(error.is_transient());
    assert_eq!(index.state(id(1)), ArticleState::Failed);

    let results = index
        .search(vec![1.0f32, 0.0], Some(1), SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(ids(&results), vec![1]);

    // Text queries need the embedder too
    assert!(matches!(
        index.search("alpha", Some(1), SearchFilters::default()).await,
        Err(KbError::EmbeddingUnavailable { .. })
    ));
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_query_dimension_is_checked() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;
    seed(&index).await;

    let result = index
        .search(vec![1.0f32, 0.0, 0.0], Some(1), SearchFilters::default())
        .await;
    assert!(matches!(
        result,
        Err(KbError::DimensionMismatch {
            expected: 2,
            actual: 3
        })
    ));
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_report() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;
    seed(&index).await;

    let health = index.health();
    assert_eq!(health.corpus_size, 3);
    assert_eq!(health.indexed, 3);
    assert!(health.consistent);
    assert!(health.flat);
    assert_eq!(health.model, "scripted-2");
    assert_eq!(health.dimension, 2);
    assert_eq!(health.metric, "cosine");
    assert_eq!(health.stale_entries, 0);
    assert!(health.log_bytes > 0);
    assert_eq!(index.verify().await.unwrap(), 3);

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["corpus_size"], 3);
    index.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_operations_after_shutdown_fail() {
    let dir = TempDir::new().unwrap();
    let embedder = scripted();
    let index = open(&dir, &embedder).await;
    seed(&index).await;

    let clone = index.clone();
    index.shutdown().await.unwrap();
    index.shutdown().await.unwrap();

    assert!(matches!(
        clone.search(vec![1.0f32, 0.0], Some(1), SearchFilters::default()).await,
        Err(KbError::ShutDown)
    ));
    assert!(matches!(
        clone.upsert(&ArticleText::new(id(9), "", "alpha")).await,
        Err(KbError::ShutDown)
    ));
    assert!(matches!(clone.rebuild().await, Err(KbError::ShutDown)));
}
