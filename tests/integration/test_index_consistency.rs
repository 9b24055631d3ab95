//! The index answers exactly like a brute-force scan of the live articles,
//! across incremental mutations, rebuilds and concurrent use.

use std::collections::BTreeMap;

use kbsearch::vector::brute_force_top_k;
use kbsearch::{ArticleId, ArticleText, KnowledgeIndex, SearchFilters, SearchResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::common::{ScriptedEmbedder, id, open};

const DIMENSION: usize = 8;

fn random_vector(rng: &mut StdRng, centers: &[Vec<f32>]) -> Vec<f32> {
    let center = &centers[rng.random_range(0..centers.len())];
    center
        .iter()
        .map(|c| *c + rng.random_range(-0.1f32..0.1))
        .collect()
}

fn expected(
    live: &BTreeMap<ArticleId, Vec<f32>>,
    query: &[f32],
    k: usize,
) -> Vec<SearchResult> {
    brute_force_top_k(
        live.iter().map(|(id, v)| (*id, v.as_slice(), None)),
        query,
        k,
        &SearchFilters::default(),
    )
}

async fn assert_matches_brute_force(
    index: &KnowledgeIndex,
    live: &BTreeMap<ArticleId, Vec<f32>>,
    rng: &mut StdRng,
    centers: &[Vec<f32>],
) {
    for k in [1, 5, 20] {
        for _ in 0..10 {
            let query = random_vector(rng, centers);
            let results = index
                .search(query.clone(), Some(k), SearchFilters::default())
                .await
                .unwrap();
            assert_eq!(results, expected(live, &query, k), "k = {k}");
        }
    }
}

#[tokio::test]
async fn test_mutations_and_rebuild_match_brute_force() {
    let dir = TempDir::new().unwrap();
    let embedder = ScriptedEmbedder::new(DIMENSION, "scripted-8");
    let index = open(&dir, &embedder).await;

    let mut rng = StdRng::seed_from_u64(42);
    let centers: Vec<Vec<f32>> = (0..6)
        .map(|_| (0..DIMENSION).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();
    let mut live: BTreeMap<ArticleId, Vec<f32>> = BTreeMap::new();

    for step in 0..400u64 {
        let article = id(rng.random_range(1..=150u64));
        if rng.random_bool(0.2) {
            index.remove(article).await.unwrap();
            live.remove(&article);
        } else {
            let text = format!("article {article} step {step}");
            let vector = random_vector(&mut rng, &centers);
            embedder.set(&text, vector.clone());
            index
                .upsert(&ArticleText::new(article, "", text))
                .await
                .unwrap();
            live.insert(article, vector);
        }
    }
    assert_matches_brute_force(&index, &live, &mut rng, &centers).await;

    let stats = index.rebuild().await.unwrap();
    assert_eq!(stats.entries, live.len());
    assert!(!stats.flat);
    assert!(stats.partitions > 1);
    assert_matches_brute_force(&index, &live, &mut rng, &centers).await;

    assert_eq!(index.verify().await.unwrap(), live.len());
    index.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_readers_and_rebuilds() {
    let dir = TempDir::new().unwrap();
    let embedder = ScriptedEmbedder::new(DIMENSION, "scripted-8");
    let index = open(&dir, &embedder).await;

    let mut rng = StdRng::seed_from_u64(7);
    let centers: Vec<Vec<f32>> = (0..4)
        .map(|_| (0..DIMENSION).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();

    // Each writer owns a disjoint id range; the last write per id wins
    let mut plans: Vec<Vec<(ArticleId, String)>> = Vec::new();
    let mut live: BTreeMap<ArticleId, Vec<f32>> = BTreeMap::new();
    for writer in 0..4u64 {
        let mut plan = Vec::new();
        for round in 0..3u64 {
            for n in 1..=20u64 {
                let article = id(writer * 100 + n);
                let text = format!("writer {writer} article {n} round {round}");
                let vector = random_vector(&mut rng, &centers);
                embedder.set(&text, vector.clone());
                live.insert(article, vector);
                plan.push((article, text));
            }
        }
        plans.push(plan);
    }

    let mut handles = Vec::new();
    for plan in plans {
        let index = index.clone();
        handles.push(tokio::spawn(async move {
            for (article, text) in plan {
                index
                    .upsert(&ArticleText::new(article, "", text))
                    .await
                    .unwrap();
            }
        }));
    }
    for reader in 0..4u64 {
        let index = index.clone();
        let query: Vec<f32> = centers[reader as usize].clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                let results = index
                    .search(query.clone(), Some(10), SearchFilters::default())
                    .await
                    .unwrap();
                assert!(results.len() <= 10);
                assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
                tokio::task::yield_now().await;
            }
        }));
    }
    let rebuilder = {
        let index = index.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                index.rebuild().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    handles.push(rebuilder);

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(index.verify().await.unwrap(), live.len());
    for center in &centers {
        let results = index
            .search(center.clone(), Some(15), SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(results, expected(&live, center, 15));
    }
    index.shutdown().await.unwrap();
}
