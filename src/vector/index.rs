//! Partitioned in-memory index answering top-K cosine queries.
//!
//! The index keeps a normalized copy of every stored embedding, grouped into
//! partitions by spherical K-means. Each partition remembers its centroid and
//! its angular radius, the largest angle between the centroid and any member.
//!
//! # Exact pruning
//! By the triangle inequality on the sphere, a member `x` of partition `c`
//! satisfies `angle(q, x) >= angle(q, c) - radius(c)`, so its similarity to
//! the query is at most `cos(max(0, angle(q, c) - radius(c)))`. Partitions are
//! scanned in descending order of that bound and scanning stops as soon as the
//! current k-th best score beats the next bound. Results are identical to a
//! brute-force scan, but clustered corpora skip most partitions.
//!
//! # Rebuild policy
//! - Up to `exact_threshold` entries the index is one flat partition.
//! - Incremental adds go to the nearest centroid and widen its radius;
//!   removals unlink the member. Radii never shrink between rebuilds, which
//!   keeps every bound valid but lets pruning degrade.
//! - [`SimilarityIndex::needs_rebuild`] turns true when the flat index
//!   outgrows its threshold, or when mutations since the last clustering
//!   exceed `rebuild_ratio` of the clustered size (at least
//!   `rebuild_min_mutations`), or deletions exceed `compaction_deletes`.
//!   Rebuilding re-clusters from the vector store and never drops entries.
//!
//! The similarity metric is cosine similarity, fixed for the lifetime of the
//! data directory (see [`METRIC_NAME`]).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::vector::clustering::{
    angle_between, assign_to_nearest_centroid, dot, kmeans_clustering, normalized,
};
use crate::vector::types::{
    ArticleId, CategoryId, ClusterId, Score, SearchResult, VectorDimension, VectorError,
};

/// Name of the one similarity metric the index supports.
pub const METRIC_NAME: &str = "cosine";

/// Allowance for float error when comparing a partition bound against a
/// score. Bounds are computed in f64; scores are f32 dot products.
const BOUND_SLACK: f64 = 1e-4;

/// Tuning knobs for partitioning and the rebuild policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Corpora up to this size stay in a single flat partition.
    pub exact_threshold: usize,
    /// Upper bound on the number of partitions.
    pub max_partitions: usize,
    /// Fraction of the clustered size that may change before re-clustering.
    pub rebuild_ratio: f32,
    /// Minimum mutation budget between re-clusterings.
    pub rebuild_min_mutations: usize,
    /// Deletions since the last clustering that force a rebuild.
    pub compaction_deletes: usize,
    /// Seed for K-means initialization.
    pub kmeans_seed: u64,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            exact_threshold: 1024,
            max_partitions: 256,
            rebuild_ratio: 0.5,
            rebuild_min_mutations: 256,
            compaction_deletes: 4096,
            kmeans_seed: 0x6b62_7365_6172_6368,
        }
    }
}

/// Restricts which stored articles may appear in results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// When non-empty, only articles in one of these categories qualify.
    #[serde(default)]
    pub categories: Vec<CategoryId>,
    /// Drop results scoring below this value. Applied after ranking, so a
    /// high threshold can leave fewer than `k` results.
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl SearchFilters {
    #[must_use]
    pub fn category(category: CategoryId) -> Self {
        Self {
            categories: vec![category],
            min_score: None,
        }
    }

    #[must_use]
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    /// Whether an article with this category is a candidate at all.
    #[must_use]
    pub fn admits(&self, category: Option<CategoryId>) -> bool {
        self.categories.is_empty() || category.is_some_and(|c| self.categories.contains(&c))
    }

    fn passes_threshold(&self, score: Score) -> bool {
        self.min_score.is_none_or(|min| score.get() >= min)
    }
}

/// Cancellation and deadline for one query, checked between partitions.
#[derive(Debug, Clone, Default)]
pub struct QueryGuard {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
    /// Number of checks that pass before the guard trips.
    #[cfg(test)]
    check_budget: Option<Arc<std::sync::atomic::AtomicUsize>>,
}

impl QueryGuard {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[cfg(test)]
    fn with_check_budget(mut self, checks: usize) -> Self {
        self.check_budget = Some(Arc::new(std::sync::atomic::AtomicUsize::new(checks)));
        self
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        #[cfg(test)]
        if let Some(budget) = &self.check_budget {
            use std::sync::atomic::Ordering as AtomicOrdering;
            let spent = budget
                .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                    n.checked_sub(1)
                })
                .is_err();
            if spent {
                return true;
            }
        }
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Counters describing the index shape, exposed through health reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub entries: usize,
    pub partitions: usize,
    pub flat: bool,
    pub mutations_since_build: usize,
    pub deletions_since_build: usize,
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct Member {
    id: ArticleId,
    /// Normalized embedding (left as-is when the embedding is all zeros).
    unit: Arc<[f32]>,
    category: Option<CategoryId>,
}

#[derive(Debug, Clone)]
struct Partition {
    /// `None` for the single partition of a flat index.
    centroid: Option<Vec<f32>>,
    radius: f64,
    members: Vec<Member>,
}

impl Partition {
    fn flat() -> Self {
        Self {
            centroid: None,
            radius: std::f64::consts::PI,
            members: Vec::new(),
        }
    }

    /// Upper bound on the similarity between `query` and any member.
    fn bound(&self, query: &[f32], query_is_zero: bool) -> f64 {
        match &self.centroid {
            Some(centroid) if !query_is_zero => {
                let gap = (angle_between(query, centroid) - self.radius).max(0.0);
                gap.cos()
            }
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    partition: usize,
    offset: usize,
}

/// Exact top-K index over normalized embeddings.
#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    dimension: VectorDimension,
    options: IndexOptions,
    partitions: Vec<Partition>,
    slots: HashMap<ArticleId, Slot>,
    size_at_build: usize,
    mutations_since_build: usize,
    deletions_since_build: usize,
    generation: u64,
}

impl SimilarityIndex {
    /// Creates an empty, flat index.
    #[must_use]
    pub fn new(dimension: VectorDimension, options: IndexOptions) -> Self {
        Self {
            dimension,
            options,
            partitions: Vec::new(),
            slots: HashMap::new(),
            size_at_build: 0,
            mutations_since_build: 0,
            deletions_since_build: 0,
            generation: 0,
        }
    }

    /// Builds an index from scratch over `entries`.
    ///
    /// Entries with the wrong dimension or non-finite values are rejected.
    /// Later duplicates of an id replace earlier ones.
    pub fn build<I>(
        dimension: VectorDimension,
        options: IndexOptions,
        entries: I,
    ) -> Result<Self, VectorError>
    where
        I: IntoIterator<Item = (ArticleId, Arc<[f32]>, Option<CategoryId>)>,
    {
        let mut by_id: HashMap<ArticleId, (Arc<[f32]>, Option<CategoryId>)> = HashMap::new();
        for (id, embedding, category) in entries {
            dimension.validate_embedding(&embedding)?;
            by_id.insert(id, (embedding, category));
        }

        let mut ids: Vec<ArticleId> = by_id.keys().copied().collect();
        ids.sort_unstable();
        let members: Vec<Member> = ids
            .par_iter()
            .map(|id| {
                let (embedding, category) = &by_id[id];
                Member {
                    id: *id,
                    unit: Arc::from(normalized(embedding)),
                    category: *category,
                }
            })
            .collect();

        let mut index = Self::new(dimension, options);
        index.size_at_build = members.len();
        if members.is_empty() {
            return Ok(index);
        }

        if members.len() <= options.exact_threshold {
            let mut partition = Partition::flat();
            partition.members = members;
            index.partitions.push(partition);
        } else {
            index.partitions = cluster_members(members, &options)?;
        }

        for (p, partition) in index.partitions.iter().enumerate() {
            for (offset, member) in partition.members.iter().enumerate() {
                index.slots.insert(
                    member.id,
                    Slot {
                        partition: p,
                        offset,
                    },
                );
            }
        }

        tracing::debug!(
            "Built similarity index: {} entries in {} partitions",
            index.slots.len(),
            index.partitions.len()
        );
        Ok(index)
    }

    /// Carries the generation counter over from a previous index.
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Adds or replaces the vector for `id`.
    pub fn add(
        &mut self,
        id: ArticleId,
        embedding: &[f32],
        category: Option<CategoryId>,
    ) -> Result<(), VectorError> {
        self.dimension.validate_embedding(embedding)?;

        let unit = normalized(embedding);
        if let Some(slot) = self.slots.remove(&id) {
            self.unlink(slot);
        }

        if self.partitions.is_empty() {
            self.partitions.push(Partition::flat());
        }

        let target = if self.is_flat() {
            0
        } else {
            let centroids: Vec<&[f32]> = self
                .partitions
                .iter()
                .map(|p| p.centroid.as_deref().unwrap_or(&[]))
                .collect();
            assign_to_nearest_centroid(&unit, &centroids).index()
        };

        let partition = &mut self.partitions[target];
        if let Some(centroid) = &partition.centroid {
            partition.radius = partition.radius.max(angle_between(&unit, centroid));
        }
        partition.members.push(Member {
            id,
            unit: Arc::from(unit),
            category,
        });
        self.slots.insert(
            id,
            Slot {
                partition: target,
                offset: partition.members.len() - 1,
            },
        );

        self.mutations_since_build += 1;
        self.generation += 1;
        Ok(())
    }

    /// Removes `id`; returns whether it was present.
    pub fn remove(&mut self, id: ArticleId) -> bool {
        let Some(slot) = self.slots.remove(&id) else {
            return false;
        };
        self.unlink(slot);
        self.mutations_since_build += 1;
        self.deletions_since_build += 1;
        self.generation += 1;
        true
    }

    fn unlink(&mut self, slot: Slot) {
        let members = &mut self.partitions[slot.partition].members;
        members.swap_remove(slot.offset);
        if let Some(moved) = members.get(slot.offset) {
            if let Some(moved_slot) = self.slots.get_mut(&moved.id) {
                moved_slot.offset = slot.offset;
            }
        }
    }

    /// Returns up to `k` most similar entries, best first.
    pub fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, VectorError> {
        self.search(query, k, &SearchFilters::default(), &QueryGuard::none())
    }

    /// Filtered, cancellable top-K search.
    ///
    /// Category filters restrict the candidate set before ranking, so `k`
    /// results come back whenever `k` matching entries exist.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
        guard: &QueryGuard,
    ) -> Result<Vec<SearchResult>, VectorError> {
        self.search_with_stats(query, k, filters, guard)
            .map(|(results, _)| results)
    }

    /// Same as [`search`](Self::search), also reporting how many partitions
    /// were scanned.
    pub fn search_with_stats(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
        guard: &QueryGuard,
    ) -> Result<(Vec<SearchResult>, usize), VectorError> {
        self.dimension.validate_embedding(query)?;
        if k == 0 || self.slots.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let unit = normalized(query);
        let query_is_zero = unit.iter().all(|v| *v == 0.0);

        let mut order: Vec<(f64, usize)> = self
            .partitions
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.members.is_empty())
            .map(|(i, p)| (p.bound(&unit, query_is_zero), i))
            .collect();
        order.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut best = TopK::new(k);
        let mut scanned = 0;
        for (bound, p) in order {
            if guard.is_cancelled() {
                return Err(VectorError::Cancelled);
            }
            if let Some(worst) = best.worst_if_full() {
                if bound + BOUND_SLACK < f64::from(worst.get()) {
                    break;
                }
            }
            scanned += 1;
            for member in &self.partitions[p].members {
                if !filters.admits(member.category) {
                    continue;
                }
                let score = Score::from_similarity(dot(&unit, &member.unit));
                best.offer(SearchResult::new(member.id, score));
            }
        }

        let mut results = best.into_sorted();
        results.retain(|r| filters.passes_threshold(r.score));
        Ok((results, scanned))
    }

    /// True when the amortized rebuild policy asks for re-clustering.
    #[must_use]
    pub fn needs_rebuild(&self) -> bool {
        let len = self.slots.len();
        if self.is_flat() {
            return len > self.options.exact_threshold;
        }
        let budget = self
            .options
            .rebuild_min_mutations
            .max((self.size_at_build as f32 * self.options.rebuild_ratio) as usize);
        len <= self.options.exact_threshold / 2
            || self.mutations_since_build > budget
            || self.deletions_since_build > self.options.compaction_deletes
    }

    fn is_flat(&self) -> bool {
        self.partitions.iter().all(|p| p.centroid.is_none())
    }

    #[must_use]
    pub fn contains(&self, id: ArticleId) -> bool {
        self.slots.contains_key(&id)
    }

    /// All indexed ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<ArticleId> {
        let mut ids: Vec<ArticleId> = self.slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.slots.len(),
            partitions: self
                .partitions
                .iter()
                .filter(|p| !p.members.is_empty())
                .count(),
            flat: self.is_flat(),
            mutations_since_build: self.mutations_since_build,
            deletions_since_build: self.deletions_since_build,
            generation: self.generation,
        }
    }
}

fn cluster_members(
    members: Vec<Member>,
    options: &IndexOptions,
) -> Result<Vec<Partition>, VectorError> {
    let k = ((members.len() as f64).sqrt().ceil() as usize).clamp(1, options.max_partitions.max(1));
    let vectors: Vec<&[f32]> = members.iter().map(|m| m.unit.as_ref()).collect();
    let clustering = kmeans_clustering(&vectors, k, options.kmeans_seed)
        .map_err(|e| VectorError::ClusteringFailed(e.to_string()))?;

    let mut partitions: Vec<Partition> = clustering
        .centroids
        .into_iter()
        .map(|centroid| Partition {
            centroid: Some(centroid),
            radius: 0.0,
            members: Vec::new(),
        })
        .collect();

    for (member, cluster) in members.into_iter().zip(clustering.assignments) {
        partitions[cluster.index()].members.push(member);
    }

    partitions.par_iter_mut().for_each(|partition| {
        if let Some(centroid) = &partition.centroid {
            partition.radius = partition
                .members
                .iter()
                .map(|m| angle_between(&m.unit, centroid))
                .fold(0.0, f64::max);
        }
    });

    Ok(partitions)
}

/// Keeps the best `k` results seen so far; the heap top is the worst kept.
struct TopK {
    k: usize,
    heap: BinaryHeap<Ranked>,
}

struct Ranked(SearchResult);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.rank_cmp(&other.0)
    }
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn worst_if_full(&self) -> Option<Score> {
        if self.heap.len() < self.k {
            return None;
        }
        self.heap.peek().map(|r| r.0.score)
    }

    fn offer(&mut self, candidate: SearchResult) {
        if self.heap.len() < self.k {
            self.heap.push(Ranked(candidate));
            return;
        }
        let better = self
            .heap
            .peek()
            .is_some_and(|worst| candidate.rank_cmp(&worst.0) == Ordering::Less);
        if better {
            self.heap.pop();
            self.heap.push(Ranked(candidate));
        }
    }

    fn into_sorted(self) -> Vec<SearchResult> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|r| r.0)
            .collect()
    }
}

/// Reference top-K by exhaustive scan, using exactly the same arithmetic as
/// the index.
pub fn brute_force_top_k<'a, I>(
    entries: I,
    query: &[f32],
    k: usize,
    filters: &SearchFilters,
) -> Vec<SearchResult>
where
    I: IntoIterator<Item = (ArticleId, &'a [f32], Option<CategoryId>)>,
{
    let unit = normalized(query);
    let mut best = TopK::new(k);
    if k == 0 {
        return Vec::new();
    }
    for (id, embedding, category) in entries {
        if !filters.admits(category) {
            continue;
        }
        let score = Score::from_similarity(dot(&unit, &normalized(embedding)));
        best.offer(SearchResult::new(id, score));
    }
    let mut results = best.into_sorted();
    results.retain(|r| filters.passes_threshold(r.score));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn id(n: u64) -> ArticleId {
        ArticleId::new(n).unwrap()
    }

    fn dim(n: usize) -> VectorDimension {
        VectorDimension::new(n).unwrap()
    }

    fn small_options() -> IndexOptions {
        IndexOptions {
            exact_threshold: 32,
            max_partitions: 64,
            rebuild_ratio: 0.5,
            rebuild_min_mutations: 16,
            compaction_deletes: 64,
            kmeans_seed: 11,
        }
    }

    /// Points scattered around `clusters` random directions.
    fn clustered_vectors(n: usize, d: usize, clusters: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let centers: Vec<Vec<f32>> = (0..clusters)
            .map(|_| (0..d).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect();
        (0..n)
            .map(|i| {
                let center = &centers[i % clusters];
                center
                    .iter()
                    .map(|c| *c + rng.random_range(-0.05f32..0.05))
                    .collect()
            })
            .collect()
    }

    fn build_from(vectors: &[Vec<f32>], options: IndexOptions) -> SimilarityIndex {
        let d = vectors[0].len();
        SimilarityIndex::build(
            dim(d),
            options,
            vectors
                .iter()
                .enumerate()
                .map(|(i, v)| (id(i as u64 + 1), Arc::from(v.as_slice()), None)),
        )
        .unwrap()
    }

    fn brute(vectors: &[(ArticleId, Vec<f32>)], query: &[f32], k: usize) -> Vec<SearchResult> {
        brute_force_top_k(
            vectors.iter().map(|(id, v)| (*id, v.as_slice(), None)),
            query,
            k,
            &SearchFilters::default(),
        )
    }

    #[test]
    fn test_three_article_scenario() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(1), &[1.0, 0.0], None).unwrap(); // A
        index.add(id(2), &[0.0, 1.0], None).unwrap(); // B
        index.add(id(3), &[0.7, 0.7], None).unwrap(); // C

        let results = index.top_k(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].article_id, id(1));
        assert!((results[0].score.get() - 1.0).abs() < 1e-6);
        assert_eq!(results[1].article_id, id(3));
        assert!((results[1].score.get() - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-4);
    }

    #[test]
    fn test_removed_entry_never_returned() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(1), &[1.0, 0.0], None).unwrap();
        index.add(id(2), &[0.0, 1.0], None).unwrap();
        index.add(id(3), &[0.7, 0.7], None).unwrap();

        assert!(index.remove(id(2)));
        assert!(!index.remove(id(2)));

        for query in [[0.0, 1.0], [1.0, 0.0], [-1.0, -1.0]] {
            let results = index.top_k(&query, 10).unwrap();
            assert_eq!(results.len(), 2);
            assert!(results.iter().all(|r| r.article_id != id(2)));
        }
    }

    #[test]
    fn test_k_larger_than_corpus_and_zero() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(1), &[1.0, 0.0], None).unwrap();
        index.add(id(2), &[0.0, 1.0], None).unwrap();

        assert_eq!(index.top_k(&[1.0, 1.0], 50).unwrap().len(), 2);
        assert!(index.top_k(&[1.0, 1.0], 0).unwrap().is_empty());

        let empty = SimilarityIndex::new(dim(2), IndexOptions::default());
        assert!(empty.top_k(&[1.0, 1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(9), &[2.0, 0.0], None).unwrap();
        index.add(id(4), &[1.0, 0.0], None).unwrap();
        index.add(id(6), &[5.0, 0.0], None).unwrap();

        let ids: Vec<u64> = index
            .top_k(&[1.0, 0.0], 3)
            .unwrap()
            .iter()
            .map(|r| r.article_id.get())
            .collect();
        assert_eq!(ids, vec![4, 6, 9]);
    }

    #[test]
    fn test_dimension_mismatch_on_query_and_add() {
        let mut index = SimilarityIndex::new(dim(3), IndexOptions::default());
        assert!(matches!(
            index.add(id(1), &[1.0, 0.0], None),
            Err(VectorError::DimensionMismatch { .. })
        ));
        index.add(id(1), &[1.0, 0.0, 0.0], None).unwrap();
        assert!(matches!(
            index.top_k(&[1.0, 0.0], 1),
            Err(VectorError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_add_replaces_existing_vector() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(1), &[1.0, 0.0], None).unwrap();
        index.add(id(2), &[0.6, 0.8], None).unwrap();
        index.add(id(1), &[0.0, 1.0], None).unwrap();

        assert_eq!(index.len(), 2);
        let results = index.top_k(&[1.0, 0.0], 5).unwrap();
        assert_eq!(results[0].article_id, id(2));
        assert_eq!(results.len(), 2);
        assert!(results[1].score.get().abs() < 1e-6);
    }

    #[test]
    fn test_category_filter_restricts_candidates() {
        let books = CategoryId::new(1).unwrap();
        let news = CategoryId::new(2).unwrap();
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(1), &[1.0, 0.0], Some(books)).unwrap();
        index.add(id(2), &[0.9, 0.1], Some(news)).unwrap();
        index.add(id(3), &[0.0, 1.0], Some(books)).unwrap();
        index.add(id(4), &[0.8, 0.2], None).unwrap();

        let results = index
            .search(
                &[1.0, 0.0],
                2,
                &SearchFilters::category(books),
                &QueryGuard::none(),
            )
            .unwrap();
        let ids: Vec<ArticleId> = results.iter().map(|r| r.article_id).collect();
        assert_eq!(ids, vec![id(1), id(3)]);
    }

    #[test]
    fn test_min_score_may_return_fewer_than_k() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(1), &[1.0, 0.0], None).unwrap();
        index.add(id(2), &[0.0, 1.0], None).unwrap();

        let filters = SearchFilters::default().with_min_score(0.5);
        let results = index
            .search(&[1.0, 0.1], 2, &filters, &QueryGuard::none())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].article_id, id(1));
    }

    #[test]
    fn test_cancelled_query() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(1), &[1.0, 0.0], None).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let guard = QueryGuard::none().with_token(token);
        let result = index.search(&[1.0, 0.0], 1, &SearchFilters::default(), &guard);
        assert!(matches!(result, Err(VectorError::Cancelled)));

        let expired = QueryGuard::none().with_deadline(Instant::now());
        let result = index.search(&[1.0, 0.0], 1, &SearchFilters::default(), &expired);
        assert!(matches!(result, Err(VectorError::Cancelled)));
    }

    #[test]
    fn test_cancellation_checked_between_partitions() {
        let vectors = clustered_vectors(2000, 32, 16, 8);
        let index = build_from(&vectors, small_options());
        assert!(index.stats().partitions > 1);
        let filters = SearchFilters::default();

        // One partition scanned, then the guard trips before the next
        let guard = QueryGuard::none().with_check_budget(1);
        let result = index.search(&vectors[5], 5, &filters, &guard);
        assert!(matches!(result, Err(VectorError::Cancelled)));

        // A budget covering every partition never trips
        let guard = QueryGuard::none().with_check_budget(index.stats().partitions);
        let results = index.search(&vectors[5], 5, &filters, &guard).unwrap();
        assert_eq!(results, index.top_k(&vectors[5], 5).unwrap());

        let expired = QueryGuard::none().with_deadline(Instant::now());
        let result = index.search(&vectors[5], 5, &filters, &expired);
        assert!(matches!(result, Err(VectorError::Cancelled)));
    }

    #[test]
    fn test_zero_score_ties_break_by_id() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(2), &[0.0, 1.0], None).unwrap();
        index.add(id(1), &[0.0, -1.0], None).unwrap();

        let results = index.top_k(&[-1.0, 0.0], 2).unwrap();
        let ids: Vec<u64> = results.iter().map(|r| r.article_id.get()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(results.iter().all(|r| r.score.get().to_bits() == 0));
    }

    #[test]
    fn test_partitioned_index_matches_brute_force() {
        let vectors = clustered_vectors(600, 16, 12, 3);
        let index = build_from(&vectors, small_options());
        assert!(!index.stats().flat);
        assert!(index.stats().partitions > 1);

        let labelled: Vec<(ArticleId, Vec<f32>)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (id(i as u64 + 1), v.clone()))
            .collect();

        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..40 {
            let query: Vec<f32> = (0..16).map(|_| rng.random_range(-1.0..1.0)).collect();
            let k = rng.random_range(1..30);
            assert_eq!(index.top_k(&query, k).unwrap(), brute(&labelled, &query, k));
        }
        // Stored vectors as queries exercise the near-parallel case
        for (_, v) in labelled.iter().step_by(37) {
            assert_eq!(index.top_k(v, 7).unwrap(), brute(&labelled, v, 7));
        }
    }

    #[test]
    fn test_incremental_updates_match_brute_force() {
        let vectors = clustered_vectors(300, 8, 6, 5);
        let mut index = build_from(&vectors, small_options());
        let mut live: HashMap<ArticleId, Vec<f32>> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (id(i as u64 + 1), v.clone()))
            .collect();

        let mut rng = StdRng::seed_from_u64(17);
        for step in 0..200 {
            let target = id(rng.random_range(1..400));
            if step % 3 == 0 {
                index.remove(target);
                live.remove(&target);
            } else {
                let v: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0..1.0)).collect();
                index.add(target, &v, None).unwrap();
                live.insert(target, v);
            }
        }

        let labelled: Vec<(ArticleId, Vec<f32>)> = live.into_iter().collect();
        assert_eq!(index.len(), labelled.len());
        for _ in 0..30 {
            let query: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0..1.0)).collect();
            let k = rng.random_range(1..labelled.len() + 5);
            assert_eq!(index.top_k(&query, k).unwrap(), brute(&labelled, &query, k));
        }
    }

    #[test]
    fn test_pruning_skips_far_partitions() {
        let vectors = clustered_vectors(2000, 32, 16, 8);
        let index = build_from(&vectors, small_options());
        let partitions = index.stats().partitions;

        let (results, scanned) = index
            .search_with_stats(
                &vectors[5],
                5,
                &SearchFilters::default(),
                &QueryGuard::none(),
            )
            .unwrap();
        assert_eq!(results.len(), 5);
        assert!(
            scanned < partitions,
            "scanned {scanned} of {partitions} partitions"
        );
    }

    #[test]
    fn test_zero_vectors_are_handled() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        index.add(id(1), &[0.0, 0.0], None).unwrap();
        index.add(id(2), &[1.0, 0.0], None).unwrap();

        let results = index.top_k(&[0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.score.get() == 0.0));
        assert_eq!(results[0].article_id, id(1));

        let results = index.top_k(&[-1.0, 0.0], 2).unwrap();
        assert_eq!(results[0].article_id, id(1));
        assert_eq!(results[1].article_id, id(2));
    }

    #[test]
    fn test_rebuild_policy() {
        let options = small_options();
        let mut index = SimilarityIndex::new(dim(4), options);
        for n in 1..=options.exact_threshold as u64 {
            index.add(id(n), &[n as f32, 1.0, 0.0, 0.5], None).unwrap();
        }
        assert!(!index.needs_rebuild());
        index
            .add(id(1000), &[1.0, 1.0, 1.0, 1.0], None)
            .unwrap();
        assert!(index.needs_rebuild());

        let vectors = clustered_vectors(200, 4, 4, 1);
        let mut clustered = build_from(&vectors, options);
        assert!(!clustered.needs_rebuild());
        for n in 1..=120 {
            clustered.remove(id(n));
        }
        assert!(clustered.needs_rebuild());
    }

    #[test]
    fn test_generation_advances() {
        let mut index = SimilarityIndex::new(dim(2), IndexOptions::default());
        let start = index.generation();
        index.add(id(1), &[1.0, 0.0], None).unwrap();
        index.remove(id(1));
        index.remove(id(1));
        assert_eq!(index.generation(), start + 2);

        let rebuilt = SimilarityIndex::build(dim(2), IndexOptions::default(), Vec::new())
            .unwrap()
            .with_generation(41);
        assert_eq!(rebuilt.generation(), 41);
    }
}
