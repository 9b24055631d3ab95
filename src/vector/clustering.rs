//! Spherical K-means clustering used to partition the similarity index.
//!
//! This module provides a pure Rust implementation of K-means clustering
//! over article embeddings. It uses cosine similarity as the distance
//! metric and K-means++ for centroid initialization.
//!
//! # Algorithm Details
//! - Distance metric: Cosine similarity (not Euclidean)
//! - Initialization: K-means++ from a caller-provided seed, so the same
//!   corpus always yields the same partitions
//! - Max iterations: 50
//! - Convergence tolerance: 1e-4
//!
//! # Performance Characteristics
//! - O(n * k * d * iterations) time complexity
//! - O(k * d) space for centroids
//! - Assignment step runs in parallel on the rayon pool

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

use crate::vector::types::ClusterId;

/// Maximum number of iterations for K-means clustering.
const MAX_ITERATIONS: usize = 50;

/// Convergence tolerance for centroid updates.
const CONVERGENCE_TOLERANCE: f32 = 1e-4;

/// Epsilon for floating-point comparisons.
const EPSILON: f32 = 1e-10;

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Unit-length centroids, one per cluster.
    pub centroids: Vec<Vec<f32>>,

    /// Cluster assignment for each input vector.
    pub assignments: Vec<ClusterId>,

    /// Number of iterations until convergence.
    pub iterations: usize,
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Ensure vectors are stored before clustering"
    )]
    EmptyVectorSet,

    #[error("Invalid cluster count: {0}\nSuggestion: Use k between 1 and the number of vectors")]
    InvalidClusterCount(usize),

    #[error(
        "Dimension mismatch in vectors\nSuggestion: Ensure all vectors come from the same embedding model"
    )]
    DimensionMismatch,

    #[error(
        "Failed to initialize centroids\nSuggestion: Check that vectors contain valid floating-point values"
    )]
    InitializationFailed,
}

/// Performs K-means clustering on a set of vectors using cosine similarity.
///
/// # Arguments
/// * `vectors` - Input vectors to cluster (must be non-empty and same dimension)
/// * `k` - Number of clusters (must be >= 1 and <= number of vectors)
/// * `seed` - Seed for centroid initialization
///
/// Fewer than `k` centroids may come back when the input holds fewer than
/// `k` distinct directions; `assignments` always refer to returned centroids.
#[must_use = "clustering results should be used or the computation is wasted"]
pub fn kmeans_clustering(
    vectors: &[&[f32]],
    k: usize,
    seed: u64,
) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }

    if k == 0 || k > vectors.len() {
        return Err(ClusteringError::InvalidClusterCount(k));
    }

    let dimension = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dimension) {
        return Err(ClusteringError::DimensionMismatch);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = initialize_centroids_kmeans_plus_plus(vectors, k, &mut rng)?;
    let mut assignments = vec![ClusterId::new(u32::MAX); vectors.len()];
    let mut iterations = 0;

    loop {
        iterations += 1;

        // Assignment step
        let new_assignments: Vec<ClusterId> = vectors
            .par_iter()
            .map(|vector| assign_to_nearest_centroid(vector, &centroids))
            .collect();

        let converged = new_assignments == assignments;
        assignments = new_assignments;

        if converged || iterations >= MAX_ITERATIONS {
            break;
        }

        // Update step
        let new_centroids = update_centroids(vectors, &assignments, centroids.len(), &mut rng);
        let centroid_movement = calculate_centroid_movement(&centroids, &new_centroids);
        centroids = new_centroids;

        if centroid_movement < CONVERGENCE_TOLERANCE {
            // Centroids moved, so refresh assignments one last time.
            assignments = vectors
                .par_iter()
                .map(|vector| assign_to_nearest_centroid(vector, &centroids))
                .collect();
            break;
        }
    }

    if iterations >= MAX_ITERATIONS {
        tracing::debug!("K-means did not fully converge after {MAX_ITERATIONS} iterations");
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

/// Assigns a vector to the nearest centroid based on cosine similarity.
///
/// Ties go to the lower cluster index.
pub fn assign_to_nearest_centroid<C: AsRef<[f32]>>(vector: &[f32], centroids: &[C]) -> ClusterId {
    let mut best_similarity = f32::NEG_INFINITY;
    let mut best_cluster = 0;

    for (i, centroid) in centroids.iter().enumerate() {
        let similarity = cosine_similarity(vector, centroid.as_ref());
        if similarity > best_similarity {
            best_similarity = similarity;
            best_cluster = i;
        }
    }

    ClusterId::new(best_cluster as u32)
}

/// Recomputes centroids as the normalized mean of their members.
fn update_centroids(
    vectors: &[&[f32]],
    assignments: &[ClusterId],
    k: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    let dimension = vectors[0].len();
    let mut new_centroids = vec![vec![0.0; dimension]; k];
    let mut cluster_sizes = vec![0usize; k];

    for (vector, cluster_id) in vectors.iter().zip(assignments.iter()) {
        let cluster_idx = cluster_id.index();
        let norm = l2_norm(vector);
        if norm <= EPSILON {
            cluster_sizes[cluster_idx] += 1;
            continue;
        }
        // Average unit vectors so long vectors do not dominate the direction
        for (sum, &value) in new_centroids[cluster_idx].iter_mut().zip(vector.iter()) {
            *sum += value / norm;
        }
        cluster_sizes[cluster_idx] += 1;
    }

    for (centroid, &size) in new_centroids.iter_mut().zip(cluster_sizes.iter()) {
        if size == 0 || l2_norm(centroid) <= EPSILON {
            // Empty cluster: reseed from a random member
            let random_idx = rng.random_range(0..vectors.len());
            *centroid = normalized(vectors[random_idx]);
        } else {
            normalize_vector(centroid);
        }
    }

    new_centroids
}

/// Computes cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]; a zero vector has similarity 0.0 with
/// everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Dot product of two equal-length slices. For unit vectors this is the
/// cosine similarity.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Angle in radians between two vectors, in [0, PI].
///
/// Computed in f64 with the half-angle form `2 * atan2(|a - b|, |a + b|)`
/// over the normalized inputs, which stays accurate for nearly parallel
/// vectors where `acos(dot)` loses most of its precision. A zero vector is
/// treated as pointing anywhere, so its angle to everything is PI.
pub fn angle_between(a: &[f32], b: &[f32]) -> f64 {
    let norm_a = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return std::f64::consts::PI;
    }

    let mut diff = 0.0;
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = f64::from(*x) / norm_a;
        let y = f64::from(*y) / norm_b;
        diff += (x - y).powi(2);
        sum += (x + y).powi(2);
    }
    2.0 * diff.sqrt().atan2(sum.sqrt())
}

/// Euclidean length of a vector.
pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Initializes centroids using the K-means++ algorithm.
///
/// K-means++ selects initial centroids that are far apart, leading to
/// better convergence properties than random initialization.
fn initialize_centroids_kmeans_plus_plus(
    vectors: &[&[f32]],
    k: usize,
    rng: &mut StdRng,
) -> Result<Vec<Vec<f32>>, ClusteringError> {
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);

    let first_idx = rng.random_range(0..vectors.len());
    centroids.push(normalized(vectors[first_idx]));

    for _ in 1..k {
        let distances: Vec<f32> = vectors
            .par_iter()
            .map(|vector| {
                let min_distance = centroids
                    .iter()
                    .map(|centroid| 1.0 - cosine_similarity(vector, centroid))
                    .fold(f32::MAX, f32::min)
                    .max(0.0);
                min_distance * min_distance
            })
            .collect();
        let total_distance: f32 = distances.iter().sum();

        if total_distance < EPSILON {
            // Every remaining point coincides with a chosen centroid
            break;
        }

        let target = rng.random::<f32>() * total_distance;
        let mut cumulative = 0.0;
        let mut chosen = vectors.len() - 1;
        for (i, &distance) in distances.iter().enumerate() {
            cumulative += distance;
            if cumulative >= target && distance > 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(normalized(vectors[chosen]));
    }

    if centroids.is_empty() {
        return Err(ClusteringError::InitializationFailed);
    }

    Ok(centroids)
}

/// Calculates the mean movement of centroids between iterations.
fn calculate_centroid_movement(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new.iter())
        .map(|(old_c, new_c)| 1.0 - cosine_similarity(old_c, new_c))
        .sum::<f32>()
        / old.len() as f32
}

/// Normalizes a vector in-place to unit length.
///
/// Vectors with (near) zero length are left untouched.
pub fn normalize_vector(vector: &mut [f32]) {
    let norm = l2_norm(vector);
    if norm > EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Creates a normalized copy of a vector.
pub fn normalized(vector: &[f32]) -> Vec<f32> {
    let mut copy = vector.to_vec();
    normalize_vector(&mut copy);
    copy
}
