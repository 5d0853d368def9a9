//! Peer clustering and budget recommendations
//!
//! Builds per-user spending profiles (category share of total spend over a
//! trailing window), partitions eligible users with a deterministic k-means,
//! and compares each user's allocation against their cluster centroid to
//! produce per-category budget recommendations.
//!
//! The clusterer is seeded deterministically: profiles are sorted by user id
//! and initial centroids are evenly spaced through the sorted set, so the
//! same input always yields the same partition within a process. k is chosen
//! by silhouette score over a candidate range, with a minimum-cluster-size
//! safeguard against degenerate singleton clusters.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::categories::UNCATEGORIZED;
use crate::config::PipelineConfig;
use crate::models::{BudgetRecommendation, Category, CategoryRecommendation, Expense};

const MAX_KMEANS_ITERATIONS: usize = 100;

/// Per-user category allocation over the trailing window
///
/// Ephemeral: derived from an expense snapshot, fed to clustering, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendingProfile {
    pub user_id: i64,
    /// Total spend over the trailing window
    pub total_spend: f64,
    /// Category name to fraction of total spend, in [0, 1]
    pub category_shares: BTreeMap<String, f64>,
}

/// Build a spending profile from one user's expenses, or None when the user
/// has too little history to cluster
///
/// Only expenses within `(as_of - trailing_window_days, as_of]` count.
/// Uncategorized expenses contribute under the "Uncategorized" name so the
/// shares still sum to one.
pub fn build_profile(
    user_id: i64,
    expenses: &[Expense],
    categories: &[Category],
    as_of: NaiveDate,
    config: &PipelineConfig,
) -> Option<SpendingProfile> {
    let window_start = as_of - chrono::Duration::days(config.trailing_window_days);
    let names: HashMap<i64, &str> = categories
        .iter()
        .filter(|c| c.user_id == user_id)
        .map(|c| (c.id, c.name.as_str()))
        .collect();

    let mut in_window: Vec<&Expense> = expenses
        .iter()
        .filter(|e| e.user_id == user_id && e.date > window_start && e.date <= as_of)
        .collect();
    if in_window.len() < config.min_profile_transactions {
        return None;
    }

    in_window.sort_by_key(|e| e.date);
    let span = (in_window[in_window.len() - 1].date - in_window[0].date).num_days() + 1;
    if span < config.min_profile_span_days {
        return None;
    }

    let mut total = 0.0;
    let mut by_category: BTreeMap<String, f64> = BTreeMap::new();
    for expense in &in_window {
        let name = expense
            .category_id
            .and_then(|id| names.get(&id).copied())
            .unwrap_or(UNCATEGORIZED);
        *by_category.entry(name.to_string()).or_insert(0.0) += expense.amount;
        total += expense.amount;
    }
    if total <= 0.0 {
        return None;
    }

    let category_shares = by_category
        .into_iter()
        .map(|(name, spend)| (name, spend / total))
        .collect();

    Some(SpendingProfile {
        user_id,
        total_spend: total,
        category_shares,
    })
}

/// Outcome of a clustering run
#[derive(Debug, Clone)]
pub enum ClusterOutcome {
    Clustered(ClusterModel),
    /// Too few eligible users to form meaningful peer groups
    InsufficientUsers { eligible: usize, required: usize },
}

impl ClusterOutcome {
    pub fn model(&self) -> Option<&ClusterModel> {
        match self {
            Self::Clustered(m) => Some(m),
            Self::InsufficientUsers { .. } => None,
        }
    }
}

/// A fitted peer-cluster partition
///
/// Recomputed from scratch each invocation; assignments and centroids never
/// update incrementally.
#[derive(Debug, Clone)]
pub struct ClusterModel {
    /// Category universe: union of category names across all profiles
    axis: Vec<String>,
    /// User id to cluster index
    assignments: HashMap<i64, usize>,
    /// Per-cluster mean share vector, parallel to `axis`, unstandardized
    centroid_shares: Vec<Vec<f64>>,
    pub k: usize,
    pub silhouette: f64,
}

impl ClusterModel {
    pub fn cluster_of(&self, user_id: i64) -> Option<usize> {
        self.assignments.get(&user_id).copied()
    }

    /// The centroid's share for a category, 0 when the category is unknown
    fn centroid_share(&self, cluster: usize, category: &str) -> f64 {
        self.axis
            .iter()
            .position(|c| c == category)
            .map_or(0.0, |i| self.centroid_shares[cluster][i])
    }
}

/// Outcome of a recommendation request for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecommendationOutcome {
    Ready(BudgetRecommendation),
    /// The user is not in the cluster model (too little history)
    InsufficientData,
}

/// Deterministic k-means clusterer with silhouette-selected k
#[derive(Debug, Clone)]
pub struct PeerClusterer {
    min_users: usize,
    max_clusters: usize,
    min_cluster_size: usize,
}

impl PeerClusterer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_users: config.min_cluster_users,
            max_clusters: config.max_clusters,
            min_cluster_size: config.min_cluster_size,
        }
    }

    /// Partition the eligible profiles
    ///
    /// `deadline` bounds the silhouette search: once past it, no further k
    /// candidates are tried and the best partition found so far wins. When
    /// the deadline expires before any candidate finishes, the outcome is
    /// `InsufficientUsers` rather than a partial model.
    pub fn cluster(
        &self,
        profiles: &[SpendingProfile],
        deadline: Option<Instant>,
    ) -> ClusterOutcome {
        if profiles.len() < self.min_users {
            return ClusterOutcome::InsufficientUsers {
                eligible: profiles.len(),
                required: self.min_users,
            };
        }

        // Stable ordering drives the deterministic seeding
        let mut ordered: Vec<&SpendingProfile> = profiles.iter().collect();
        ordered.sort_by_key(|p| p.user_id);

        let axis: Vec<String> = ordered
            .iter()
            .flat_map(|p| p.category_shares.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let raw: Vec<Vec<f64>> = ordered
            .iter()
            .map(|p| {
                axis.iter()
                    .map(|c| p.category_shares.get(c).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect();
        let points = standardize(&raw);

        let n = ordered.len();
        let k_max = self.max_clusters.min(n - 1);
        let mut best: Option<(f64, usize, Vec<usize>)> = None;

        for k in 2..=k_max {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    debug!(k, "cluster deadline reached, stopping k search");
                    break;
                }
            }
            let assignments = kmeans(&points, k, deadline);
            let sizes = cluster_sizes(&assignments, k);
            if sizes.iter().any(|&s| s < self.min_cluster_size) {
                debug!(k, ?sizes, "discarding k with undersized cluster");
                continue;
            }
            let score = silhouette(&points, &assignments, k);
            let better = match &best {
                Some((best_score, _, _)) => score > *best_score,
                None => true,
            };
            if better {
                best = Some((score, k, assignments));
            }
        }

        // Every candidate was discarded or the deadline hit early; fall back
        // to the coarsest split rather than returning nothing.
        let (score, k, assignments) = match best {
            Some(found) => found,
            None => {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return ClusterOutcome::InsufficientUsers {
                            eligible: profiles.len(),
                            required: self.min_users,
                        };
                    }
                }
                let assignments = kmeans(&points, 2, deadline);
                let score = silhouette(&points, &assignments, 2);
                (score, 2, assignments)
            }
        };

        let mut centroid_shares = vec![vec![0.0; axis.len()]; k];
        let mut counts = vec![0usize; k];
        for (i, &cluster) in assignments.iter().enumerate() {
            counts[cluster] += 1;
            for (j, v) in raw[i].iter().enumerate() {
                centroid_shares[cluster][j] += v;
            }
        }
        for (cluster, count) in counts.iter().enumerate() {
            if *count > 0 {
                for v in &mut centroid_shares[cluster] {
                    *v /= *count as f64;
                }
            }
        }

        let user_assignments = ordered
            .iter()
            .zip(&assignments)
            .map(|(p, &c)| (p.user_id, c))
            .collect();

        info!(users = n, k, silhouette = score, "peer clusters fitted");
        ClusterOutcome::Clustered(ClusterModel {
            axis,
            assignments: user_assignments,
            centroid_shares,
            k,
            silhouette: score,
        })
    }
}

/// Compare one user's allocation against their cluster centroid
///
/// `recommended_budget` is the centroid share applied to the user's own
/// trailing total spend. `predicted_monthly_expense` comes from the caller
/// (typically the forecast engine, or a window-scaled average when no
/// forecast is available).
pub fn recommend(
    model: &ClusterModel,
    profile: &SpendingProfile,
    predicted_monthly_expense: f64,
) -> RecommendationOutcome {
    let cluster = match model.cluster_of(profile.user_id) {
        Some(c) => c,
        None => return RecommendationOutcome::InsufficientData,
    };

    let mut recommendations = Vec::new();
    for category in &model.axis {
        let current = profile
            .category_shares
            .get(category)
            .copied()
            .unwrap_or(0.0);
        let recommended = model.centroid_share(cluster, category);
        if current == 0.0 && recommended == 0.0 {
            continue;
        }

        let current_percentage = round2(current * 100.0);
        let recommended_percentage = round2(recommended * 100.0);
        let recommended_budget = round2(recommended * profile.total_spend);
        let over_budget = current_percentage > recommended_percentage;
        let deviation = (current_percentage - recommended_percentage).abs();
        let reason = if over_budget {
            format!(
                "You spend {:.1}% of your budget on {}, {:.1} points above similar users ({:.1}%)",
                current_percentage, category, deviation, recommended_percentage
            )
        } else {
            format!(
                "Your {} spending ({:.1}%) is at or below similar users ({:.1}%)",
                category, current_percentage, recommended_percentage
            )
        };

        recommendations.push(CategoryRecommendation {
            category: category.clone(),
            current_percentage,
            recommended_percentage,
            recommended_budget,
            over_budget,
            reason,
        });
    }

    RecommendationOutcome::Ready(BudgetRecommendation {
        predicted_monthly_expense: round2(predicted_monthly_expense),
        recommendations,
    })
}

/// z-score each dimension; zero-variance dimensions pass through centered
fn standardize(raw: &[Vec<f64>]) -> Vec<Vec<f64>> {
    if raw.is_empty() {
        return Vec::new();
    }
    let dims = raw[0].len();
    let n = raw.len() as f64;

    let mut means = vec![0.0; dims];
    for row in raw {
        for (j, v) in row.iter().enumerate() {
            means[j] += v;
        }
    }
    for m in &mut means {
        *m /= n;
    }

    let mut stds = vec![0.0; dims];
    for row in raw {
        for (j, v) in row.iter().enumerate() {
            stds[j] += (v - means[j]) * (v - means[j]);
        }
    }
    for s in &mut stds {
        *s = (*s / n).sqrt();
        if *s < 1e-12 {
            *s = 1.0;
        }
    }

    raw.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(j, v)| (v - means[j]) / stds[j])
                .collect()
        })
        .collect()
}

fn distance_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Lloyd's algorithm with deterministic seeding
///
/// Initial centroids are evenly spaced through the (already sorted) point
/// list. Ties in assignment break toward the lower cluster index.
fn kmeans(points: &[Vec<f64>], k: usize, deadline: Option<Instant>) -> Vec<usize> {
    let n = points.len();
    let mut centroids: Vec<Vec<f64>> = (0..k)
        .map(|i| points[i * (n - 1) / (k - 1).max(1)].clone())
        .collect();
    let mut assignments = vec![0usize; n];

    for _ in 0..MAX_KMEANS_ITERATIONS {
        let mut changed = false;
        for (i, point) in points.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let d = distance_sq(point, centroid);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let dims = points[0].len();
        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (i, &c) in assignments.iter().enumerate() {
            counts[c] += 1;
            for (j, v) in points[i].iter().enumerate() {
                sums[c][j] += v;
            }
        }
        for c in 0..k {
            // An emptied cluster keeps its previous centroid
            if counts[c] > 0 {
                for j in 0..dims {
                    centroids[c][j] = sums[c][j] / counts[c] as f64;
                }
            }
        }

        if let Some(d) = deadline {
            if Instant::now() >= d {
                break;
            }
        }
    }

    assignments
}

fn cluster_sizes(assignments: &[usize], k: usize) -> Vec<usize> {
    let mut sizes = vec![0usize; k];
    for &c in assignments {
        sizes[c] += 1;
    }
    sizes
}

/// Mean silhouette coefficient over all points
fn silhouette(points: &[Vec<f64>], assignments: &[usize], k: usize) -> f64 {
    let n = points.len();
    if n < 2 {
        return 0.0;
    }
    let sizes = cluster_sizes(assignments, k);

    let mut total = 0.0;
    for i in 0..n {
        let own = assignments[i];
        if sizes[own] < 2 {
            continue;
        }

        let mut dist_sums = vec![0.0; k];
        for j in 0..n {
            if i == j {
                continue;
            }
            dist_sums[assignments[j]] += distance_sq(&points[i], &points[j]).sqrt();
        }

        let a = dist_sums[own] / (sizes[own] - 1) as f64;
        let b = (0..k)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| dist_sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        if b.is_finite() {
            let denom = a.max(b);
            if denom > 0.0 {
                total += (b - a) / denom;
            }
        }
    }
    total / n as f64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
