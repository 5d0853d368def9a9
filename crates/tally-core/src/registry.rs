//! Shared model state
//!
//! The registry owns every piece of model state shared across requests: the
//! trained classifier, per-user forecast caches, and the peer-cluster model.
//! Readers grab an `Arc` snapshot and never observe a half-built model; a
//! retrain builds the replacement off to the side and swaps it in atomically
//! only when training actually succeeds. A dedicated retrain lock serializes
//! writers, so concurrent retrain requests queue instead of racing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::classifier::{CategoryClassifier, LabeledExample, TrainOutcome};
use crate::cluster::ClusterModel;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::forecast::ForecastOutcome;

#[derive(Debug, Clone)]
struct CachedForecast {
    computed_at: DateTime<Utc>,
    outcome: ForecastOutcome,
}

#[derive(Debug, Clone)]
struct CachedClusters {
    computed_at: DateTime<Utc>,
    model: Arc<ClusterModel>,
}

/// Registry of shared, read-mostly model state
#[derive(Debug)]
pub struct ModelRegistry {
    classifier: RwLock<Arc<CategoryClassifier>>,
    /// Serializes retrains; held for the whole build-then-swap sequence
    retrain_lock: Mutex<()>,
    last_trained: RwLock<Option<DateTime<Utc>>>,
    forecasts: Mutex<HashMap<i64, CachedForecast>>,
    clusters: Mutex<Option<CachedClusters>>,
    retrain_interval: Duration,
    forecast_max_age: Duration,
    cluster_max_age: Duration,
}

impl ModelRegistry {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_classifier(config, CategoryClassifier::untrained(config))
    }

    /// Start from a caller-supplied classifier (tests substitute fixed models
    /// through this)
    pub fn with_classifier(config: &PipelineConfig, classifier: CategoryClassifier) -> Self {
        Self {
            classifier: RwLock::new(Arc::new(classifier)),
            retrain_lock: Mutex::new(()),
            last_trained: RwLock::new(None),
            forecasts: Mutex::new(HashMap::new()),
            clusters: Mutex::new(None),
            retrain_interval: Duration::hours(config.retrain_interval_hours),
            forecast_max_age: Duration::minutes(config.forecast_cache_max_age_minutes),
            cluster_max_age: Duration::minutes(config.cluster_cache_max_age_minutes),
        }
    }

    /// Snapshot of the current classifier
    ///
    /// The snapshot stays valid for the caller's whole operation even if a
    /// retrain swaps the shared slot mid-flight.
    pub fn classifier(&self) -> Arc<CategoryClassifier> {
        match self.classifier.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Whether enough time has passed since the last successful retrain
    pub fn retrain_due(&self, now: DateTime<Utc>) -> bool {
        let last = match self.last_trained.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        match last {
            Some(at) => now - at >= self.retrain_interval,
            None => true,
        }
    }

    /// Rebuild the classifier from labeled examples and swap it in
    ///
    /// The swap happens only on a `Trained` outcome; an insufficient-data run
    /// leaves the prior model serving. Readers see the old model until the
    /// instant of the swap.
    pub fn retrain(
        &self,
        examples: &[LabeledExample],
        now: DateTime<Utc>,
    ) -> Result<TrainOutcome> {
        let _serialized = match self.retrain_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut candidate = (*self.classifier()).clone();
        let outcome = candidate.train(examples)?;

        match &outcome {
            TrainOutcome::Trained(stats) => {
                match self.classifier.write() {
                    Ok(mut guard) => *guard = Arc::new(candidate),
                    Err(poisoned) => *poisoned.into_inner() = Arc::new(candidate),
                }
                match self.last_trained.write() {
                    Ok(mut guard) => *guard = Some(now),
                    Err(poisoned) => *poisoned.into_inner() = Some(now),
                }
                info!(
                    examples = stats.examples,
                    categories = stats.categories,
                    vocabulary = stats.vocabulary,
                    "classifier retrained and swapped in"
                );
            }
            TrainOutcome::InsufficientData { examples, required } => {
                warn!(examples, required, "retrain skipped, keeping prior model");
            }
        }
        Ok(outcome)
    }

    /// A cached forecast for the user, if one is still fresh
    pub fn cached_forecast(&self, user_id: i64, now: DateTime<Utc>) -> Option<ForecastOutcome> {
        let cache = match self.forecasts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .get(&user_id)
            .filter(|c| now - c.computed_at < self.forecast_max_age)
            .map(|c| c.outcome.clone())
    }

    pub fn store_forecast(&self, user_id: i64, outcome: ForecastOutcome, now: DateTime<Utc>) {
        let mut cache = match self.forecasts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.insert(
            user_id,
            CachedForecast {
                computed_at: now,
                outcome,
            },
        );
    }

    /// Drop a user's cached forecast, forcing the next request to recompute
    pub fn invalidate_forecast(&self, user_id: i64) {
        let mut cache = match self.forecasts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.remove(&user_id);
    }

    /// The cached peer-cluster model, if still fresh
    pub fn cached_clusters(&self, now: DateTime<Utc>) -> Option<Arc<ClusterModel>> {
        let cache = match self.clusters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .as_ref()
            .filter(|c| now - c.computed_at < self.cluster_max_age)
            .map(|c| Arc::clone(&c.model))
    }

    pub fn store_clusters(&self, model: ClusterModel, now: DateTime<Utc>) -> Arc<ClusterModel> {
        let shared = Arc::new(model);
        let mut cache = match self.clusters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cache = Some(CachedClusters {
            computed_at: now,
            model: Arc::clone(&shared),
        });
        shared
    }
}
