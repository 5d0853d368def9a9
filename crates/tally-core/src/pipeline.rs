//! Pipeline orchestrator
//!
//! Thin composition layer wiring extractor, classifier, forecaster, and
//! clusterer together for the two triggering events: a new email batch, and
//! a dashboard forecast/recommendation request. All algorithmic decisions
//! live in the component modules; this layer only sequences them and applies
//! the registry caches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tracing::{debug, info};

use crate::categories::resolve_category;
use crate::classifier::{LabeledExample, Prediction, TrainOutcome};
use crate::cluster::{self, ClusterOutcome, PeerClusterer, RecommendationOutcome, SpendingProfile};
use crate::config::PipelineConfig;
use crate::email::EmailExtractor;
use crate::error::Result;
use crate::features;
use crate::forecast::{daily_totals, ForecastOutcome, SpendForecaster};
use crate::models::{
    CandidateExpense, Category, CategoryPrediction, CategoryProvenance, Expense, RawEmail,
};
use crate::registry::ModelRegistry;

/// One extracted candidate with its classification, ready to persist
#[derive(Debug, Clone)]
pub struct ClassifiedCandidate {
    pub candidate: CandidateExpense,
    pub prediction: CategoryPrediction,
    /// Resolved against the user's category snapshot; None when the predicted
    /// name has no category yet (the store creates it) or nothing matched
    pub category_id: Option<i64>,
    pub provenance: CategoryProvenance,
}

/// Result of processing one user's email batch
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub items: Vec<ClassifiedCandidate>,
    pub duplicates: usize,
    pub rejected: usize,
}

/// The expense intelligence pipeline for one service instance
///
/// Safe to share across threads; per-user calls for different users may run
/// in parallel. A single user's email batch is processed sequentially to
/// keep dedup ordering deterministic.
pub struct ExpensePipeline {
    config: PipelineConfig,
    registry: Arc<ModelRegistry>,
    extractor: EmailExtractor,
    forecaster: SpendForecaster,
    clusterer: PeerClusterer,
}

impl ExpensePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::new(&config));
        Self::with_registry(config, registry)
    }

    /// Construct around an injected registry (shared with other components,
    /// or substituted in tests)
    pub fn with_registry(config: PipelineConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        Ok(Self {
            extractor: EmailExtractor::new(&config)?,
            forecaster: SpendForecaster::new(&config),
            clusterer: PeerClusterer::new(&config),
            registry,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Extract and classify one user's email batch
    ///
    /// Per-record failures stay isolated: rejects and duplicates are counted
    /// and the rest of the batch proceeds.
    pub fn process_email_batch(
        &self,
        emails: &[RawEmail],
        existing_message_ids: &HashSet<String>,
        categories: &[Category],
    ) -> BatchResult {
        let summary = self.extractor.process_batch(emails, existing_message_ids);
        let classifier = self.registry.classifier();

        let items = summary
            .extracted
            .into_iter()
            .map(|candidate| {
                let featureset = features::extract(
                    &candidate.merchant,
                    candidate.description.as_deref(),
                    None,
                    Some(candidate.amount),
                    Some(candidate.date),
                );
                let prediction = classifier.predict(&featureset);
                let (category_id, provenance) = match &prediction {
                    Prediction::Unknown => (None, CategoryProvenance::None),
                    p => (
                        resolve_category(categories, p.category_name()).map(|c| c.id),
                        CategoryProvenance::Predicted,
                    ),
                };
                ClassifiedCandidate {
                    prediction: prediction.to_category_prediction(),
                    candidate,
                    category_id,
                    provenance,
                }
            })
            .collect::<Vec<_>>();

        info!(
            extracted = items.len(),
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            "email batch processed"
        );
        BatchResult {
            items,
            duplicates: summary.duplicates,
            rejected: summary.rejected,
        }
    }

    /// Classify a single expense snapshot (used when a user edits a record)
    pub fn classify_expense(&self, expense: &Expense) -> CategoryPrediction {
        let featureset = features::extract(
            &expense.merchant,
            expense.description.as_deref(),
            None,
            Some(expense.amount),
            Some(expense.date),
        );
        self.registry
            .classifier()
            .predict(&featureset)
            .to_category_prediction()
    }

    /// Forecast a user's daily spend over the configured horizon
    ///
    /// Served from the registry cache when fresh; otherwise recomputed from
    /// the supplied expense snapshot and cached.
    pub fn forecast_for_user(
        &self,
        user_id: i64,
        expenses: &[Expense],
        now: DateTime<Utc>,
    ) -> ForecastOutcome {
        if let Some(cached) = self.registry.cached_forecast(user_id, now) {
            debug!(user_id, "forecast served from cache");
            return cached;
        }

        let mine: Vec<Expense> = expenses
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        let observations = daily_totals(&mine);
        let outcome = self
            .forecaster
            .forecast(&observations, self.config.forecast_horizon_days);
        self.registry.store_forecast(user_id, outcome.clone(), now);
        outcome
    }

    /// Per-category variant with a lower observation floor; never cached
    pub fn forecast_for_category(
        &self,
        user_id: i64,
        category_id: i64,
        expenses: &[Expense],
    ) -> ForecastOutcome {
        let mine: Vec<Expense> = expenses
            .iter()
            .filter(|e| e.user_id == user_id && e.category_id == Some(category_id))
            .cloned()
            .collect();
        let observations = daily_totals(&mine);
        self.forecaster.forecast_with_floor(
            &observations,
            self.config.forecast_horizon_days,
            self.config.min_category_observations,
        )
    }

    /// Budget recommendation for one user against their peer cluster
    ///
    /// Expense and category snapshots span all users. The cluster model is
    /// reused from the registry cache when fresh; `deadline` bounds a
    /// recompute. Ineligible users get the insufficient-data outcome.
    pub fn recommend_for_user(
        &self,
        user_id: i64,
        expenses: &[Expense],
        categories: &[Category],
        as_of: NaiveDate,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> RecommendationOutcome {
        let profile = match cluster::build_profile(user_id, expenses, categories, as_of, &self.config)
        {
            Some(p) => p,
            None => {
                debug!(user_id, "user ineligible for clustering");
                return RecommendationOutcome::InsufficientData;
            }
        };

        let model = match self.registry.cached_clusters(now) {
            Some(m) => m,
            None => {
                let profiles = self.build_all_profiles(expenses, categories, as_of);
                match self.clusterer.cluster(&profiles, deadline) {
                    ClusterOutcome::Clustered(model) => self.registry.store_clusters(model, now),
                    ClusterOutcome::InsufficientUsers { eligible, required } => {
                        debug!(eligible, required, "not enough users to cluster");
                        return RecommendationOutcome::InsufficientData;
                    }
                }
            }
        };

        // Prefer the forecast's view of next month; fall back to the
        // trailing monthly average when history is too short to fit.
        let monthly = match self.forecast_for_user(user_id, expenses, now) {
            ForecastOutcome::Series(series) => {
                series.points.iter().take(30).map(|p| p.amount).sum()
            }
            ForecastOutcome::InsufficientHistory { .. } => {
                profile.total_spend / self.config.trailing_window_days as f64 * 30.0
            }
        };
        cluster::recommend(&model, &profile, monthly)
    }

    fn build_all_profiles(
        &self,
        expenses: &[Expense],
        categories: &[Category],
        as_of: NaiveDate,
    ) -> Vec<SpendingProfile> {
        let user_ids: HashSet<i64> = expenses.iter().map(|e| e.user_id).collect();
        let mut profiles: Vec<SpendingProfile> = user_ids
            .into_iter()
            .filter_map(|uid| {
                cluster::build_profile(uid, expenses, categories, as_of, &self.config)
            })
            .collect();
        profiles.sort_by_key(|p| p.user_id);
        profiles
    }

    /// Retrain the classifier if the schedule says so
    ///
    /// Only user-assigned labels train the model. Returns None when no
    /// retrain was due.
    pub fn retrain_if_due(
        &self,
        expenses: &[Expense],
        categories: &[Category],
        now: DateTime<Utc>,
    ) -> Result<Option<TrainOutcome>> {
        if !self.registry.retrain_due(now) {
            return Ok(None);
        }
        let examples = training_examples(expenses, categories);
        let outcome = self.registry.retrain(&examples, now)?;
        Ok(Some(outcome))
    }

    /// The month's spend so far plus the forecast for the rest of it
    ///
    /// Falls back to the plain month-to-date total when history is too short
    /// to forecast.
    pub fn projected_month_total(
        &self,
        user_id: i64,
        expenses: &[Expense],
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> f64 {
        let month_start = today.with_day(1).unwrap_or(today);
        let spent: f64 = expenses
            .iter()
            .filter(|e| e.user_id == user_id && e.date >= month_start && e.date <= today)
            .map(|e| e.amount)
            .sum();

        let remaining = match self.forecast_for_user(user_id, expenses, now) {
            ForecastOutcome::Series(series) => series
                .points
                .iter()
                .filter(|p| p.date > today && p.date.month() == today.month())
                .map(|p| p.amount)
                .sum(),
            ForecastOutcome::InsufficientHistory { .. } => 0.0,
        };
        ((spent + remaining) * 100.0).round() / 100.0
    }
}

/// Build the classifier training set from persisted expenses
///
/// Only `UserAssigned` labels qualify: training on predicted labels would
/// feed the model its own earlier guesses.
pub fn training_examples(expenses: &[Expense], categories: &[Category]) -> Vec<LabeledExample> {
    let names: HashMap<i64, &str> = categories.iter().map(|c| (c.id, c.name.as_str())).collect();
    expenses
        .iter()
        .filter(|e| e.provenance == CategoryProvenance::UserAssigned)
        .filter_map(|e| {
            let category = e.category_id.and_then(|id| names.get(&id))?;
            Some(LabeledExample {
                features: features::extract(
                    &e.merchant,
                    e.description.as_deref(),
                    None,
                    Some(e.amount),
                    Some(e.date),
                ),
                category: category.to_string(),
            })
        })
        .collect()
}
