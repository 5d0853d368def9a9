//! Tally Core Library
//!
//! Expense intelligence for the Tally personal finance service:
//! - Email-to-expense extraction with format-specific patterns
//! - Category classification (trained model with keyword-rule fallback)
//! - Per-user spend forecasting with uncertainty bands
//! - Peer clustering and budget recommendations
//! - Model registry with atomic swap-on-retrain semantics
//! - Pipeline orchestrator tying the pieces together
//!
//! The core is a library boundary: it never touches the network or a
//! database. Expense, category, and email snapshots arrive by value from
//! the surrounding service, and derived results are handed back by value.

pub mod categories;
pub mod classifier;
pub mod cluster;
pub mod config;
pub mod email;
pub mod error;
pub mod features;
pub mod forecast;
pub mod models;
pub mod pipeline;
pub mod registry;

pub use categories::{
    plan_category_deletion, resolve_category, CategoryDeletionPlan, ReassignTarget,
    DEFAULT_CATEGORIES, UNCATEGORIZED,
};
pub use classifier::{CategoryClassifier, LabeledExample, Prediction, TrainOutcome, TrainStats};
pub use cluster::{
    build_profile, recommend, ClusterModel, ClusterOutcome, PeerClusterer, RecommendationOutcome,
    SpendingProfile,
};
pub use config::PipelineConfig;
pub use email::{EmailBatchSummary, EmailExtractor, ExtractOutcome, RejectReason};
pub use error::{Error, Result};
pub use features::{AmountBucket, FeatureSet, Signals};
pub use forecast::{daily_totals, ForecastOutcome, Observation, SpendForecaster};
pub use models::{
    manual_expense_hash, validate_expense, BudgetRecommendation, CandidateExpense, Category,
    CategoryPrediction, CategoryProvenance, CategoryRecommendation, Expense, ForecastPoint,
    ForecastSeries, RawEmail,
};
pub use pipeline::{BatchResult, ClassifiedCandidate, ExpensePipeline};
pub use registry::ModelRegistry;
