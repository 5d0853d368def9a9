//! Pipeline configuration
//!
//! All algorithmic thresholds live here so the surrounding service can tune
//! them without code changes. Config is resolved in two layers: compiled-in
//! defaults, optionally overridden by a TOML file supplied by the caller.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Tunables for the expense intelligence pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum model confidence before a trained prediction is accepted;
    /// below this the keyword rules act as the safety net
    pub confidence_threshold: f64,
    /// Minimum labeled examples before classifier training is attempted
    pub min_training_examples: usize,
    /// Hours between classifier retrains (retrain-due check)
    pub retrain_interval_hours: i64,

    /// Largest amount an email extraction will accept
    pub max_email_amount: f64,

    /// Minimum distinct observation days before a forecast fit is attempted
    pub min_forecast_observations: usize,
    /// Minimum calendar span (days) the observations must cover
    pub min_forecast_span_days: i64,
    /// Observation floor for the per-category forecast variant
    pub min_category_observations: usize,
    /// Default forecast horizon in days
    pub forecast_horizon_days: usize,
    /// z-score for the uncertainty band (1.28 ~ 80% interval)
    pub forecast_interval_z: f64,
    /// Minutes a cached forecast stays valid
    pub forecast_cache_max_age_minutes: i64,

    /// Trailing window (days) for spending profiles
    pub trailing_window_days: i64,
    /// Minimum transactions in the window for a user to enter clustering
    pub min_profile_transactions: usize,
    /// Minimum span (days) of a user's history in the window
    pub min_profile_span_days: i64,
    /// Minimum eligible users before clustering runs at all
    pub min_cluster_users: usize,
    /// Upper bound on the silhouette search for k
    pub max_clusters: usize,
    /// Candidate k values producing a cluster smaller than this are discarded
    pub min_cluster_size: usize,
    /// Minutes a cached cluster model stays valid
    pub cluster_cache_max_age_minutes: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            min_training_examples: 10,
            retrain_interval_hours: 24,
            max_email_amount: 50_000.0,
            min_forecast_observations: 28,
            min_forecast_span_days: 28,
            min_category_observations: 15,
            forecast_horizon_days: 30,
            forecast_interval_z: 1.28,
            forecast_cache_max_age_minutes: 60,
            trailing_window_days: 90,
            min_profile_transactions: 10,
            min_profile_span_days: 28,
            min_cluster_users: 5,
            max_clusters: 10,
            min_cluster_size: 2,
            cluster_cache_max_age_minutes: 60,
        }
    }
}

/// Partial config as it appears in an override file; absent keys keep defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverride {
    confidence_threshold: Option<f64>,
    min_training_examples: Option<usize>,
    retrain_interval_hours: Option<i64>,
    max_email_amount: Option<f64>,
    min_forecast_observations: Option<usize>,
    min_forecast_span_days: Option<i64>,
    min_category_observations: Option<usize>,
    forecast_horizon_days: Option<usize>,
    forecast_interval_z: Option<f64>,
    forecast_cache_max_age_minutes: Option<i64>,
    trailing_window_days: Option<i64>,
    min_profile_transactions: Option<usize>,
    min_profile_span_days: Option<i64>,
    min_cluster_users: Option<usize>,
    max_clusters: Option<usize>,
    min_cluster_size: Option<usize>,
    cluster_cache_max_age_minutes: Option<i64>,
}

impl PipelineConfig {
    /// Load config from a TOML override file merged over defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a TOML override string merged over defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let over: ConfigOverride = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid pipeline config: {}", e)))?;

        let mut config = Self::default();
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = over.$field { config.$field = v; })*
            };
        }
        merge!(
            confidence_threshold,
            min_training_examples,
            retrain_interval_hours,
            max_email_amount,
            min_forecast_observations,
            min_forecast_span_days,
            min_category_observations,
            forecast_horizon_days,
            forecast_interval_z,
            forecast_cache_max_age_minutes,
            trailing_window_days,
            min_profile_transactions,
            min_profile_span_days,
            min_cluster_users,
            max_clusters,
            min_cluster_size,
            cluster_cache_max_age_minutes,
        );
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::Config(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.min_cluster_size < 1 {
            return Err(Error::Config("min_cluster_size must be >= 1".into()));
        }
        if self.max_clusters < 2 {
            return Err(Error::Config("max_clusters must be >= 2".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.min_training_examples, 10);
        assert_eq!(config.forecast_horizon_days, 30);
        assert!((config.forecast_interval_z - 1.28).abs() < f64::EPSILON);
    }

    #[test]
    fn test_override_merges_over_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            confidence_threshold = 0.8
            max_clusters = 6
            "#,
        )
        .unwrap();

        assert!((config.confidence_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.max_clusters, 6);
        // Untouched keys keep defaults
        assert_eq!(config.min_training_examples, 10);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = PipelineConfig::from_toml("mystery_knob = 3\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let result = PipelineConfig::from_toml("confidence_threshold = 1.5\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "forecast_horizon_days = 14").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.forecast_horizon_days, 14);
    }
}
