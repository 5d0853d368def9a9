//! Category classification
//!
//! Two layers, in a fixed order: a trainable multinomial naive Bayes model
//! over feature tokens, then a deterministic keyword-rule table. The rules
//! are a safety net for a cold or low-confidence model; they never override
//! a confident model prediction. When neither layer fires, the result is the
//! unknown marker with zero confidence.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::features::FeatureSet;
use crate::models::CategoryPrediction;

/// Category name returned when nothing matches
pub const UNKNOWN_CATEGORY: &str = "Other";

/// Confidence reported for a keyword-rule match
const RULE_CONFIDENCE: f64 = 0.8;

/// Ordered keyword-rule table; first match wins. More specific groups come
/// before broader ones (airlines are Travel before ride-share is
/// Transportation). Keywords are in normalized token form.
const KEYWORD_RULES: &[(&[&str], &str)] = &[
    (
        &[
            "flight", "hotel", "airline", "airway", "vacation", "travel", "booking", "cruise",
            "delta", "southwest", "united",
        ],
        "Travel",
    ),
    (
        &["gift", "christmas", "holiday", "present"],
        "Gifts",
    ),
    (
        &[
            "kroger", "safeway", "aldi", "wegman", "grocery", "doordash", "grubhub", "mcdonald",
            "chipotle", "starbuck", "restaurant", "cafe", "pizza",
        ],
        "Food",
    ),
    (
        &[
            "uber", "lyft", "amtrak", "transit", "metro", "parking", "toll", "gas", "shell",
            "chevron", "exxon",
        ],
        "Transportation",
    ),
    (
        &["amazon", "walmart", "target", "ebay", "etsy", "ikea"],
        "Shopping",
    ),
    (
        &[
            "netflix", "hulu", "spotify", "disney", "hbo", "amc", "cinema", "movie", "theater",
        ],
        "Entertainment",
    ),
    (
        &[
            "comcast", "verizon", "xfinity", "utility", "electric", "water", "internet",
            "insurance",
        ],
        "Bills",
    ),
];

/// A labeled training example: features plus the user-assigned category name
#[derive(Debug, Clone)]
pub struct LabeledExample {
    pub features: FeatureSet,
    pub category: String,
}

/// Classification result, tagged by which layer produced it
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// Trained model scored at or above the confidence threshold
    Model { category: String, confidence: f64 },
    /// Keyword rule matched (model absent or below threshold)
    Rule {
        category: String,
        keyword: String,
    },
    /// Nothing matched
    Unknown,
}

impl Prediction {
    pub fn category_name(&self) -> &str {
        match self {
            Self::Model { category, .. } | Self::Rule { category, .. } => category,
            Self::Unknown => UNKNOWN_CATEGORY,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Self::Model { confidence, .. } => *confidence,
            Self::Rule { .. } => RULE_CONFIDENCE,
            Self::Unknown => 0.0,
        }
    }

    /// Flatten into the boundary record handed to the CRUD layer
    pub fn to_category_prediction(&self) -> CategoryPrediction {
        CategoryPrediction {
            category_name: self.category_name().to_string(),
            confidence: self.confidence(),
        }
    }
}

/// Statistics reported after a successful rebuild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStats {
    pub examples: usize,
    pub categories: usize,
    pub vocabulary: usize,
}

/// Outcome of a training attempt
///
/// Insufficient data is a routine outcome, not an error: the prior model
/// stays active untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    Trained(TrainStats),
    InsufficientData { examples: usize, required: usize },
}

/// Trained naive Bayes model state, rebuilt wholesale on each retrain
#[derive(Debug, Clone)]
struct TrainedModel {
    /// category -> example count (for priors)
    category_examples: HashMap<String, usize>,
    /// category -> token -> count
    token_counts: HashMap<String, HashMap<String, usize>>,
    /// category -> total token count
    category_token_totals: HashMap<String, usize>,
    vocabulary: BTreeSet<String>,
    examples: usize,
}

impl TrainedModel {
    /// Score all categories and return the best with normalized confidence
    fn predict(&self, tokens: &[String]) -> Option<(String, f64)> {
        if self.examples == 0 {
            return None;
        }

        let vocab_size = self.vocabulary.len().max(1) as f64;
        let mut log_scores: Vec<(&String, f64)> = Vec::with_capacity(self.category_examples.len());

        for (category, count) in &self.category_examples {
            let mut score = ((*count as f64) / (self.examples as f64)).ln();
            let counts = self.token_counts.get(category);
            let total = *self.category_token_totals.get(category).unwrap_or(&0) as f64;

            for token in tokens {
                let c = counts
                    .and_then(|m| m.get(token))
                    .copied()
                    .unwrap_or(0) as f64;
                // Laplace smoothing
                score += ((c + 1.0) / (total + vocab_size)).ln();
            }
            log_scores.push((category, score));
        }

        // Normalize via log-sum-exp so confidence lands in [0, 1]
        let max = log_scores
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = log_scores.iter().map(|(_, s)| (s - max).exp()).sum();

        log_scores
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(category, score)| (category.clone(), (score - max).exp() / sum))
    }
}

/// Category classifier: trained model with keyword-rule fallback
#[derive(Debug, Clone)]
pub struct CategoryClassifier {
    model: Option<TrainedModel>,
    confidence_threshold: f64,
    min_training_examples: usize,
}

impl CategoryClassifier {
    /// Create an untrained classifier; predictions fall through to the rules
    pub fn untrained(config: &PipelineConfig) -> Self {
        Self {
            model: None,
            confidence_threshold: config.confidence_threshold,
            min_training_examples: config.min_training_examples,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    /// Predict a category for the given features
    ///
    /// Never fails: an empty feature set simply matches nothing and yields
    /// `Unknown`.
    pub fn predict(&self, features: &FeatureSet) -> Prediction {
        if let Some(model) = &self.model {
            let tokens = features.model_tokens();
            if !tokens.is_empty() {
                if let Some((category, confidence)) = model.predict(&tokens) {
                    if confidence >= self.confidence_threshold {
                        debug!(%category, confidence, "model prediction accepted");
                        return Prediction::Model {
                            category,
                            confidence,
                        };
                    }
                    debug!(
                        %category,
                        confidence,
                        threshold = self.confidence_threshold,
                        "model prediction below threshold, trying rules"
                    );
                }
            }
        }

        for (keywords, category) in KEYWORD_RULES {
            if let Some(keyword) = keywords.iter().find(|k| features.tokens.contains(**k)) {
                debug!(%category, keyword, "keyword rule matched");
                return Prediction::Rule {
                    category: (*category).to_string(),
                    keyword: (*keyword).to_string(),
                };
            }
        }

        Prediction::Unknown
    }

    /// Rebuild the trained model from labeled examples
    ///
    /// Idempotent: repeated calls with the same corpus produce the same
    /// model. Below the example floor this is a no-op and the prior model
    /// remains active. Errors only on malformed input (empty category name).
    pub fn train(&mut self, examples: &[LabeledExample]) -> Result<TrainOutcome> {
        if let Some(bad) = examples.iter().find(|e| e.category.trim().is_empty()) {
            return Err(Error::Training(format!(
                "Labeled example with empty category (tokens: {:?})",
                bad.features.tokens
            )));
        }

        let usable: Vec<&LabeledExample> =
            examples.iter().filter(|e| !e.features.is_empty()).collect();

        if usable.len() < self.min_training_examples {
            debug!(
                examples = usable.len(),
                required = self.min_training_examples,
                "insufficient training data, keeping prior model"
            );
            return Ok(TrainOutcome::InsufficientData {
                examples: usable.len(),
                required: self.min_training_examples,
            });
        }

        let mut model = TrainedModel {
            category_examples: HashMap::new(),
            token_counts: HashMap::new(),
            category_token_totals: HashMap::new(),
            vocabulary: BTreeSet::new(),
            examples: usable.len(),
        };

        for example in &usable {
            let category = example.category.trim().to_string();
            *model.category_examples.entry(category.clone()).or_insert(0) += 1;

            let counts = model.token_counts.entry(category.clone()).or_default();
            let total = model.category_token_totals.entry(category).or_insert(0);
            for token in example.features.model_tokens() {
                model.vocabulary.insert(token.clone());
                *counts.entry(token).or_insert(0) += 1;
                *total += 1;
            }
        }

        let stats = TrainStats {
            examples: model.examples,
            categories: model.category_examples.len(),
            vocabulary: model.vocabulary.len(),
        };
        self.model = Some(model);
        debug!(?stats, "classifier retrained");
        Ok(TrainOutcome::Trained(stats))
    }
}
