//! Domain models for Tally
//!
//! The core never owns persistent storage: expense and category snapshots
//! arrive by value from the persistence collaborator, and derived results
//! (candidate expenses, predictions, forecasts, recommendations) are handed
//! back by value.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How an expense acquired its category
///
/// Only `UserAssigned` labels count as ground truth for classifier training.
/// Training on `Predicted` labels would have the model reinforce its own
/// earlier guesses, so those are excluded entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CategoryProvenance {
    /// No category assigned
    #[default]
    None,
    /// Category was set by an automatic prediction
    Predicted,
    /// Category was set or confirmed by the user
    UserAssigned,
}

impl CategoryProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Predicted => "predicted",
            Self::UserAssigned => "user_assigned",
        }
    }
}

impl std::str::FromStr for CategoryProvenance {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "predicted" => Ok(Self::Predicted),
            "user_assigned" | "user" => Ok(Self::UserAssigned),
            _ => Err(format!("Unknown category provenance: {}", s)),
        }
    }
}

impl std::fmt::Display for CategoryProvenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recorded expense belonging to a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub id: i64,
    pub user_id: i64,
    /// Calendar day, no time component
    pub date: NaiveDate,
    /// Non-negative, currency-agnostic unit
    pub amount: f64,
    pub merchant: String,
    pub description: Option<String>,
    /// None means uncategorized
    pub category_id: Option<i64>,
    /// Provider message id for email-sourced expenses; unique per user
    pub source_message_id: Option<String>,
    pub provenance: CategoryProvenance,
    pub created_at: DateTime<Utc>,
}

/// A user-defined label used to group expenses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub user_id: i64,
    /// Non-empty, unique per user case-insensitively
    pub name: String,
}

/// One raw email record handed in by the email-fetch collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEmail {
    pub subject: String,
    pub body: String,
    /// Provider message id, stable across fetches
    pub message_id: String,
    pub received_date: NaiveDate,
}

/// A candidate expense extracted from an email, before persistence
///
/// Category is always unset here; assignment is the classifier's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateExpense {
    pub date: NaiveDate,
    pub amount: f64,
    pub merchant: String,
    pub description: Option<String>,
    pub source_message_id: String,
}

/// A category prediction handed to the CRUD layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPrediction {
    pub category_name: String,
    /// In [0, 1]; zero only accompanies the unknown fallback
    pub confidence: f64,
}

/// One future point in a forecast series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub amount: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

/// Ordered sequence of future points for one user
///
/// Ephemeral: valid only for the session that requested it, recomputed on
/// demand and never incrementally updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastSeries {
    pub points: Vec<ForecastPoint>,
}

/// Per-category budget recommendation line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRecommendation {
    pub category: String,
    pub current_percentage: f64,
    pub recommended_percentage: f64,
    pub recommended_budget: f64,
    pub over_budget: bool,
    pub reason: String,
}

/// Budget recommendation for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRecommendation {
    pub predicted_monthly_expense: f64,
    pub recommendations: Vec<CategoryRecommendation>,
}

/// Generate a stable dedup hash for a manually entered expense
///
/// Email-sourced expenses dedup on their provider message id; manual entries
/// have none, so date + merchant + amount stand in.
pub fn manual_expense_hash(date: &NaiveDate, merchant: &str, amount: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(date.to_string().as_bytes());
    hasher.update(merchant.as_bytes());
    hasher.update(amount.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Validate an expense snapshot before it enters the pipeline
///
/// Rejects the single record; callers keep processing the rest of the batch.
pub fn validate_expense(expense: &Expense) -> crate::error::Result<()> {
    if expense.amount < 0.0 {
        return Err(crate::error::Error::InvalidData(format!(
            "Expense {} has negative amount {}",
            expense.id, expense.amount
        )));
    }
    if expense.merchant.trim().is_empty() {
        return Err(crate::error::Error::InvalidData(format!(
            "Expense {} has empty merchant",
            expense.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expense(amount: f64, merchant: &str) -> Expense {
        Expense {
            id: 1,
            user_id: 1,
            date: NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(),
            amount,
            merchant: merchant.to_string(),
            description: None,
            category_id: None,
            source_message_id: None,
            provenance: CategoryProvenance::None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_expense() {
        assert!(validate_expense(&expense(42.17, "Amazon")).is_ok());
        assert!(validate_expense(&expense(-1.0, "Amazon")).is_err());
        assert!(validate_expense(&expense(10.0, "   ")).is_err());
    }

    #[test]
    fn test_manual_expense_hash_stable() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        let a = manual_expense_hash(&date, "Amazon", 42.17);
        let b = manual_expense_hash(&date, "Amazon", 42.17);
        assert_eq!(a, b);

        let c = manual_expense_hash(&date, "Amazon", 42.18);
        assert_ne!(a, c);
    }

    #[test]
    fn test_provenance_round_trip() {
        for p in [
            CategoryProvenance::None,
            CategoryProvenance::Predicted,
            CategoryProvenance::UserAssigned,
        ] {
            let parsed: CategoryProvenance = p.as_str().parse().unwrap();
            assert_eq!(parsed, p);
        }
        assert!("mystery".parse::<CategoryProvenance>().is_err());
    }
}
