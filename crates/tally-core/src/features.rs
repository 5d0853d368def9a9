//! Text feature extraction for expense classification
//!
//! Normalizes raw merchant/description/email text into a token set plus a
//! small set of named signals. Everything here is deterministic and free of
//! side effects: same input, same output, no external services.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Fixed stop-word list removed before tokenizing
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "our", "that", "the", "their", "this", "to", "was", "were",
    "will", "with", "you", "your",
];

/// Keyword groups surfaced as named signals
const TRAVEL_KEYWORDS: &[&str] = &[
    "flight", "hotel", "vacation", "travel", "booking", "airline", "airways", "airlines",
    "rental", "cruise",
];

const HOLIDAY_KEYWORDS: &[&str] = &["gift", "christmas", "holiday", "present"];

const SUBSCRIPTION_KEYWORDS: &[&str] = &[
    "subscription", "membership", "monthly", "renewal", "premium", "plan",
];

/// Coarse amount bucket used as a classification signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountBucket {
    /// Under 5
    Micro,
    /// 5 to 25
    Small,
    /// 25 to 100
    Medium,
    /// 100 to 500
    Large,
    /// 500 and up
    Major,
}

impl AmountBucket {
    pub fn from_amount(amount: f64) -> Self {
        if amount < 5.0 {
            Self::Micro
        } else if amount < 25.0 {
            Self::Small
        } else if amount < 100.0 {
            Self::Medium
        } else if amount < 500.0 {
            Self::Large
        } else {
            Self::Major
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Micro => "micro",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Major => "major",
        }
    }
}

/// Named boolean/numeric signals extracted alongside the token set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    pub travel_keywords: bool,
    pub holiday_keywords: bool,
    pub subscription_keywords: bool,
    pub amount_bucket: Option<AmountBucket>,
    pub day_of_week: Option<Weekday>,
    /// Day of month within the last five days of the month
    pub near_month_end: bool,
}

/// Normalized feature representation of one expense's text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub tokens: BTreeSet<String>,
    pub signals: Signals,
}

impl FeatureSet {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens fed to the trained model: the text tokens plus pseudo-tokens
    /// for each active signal, so signals carry weight in training too.
    pub fn model_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.tokens.iter().cloned().collect();
        if self.signals.travel_keywords {
            tokens.push("_sig:travel".to_string());
        }
        if self.signals.holiday_keywords {
            tokens.push("_sig:holiday".to_string());
        }
        if self.signals.subscription_keywords {
            tokens.push("_sig:subscription".to_string());
        }
        if let Some(bucket) = self.signals.amount_bucket {
            tokens.push(format!("_sig:amount:{}", bucket.as_str()));
        }
        tokens
    }
}

/// Lowercase, strip punctuation, collapse whitespace, then split
fn raw_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
}

/// Light suffix normalization standing in for lemmatization
fn normalize_token(token: &str) -> String {
    let mut t = token.to_string();
    if let Some(stripped) = t.strip_suffix("'s") {
        t = stripped.to_string();
    }
    if t.len() > 4 && t.ends_with("ies") {
        t.truncate(t.len() - 3);
        t.push('y');
    } else if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
        t.truncate(t.len() - 1);
    }
    t
}

/// Extract a normalized feature set from expense text
///
/// Empty or missing text never errors; it just yields an empty feature set.
pub fn extract(
    merchant: &str,
    description: Option<&str>,
    email_body: Option<&str>,
    amount: Option<f64>,
    date: Option<NaiveDate>,
) -> FeatureSet {
    let mut tokens: BTreeSet<String> = BTreeSet::new();
    let mut keyword_haystack = String::new();

    for text in [Some(merchant), description, email_body].into_iter().flatten() {
        for token in raw_tokens(text) {
            keyword_haystack.push_str(&token);
            keyword_haystack.push(' ');
            if token.len() < 2 || STOP_WORDS.contains(&token.as_str()) {
                continue;
            }
            tokens.insert(normalize_token(&token));
        }
    }

    let contains_any = |group: &[&str]| {
        group
            .iter()
            .any(|k| keyword_haystack.split_whitespace().any(|t| t == *k))
    };

    let signals = Signals {
        travel_keywords: contains_any(TRAVEL_KEYWORDS),
        holiday_keywords: contains_any(HOLIDAY_KEYWORDS),
        subscription_keywords: contains_any(SUBSCRIPTION_KEYWORDS),
        amount_bucket: amount.map(AmountBucket::from_amount),
        day_of_week: date.map(|d| d.weekday()),
        near_month_end: date.map_or(false, |d| {
            let last = days_in_month(d.year(), d.month());
            d.day() + 5 > last
        }),
    };

    FeatureSet { tokens, signals }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_y, next_m) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_y, next_m, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(31)
}
