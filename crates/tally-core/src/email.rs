//! Email-to-expense extraction
//!
//! Parses purchase-notification emails into candidate expenses using an
//! ordered set of anchored patterns. Patterns are listed most-specific first
//! (longest anchor wins). Emails where no amount or merchant can be found
//! with reasonable confidence are rejected rather than stored with null
//! required fields.

use std::collections::HashSet;

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::models::{CandidateExpense, RawEmail};

/// Why an email was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoAmount,
    AmountOutOfRange,
    NoMerchant,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAmount => "no amount found",
            Self::AmountOutOfRange => "amount out of range",
            Self::NoMerchant => "no merchant found",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of extracting a single email
#[derive(Debug, Clone)]
pub enum ExtractOutcome {
    Extracted(CandidateExpense),
    Rejected(RejectReason),
}

/// Aggregate result of a per-user email batch
#[derive(Debug, Clone, Default)]
pub struct EmailBatchSummary {
    pub extracted: Vec<CandidateExpense>,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Compiled extraction patterns
pub struct EmailExtractor {
    max_amount: f64,
    amount_patterns: Vec<Regex>,
    amount_fallback: Regex,
    subject_merchant_patterns: Vec<Regex>,
    body_merchant_patterns: Vec<Regex>,
    date_anchor: Regex,
    description_patterns: Vec<Regex>,
    script_style: Regex,
    tag: Regex,
}

impl EmailExtractor {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        // Anchored amount patterns, most specific anchor first; the bare "$"
        // pattern is a last resort kept separate.
        let amount_patterns = vec![
            Regex::new(
                r"(?i)(?:total|amount|charge|payment)(?:\s+\w+){0,2}\s*:?\s*\$\s*(\d+(?:,\d{3})*(?:\.\d{2})?)",
            )?,
            Regex::new(r"(?i)\$\s*(\d+(?:,\d{3})*(?:\.\d{2})?)\s+(?:total|amount|charge|payment)")?,
            Regex::new(r"(?i)(?:USD|US\$)\s*(\d+(?:,\d{3})*(?:\.\d{2})?)")?,
            Regex::new(r"(?i)(\d+\.\d{2})\s+(?:USD|US\$|dollars)")?,
        ];
        let amount_fallback = Regex::new(r"\$\s*(\d+(?:,\d{3})*(?:\.\d{2})?)")?;

        let subject_merchant_patterns = vec![
            Regex::new(r"(?i)(?:your|new)\s+(?:order|purchase)\s+(?:from|with)\s+([A-Za-z0-9&\.\s]+)")?,
            Regex::new(r"(?i)thanks?\s+for\s+(?:ordering|shopping)\s+(?:from|with|at)\s+([A-Za-z0-9&\.\s]+)")?,
            Regex::new(r"(?i)(?:receipt|confirmation)\s+for\s+([A-Za-z0-9&\.\s]+)")?,
            Regex::new(r"(?i)your\s+([A-Za-z0-9&\.\s]+?)\s+(?:order|receipt|invoice|purchase)")?,
            Regex::new(r"(?i)^([A-Za-z0-9&\.\s]+?)\s+(?:order|receipt|invoice|confirmation)")?,
        ];

        let body_merchant_patterns = vec![
            Regex::new(
                r"(?i)thank\s+you\s+for\s+(?:your\s+purchase|ordering|shopping)\s+(?:from|with|at)\s+([A-Za-z0-9\.\s]+)",
            )?,
            Regex::new(r"(?i)(?:vendor|merchant|store|retailer)\s*:\s*([A-Za-z0-9\.\s]+)")?,
        ];

        let date_anchor =
            Regex::new(r"(?i)(?:order|purchase|transaction)\s+date\s*:?\s*([A-Za-z0-9,/\-\s]+?)(?:[\.\n]|$)")?;

        let description_patterns = vec![
            Regex::new(r"(?i)(?:order|confirmation)\s+(?:number|#)\s*:?\s*([A-Za-z0-9\-]+)")?,
            Regex::new(r"(?i)(?:invoice|receipt)\s+(?:number|#)\s*:?\s*([A-Za-z0-9\-]+)")?,
        ];

        Ok(Self {
            max_amount: config.max_email_amount,
            amount_patterns,
            amount_fallback,
            subject_merchant_patterns,
            body_merchant_patterns,
            date_anchor,
            description_patterns,
            script_style: Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>")?,
            tag: Regex::new(r"<[^>]+>")?,
        })
    }

    /// Attempt to extract a candidate expense from one raw email
    ///
    /// The candidate always has its category unset; classification is a
    /// separate step. Deduplication is the batch layer's job.
    pub fn extract(&self, email: &RawEmail) -> ExtractOutcome {
        let body = self.visible_text(&email.body);

        let amount = match self.extract_amount(&body) {
            Some(a) => a,
            None => {
                debug!(message_id = %email.message_id, "rejected: no amount");
                return ExtractOutcome::Rejected(RejectReason::NoAmount);
            }
        };
        if amount <= 0.0 || amount > self.max_amount {
            debug!(message_id = %email.message_id, amount, "rejected: amount out of range");
            return ExtractOutcome::Rejected(RejectReason::AmountOutOfRange);
        }

        let merchant = match self.extract_merchant(&email.subject, &body) {
            Some(m) => m,
            None => {
                debug!(message_id = %email.message_id, "rejected: no merchant");
                return ExtractOutcome::Rejected(RejectReason::NoMerchant);
            }
        };

        let date = self.extract_date(&body).unwrap_or(email.received_date);
        let description = self.extract_description(&body);

        ExtractOutcome::Extracted(CandidateExpense {
            date,
            amount,
            merchant,
            description,
            source_message_id: email.message_id.clone(),
        })
    }

    /// Process one user's email batch sequentially
    ///
    /// Duplicate message ids (already stored, or seen earlier in this batch)
    /// are counted and skipped, not errors. Per-record rejections never abort
    /// the rest of the batch.
    pub fn process_batch(
        &self,
        emails: &[RawEmail],
        existing_message_ids: &HashSet<String>,
    ) -> EmailBatchSummary {
        let mut summary = EmailBatchSummary::default();
        let mut seen: HashSet<String> = existing_message_ids.clone();

        for email in emails {
            if seen.contains(&email.message_id) {
                debug!(message_id = %email.message_id, "skipping already-processed email");
                summary.duplicates += 1;
                continue;
            }

            match self.extract(email) {
                ExtractOutcome::Extracted(candidate) => {
                    seen.insert(email.message_id.clone());
                    summary.extracted.push(candidate);
                }
                ExtractOutcome::Rejected(_) => summary.rejected += 1,
            }
        }

        info!(
            extracted = summary.extracted.len(),
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            "email batch processed"
        );
        summary
    }

    /// Reduce an HTML body to its visible text
    fn visible_text(&self, body: &str) -> String {
        if !body.contains('<') {
            return collapse_whitespace(body);
        }
        let no_scripts = self.script_style.replace_all(body, " ");
        let no_tags = self.tag.replace_all(&no_scripts, " ");
        let decoded = no_tags
            .replace("&nbsp;", " ")
            .replace("&amp;", "&")
            .replace("&#36;", "$");
        collapse_whitespace(&decoded)
    }

    fn extract_amount(&self, text: &str) -> Option<f64> {
        for pattern in &self.amount_patterns {
            if let Some(captures) = pattern.captures(text) {
                if let Some(amount) = parse_amount(&captures[1]) {
                    return Some(amount);
                }
            }
        }
        self.amount_fallback
            .captures(text)
            .and_then(|c| parse_amount(&c[1]))
    }

    fn extract_merchant(&self, subject: &str, body: &str) -> Option<String> {
        for pattern in &self.subject_merchant_patterns {
            if let Some(captures) = pattern.captures(subject) {
                if let Some(merchant) = cleanup_merchant(&captures[1]) {
                    return Some(merchant);
                }
            }
        }
        for pattern in &self.body_merchant_patterns {
            if let Some(captures) = pattern.captures(body) {
                if let Some(merchant) = cleanup_merchant(&captures[1]) {
                    return Some(merchant);
                }
            }
        }
        None
    }

    fn extract_date(&self, text: &str) -> Option<NaiveDate> {
        let captures = self.date_anchor.captures(text)?;
        parse_date(captures[1].trim())
    }

    fn extract_description(&self, text: &str) -> Option<String> {
        for pattern in &self.description_patterns {
            if let Some(captures) = pattern.captures(text) {
                return Some(format!("Order #{}", &captures[1]));
            }
        }
        None
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

/// Normalize a captured merchant: trim, drop a trailing domain suffix,
/// reject anything too short to be a real name.
fn cleanup_merchant(raw: &str) -> Option<String> {
    let mut merchant = raw.trim().trim_end_matches('.').to_string();
    for suffix in [".com", ".net", ".org", ".co"] {
        if let Some(stripped) = merchant.to_lowercase().strip_suffix(suffix) {
            merchant.truncate(stripped.len());
            break;
        }
    }
    let merchant = merchant.trim().to_string();
    if merchant.len() < 2 {
        return None;
    }
    Some(merchant)
}

/// Parse the handful of date shapes purchase emails actually use
fn parse_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 5] = ["%B %d, %Y", "%b %d, %Y", "%m/%d/%Y", "%Y-%m-%d", "%d %B %Y"];
    FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> EmailExtractor {
        EmailExtractor::new(&PipelineConfig::default()).unwrap()
    }

    fn email(subject: &str, body: &str, message_id: &str) -> RawEmail {
        RawEmail {
            subject: subject.to_string(),
            body: body.to_string(),
            message_id: message_id.to_string(),
            received_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
        }
    }

    #[test]
    fn test_amazon_order_email() {
        let outcome = extractor().extract(&email(
            "Your Amazon.com order",
            "Thanks for your order. Total: $42.17. Order Date: March 3, 2024. Order #112-555",
            "msg-1",
        ));

        let candidate = match outcome {
            ExtractOutcome::Extracted(c) => c,
            ExtractOutcome::Rejected(r) => panic!("rejected: {}", r),
        };
        assert_eq!(candidate.merchant, "Amazon");
        assert!((candidate.amount - 42.17).abs() < 0.001);
        assert_eq!(candidate.date, NaiveDate::from_ymd_opt(2024, 3, 3).unwrap());
        assert_eq!(candidate.description.as_deref(), Some("Order #112-555"));
        assert_eq!(candidate.source_message_id, "msg-1");
    }

    #[test]
    fn test_anchored_amount_preferred_over_bare_dollar() {
        let outcome = extractor().extract(&email(
            "Receipt for Blue Bottle",
            "Item: $3.50. Item: $4.25. Total: $7.75",
            "msg-2",
        ));
        match outcome {
            ExtractOutcome::Extracted(c) => assert!((c.amount - 7.75).abs() < 0.001),
            ExtractOutcome::Rejected(r) => panic!("rejected: {}", r),
        }
    }

    #[test]
    fn test_html_body() {
        let outcome = extractor().extract(&email(
            "Your Target order",
            "<html><body><style>p { color: red; }</style><p>Total: <b>$19.99</b></p>\
             <p>Order Date: 03/04/2024</p></body></html>",
            "msg-3",
        ));
        match outcome {
            ExtractOutcome::Extracted(c) => {
                assert_eq!(c.merchant, "Target");
                assert!((c.amount - 19.99).abs() < 0.001);
                assert_eq!(c.date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
            }
            ExtractOutcome::Rejected(r) => panic!("rejected: {}", r),
        }
    }

    #[test]
    fn test_no_amount_rejected() {
        let outcome = extractor().extract(&email(
            "Your Amazon order",
            "Your package has shipped and is on its way.",
            "msg-4",
        ));
        assert!(matches!(
            outcome,
            ExtractOutcome::Rejected(RejectReason::NoAmount)
        ));
    }

    #[test]
    fn test_absurd_amount_rejected() {
        let outcome = extractor().extract(&email(
            "Your Amazon order",
            "Total: $999,999.00",
            "msg-5",
        ));
        assert!(matches!(
            outcome,
            ExtractOutcome::Rejected(RejectReason::AmountOutOfRange)
        ));
    }

    #[test]
    fn test_missing_date_falls_back_to_received() {
        let outcome = extractor().extract(&email("Your Amazon order", "Total: $10.00", "msg-6"));
        match outcome {
            ExtractOutcome::Extracted(c) => {
                assert_eq!(c.date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap())
            }
            ExtractOutcome::Rejected(r) => panic!("rejected: {}", r),
        }
    }

    #[test]
    fn test_batch_dedup() {
        let ext = extractor();
        let emails = vec![
            email("Your Amazon order", "Total: $10.00", "dup-1"),
            email("Your Amazon order", "Total: $10.00", "dup-1"),
            email("Your Target order", "Total: $20.00", "new-1"),
            email("Shipping update", "no amount here", "new-2"),
        ];
        let mut existing = HashSet::new();
        existing.insert("old-1".to_string());

        let summary = ext.process_batch(&emails, &existing);
        assert_eq!(summary.extracted.len(), 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.rejected, 1);

        // Feeding the results back as "existing" yields only duplicates
        let mut now_existing = existing.clone();
        for c in &summary.extracted {
            now_existing.insert(c.source_message_id.clone());
        }
        let second = ext.process_batch(&emails, &now_existing);
        assert_eq!(second.extracted.len(), 0);
        assert_eq!(second.duplicates, 3);
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(
            parse_date("March 3, 2024"),
            NaiveDate::from_ymd_opt(2024, 3, 3)
        );
        assert_eq!(
            parse_date("Mar 3, 2024"),
            NaiveDate::from_ymd_opt(2024, 3, 3)
        );
        assert_eq!(parse_date("03/03/2024"), NaiveDate::from_ymd_opt(2024, 3, 3));
        assert_eq!(parse_date("2024-03-03"), NaiveDate::from_ymd_opt(2024, 3, 3));
        assert_eq!(parse_date("not a date"), None);
    }
}
