//! Integration tests for tally-core
//!
//! These tests exercise the full email → extract → classify → analytics
//! workflow through the pipeline orchestrator.

use std::collections::HashSet;

use chrono::{Duration, NaiveDate, Utc};

use tally_core::{
    categories::{plan_category_deletion, ReassignTarget, UNCATEGORIZED},
    cluster::RecommendationOutcome,
    forecast::ForecastOutcome,
    manual_expense_hash,
    models::{Category, CategoryProvenance, Expense, RawEmail},
    pipeline::ExpensePipeline,
    PipelineConfig, TrainOutcome,
};

fn email(subject: &str, body: &str, message_id: &str) -> RawEmail {
    RawEmail {
        subject: subject.to_string(),
        body: body.to_string(),
        message_id: message_id.to_string(),
        received_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
    }
}

fn expense(
    id: i64,
    user_id: i64,
    date: NaiveDate,
    amount: f64,
    merchant: &str,
    category_id: Option<i64>,
    provenance: CategoryProvenance,
) -> Expense {
    Expense {
        id,
        user_id,
        date,
        amount,
        merchant: merchant.to_string(),
        description: None,
        category_id,
        source_message_id: None,
        provenance,
        created_at: Utc::now(),
    }
}

fn category(id: i64, user_id: i64, name: &str) -> Category {
    Category {
        id,
        user_id,
        name: name.to_string(),
    }
}

// =============================================================================
// Email Extraction Scenarios
// =============================================================================

#[test]
fn test_amazon_order_email_end_to_end() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let emails = vec![email(
        "Your Amazon.com order",
        "Thanks for shopping with us. Total: $42.17. Order Date: March 3, 2024. \
         Order #112-5550123.",
        "amz-001",
    )];

    let result = pipeline.process_email_batch(&emails, &HashSet::new(), &[]);
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.rejected, 0);

    let candidate = &result.items[0].candidate;
    assert_eq!(candidate.merchant, "Amazon");
    assert!((candidate.amount - 42.17).abs() < 1e-9);
    assert_eq!(candidate.date, NaiveDate::from_ymd_opt(2024, 3, 3).unwrap());
    assert_eq!(candidate.source_message_id, "amz-001");
}

#[test]
fn test_duplicate_message_ids_yield_one_candidate() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let receipt = email(
        "Receipt for Blue Bottle",
        "Thank you for your purchase. Total: $7.75",
        "bb-42",
    );

    // Same message id twice within one batch
    let result = pipeline.process_email_batch(
        &[receipt.clone(), receipt.clone()],
        &HashSet::new(),
        &[],
    );
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.duplicates, 1);

    // Reprocessing against the stored id set yields zero candidates
    let existing: HashSet<String> = ["bb-42".to_string()].into_iter().collect();
    let result = pipeline.process_email_batch(&[receipt], &existing, &[]);
    assert!(result.items.is_empty());
    assert_eq!(result.duplicates, 1);
    assert_eq!(result.rejected, 0);
}

#[test]
fn test_malformed_email_does_not_abort_batch() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let emails = vec![
        email("Newsletter", "No purchase here, just words.", "n-1"),
        email(
            "Your Target order",
            "Total: $19.99. Order Date: 03/04/2024",
            "t-1",
        ),
    ];

    let result = pipeline.process_email_batch(&emails, &HashSet::new(), &[]);
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.rejected, 1);
    assert_eq!(result.items[0].candidate.merchant, "Target");
}

// =============================================================================
// Classification
// =============================================================================

#[test]
fn test_rule_fallback_with_untrained_model() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let categories = vec![category(1, 1, "Travel"), category(2, 1, "Food")];
    let emails = vec![email(
        "Your Delta Airlines receipt",
        "Flight booking confirmed. Total: $320.00",
        "dl-1",
    )];

    let result = pipeline.process_email_batch(&emails, &HashSet::new(), &categories);
    assert_eq!(result.items.len(), 1);
    let item = &result.items[0];
    assert_eq!(item.prediction.category_name, "Travel");
    assert!(item.prediction.confidence > 0.0);
    assert_eq!(item.category_id, Some(1));
    assert_eq!(item.provenance, CategoryProvenance::Predicted);
}

#[test]
fn test_retrain_then_classify_with_model() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let categories = vec![category(1, 1, "Food"), category(2, 1, "Bills")];

    let labeled = [
        ("Starbucks coffee", 1),
        ("Chipotle lunch", 1),
        ("Wegmans groceries", 1),
        ("Pizza Hut dinner", 1),
        ("Subway sandwich", 1),
        ("Comcast internet", 2),
        ("Verizon wireless", 2),
        ("ConEd utility", 2),
        ("Geico insurance", 2),
        ("National Grid gas", 2),
    ];
    let expenses: Vec<Expense> = labeled
        .iter()
        .enumerate()
        .map(|(i, (merchant, cat))| {
            expense(
                i as i64,
                1,
                date,
                15.0,
                merchant,
                Some(*cat),
                CategoryProvenance::UserAssigned,
            )
        })
        .collect();

    let outcome = pipeline
        .retrain_if_due(&expenses, &categories, Utc::now())
        .unwrap();
    assert!(matches!(outcome, Some(TrainOutcome::Trained(_))));

    let prediction = pipeline.classify_expense(&expense(
        99,
        1,
        date,
        4.50,
        "Starbucks coffee",
        None,
        CategoryProvenance::None,
    ));
    assert_eq!(prediction.category_name, "Food");
    assert!(prediction.confidence >= 0.6);
}

// =============================================================================
// Forecasting
// =============================================================================

#[test]
fn test_forecast_insufficient_history() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let expenses: Vec<Expense> = (0..5)
        .map(|i| {
            expense(
                i,
                1,
                start + Duration::days(i),
                20.0,
                "Market",
                None,
                CategoryProvenance::None,
            )
        })
        .collect();

    match pipeline.forecast_for_user(1, &expenses, Utc::now()) {
        ForecastOutcome::InsufficientHistory {
            observations,
            required,
        } => {
            assert_eq!(observations, 5);
            assert_eq!(required, 28);
        }
        ForecastOutcome::Series(_) => panic!("5 expenses must not produce a series"),
    }
}

#[test]
fn test_forecast_series_properties() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let expenses: Vec<Expense> = (0..42)
        .map(|i| {
            expense(
                i,
                1,
                start + Duration::days(i),
                25.0 + (i % 7) as f64 * 3.0,
                "Market",
                None,
                CategoryProvenance::None,
            )
        })
        .collect();

    let outcome = pipeline.forecast_for_user(1, &expenses, Utc::now());
    let series = match outcome {
        ForecastOutcome::Series(s) => s,
        ForecastOutcome::InsufficientHistory { .. } => panic!("42 days is plenty"),
    };
    assert_eq!(series.points.len(), 30);

    let mut prev_width = 0.0;
    for point in &series.points {
        assert!(point.amount >= 0.0);
        assert!(point.lower_bound >= 0.0);
        let width = point.upper_bound - point.lower_bound;
        assert!(width >= prev_width - 1e-9);
        prev_width = width;
    }

    // Dates continue daily from the end of history
    assert_eq!(
        series.points[0].date,
        start + Duration::days(42)
    );
}

// =============================================================================
// Clustering & Recommendations
// =============================================================================

fn two_archetype_population() -> (Vec<Expense>, Vec<Category>) {
    let as_of = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let mut categories = Vec::new();
    let mut expenses = Vec::new();
    let mut id = 1;
    for user in 1..=6 {
        let food = user * 10;
        let travel = user * 10 + 1;
        categories.push(category(food, user, "Food"));
        categories.push(category(travel, user, "Travel"));

        for i in 0..12 {
            let date = as_of - Duration::days(7 * i);
            let (cat, amount) = if user > 3 {
                if i % 3 == 0 { (food, 20.0) } else { (travel, 150.0) }
            } else if i % 3 == 0 {
                (travel, 20.0)
            } else {
                (food, 40.0)
            };
            expenses.push(expense(
                id,
                user,
                date,
                amount,
                "Test",
                Some(cat),
                CategoryProvenance::UserAssigned,
            ));
            id += 1;
        }
    }
    (expenses, categories)
}

#[test]
fn test_recommendations_compare_against_peers() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let (expenses, categories) = two_archetype_population();
    let as_of = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

    let outcome = pipeline.recommend_for_user(1, &expenses, &categories, as_of, Utc::now(), None);
    let budget = match outcome {
        RecommendationOutcome::Ready(b) => b,
        RecommendationOutcome::InsufficientData => panic!("user 1 has twelve weeks of history"),
    };

    assert!(budget.predicted_monthly_expense > 0.0);
    // User 1's trailing total is 4 * 20 + 8 * 40 = 400
    for line in &budget.recommendations {
        let expected = line.recommended_percentage / 100.0 * 400.0;
        assert!(
            (line.recommended_budget - expected).abs() < 0.02,
            "{}: {} vs {}",
            line.category,
            line.recommended_budget,
            expected
        );
    }
}

#[test]
fn test_sparse_user_gets_insufficient_data() {
    let pipeline = ExpensePipeline::new(PipelineConfig::default()).unwrap();
    let (mut expenses, categories) = two_archetype_population();
    let as_of = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

    // User 7 has only three transactions
    for i in 0..3 {
        expenses.push(expense(
            1000 + i,
            7,
            as_of - Duration::days(10 * i),
            30.0,
            "Test",
            None,
            CategoryProvenance::None,
        ));
    }

    let outcome = pipeline.recommend_for_user(7, &expenses, &categories, as_of, Utc::now(), None);
    assert!(matches!(outcome, RecommendationOutcome::InsufficientData));
}

// =============================================================================
// Category Lifecycle
// =============================================================================

#[test]
fn test_delete_category_reassigns_to_uncategorized() {
    let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let categories = vec![category(1, 1, "Dining"), category(2, 1, UNCATEGORIZED)];
    let expenses: Vec<Expense> = (0..3)
        .map(|i| {
            expense(
                i,
                1,
                date,
                12.0,
                "Cafe",
                Some(1),
                CategoryProvenance::UserAssigned,
            )
        })
        .collect();

    let plan = plan_category_deletion(&categories, &expenses, 1).unwrap();
    assert_eq!(plan.reassign_expense_ids.len(), 3);
    assert_eq!(plan.target, ReassignTarget::Existing { category_id: 2 });

    // After the store applies the plan, a repeat delete is not-found
    let remaining = vec![category(2, 1, UNCATEGORIZED)];
    assert!(plan_category_deletion(&remaining, &[], 1).is_err());
}

// =============================================================================
// Manual Entry Dedup
// =============================================================================

#[test]
fn test_manual_entry_hash_dedups_like_message_ids() {
    let date = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();

    // The store keys manual entries by this hash the way email-sourced
    // expenses are keyed by message id
    let first = manual_expense_hash(&date, "Corner Deli", 11.25);
    let repeat = manual_expense_hash(&date, "Corner Deli", 11.25);
    assert_eq!(first, repeat);

    let other_day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
    assert_ne!(first, manual_expense_hash(&other_day, "Corner Deli", 11.25));
    assert_ne!(first, manual_expense_hash(&date, "Corner Deli", 11.26));
}
