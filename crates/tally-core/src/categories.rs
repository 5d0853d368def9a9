//! Category lifecycle helpers
//!
//! The external store owns category persistence; these are pure planning
//! functions it calls to keep the lifecycle rules in one place: the default
//! set seeded at account creation, case-insensitive name resolution, and the
//! reassignment plan when a category is deleted.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Category, Expense};

/// Name of the catch-all category expenses fall back to on deletion
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Default category names created for a new account
pub const DEFAULT_CATEGORIES: [&str; 6] = [
    "Food",
    "Shopping",
    "Transportation",
    "Entertainment",
    "Bills",
    "Other",
];

/// Resolve a category by name, case-insensitively
///
/// Names are unique per user case-insensitively, so at most one snapshot
/// matches.
pub fn resolve_category<'a>(categories: &'a [Category], name: &str) -> Option<&'a Category> {
    let lower = name.trim().to_lowercase();
    categories.iter().find(|c| c.name.to_lowercase() == lower)
}

/// Where deleted-category expenses should land
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReassignTarget {
    /// An existing "Uncategorized" category
    Existing { category_id: i64 },
    /// The store must create "Uncategorized" for this user first
    CreateUncategorized { user_id: i64 },
}

/// Plan produced for the store when a category is deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryDeletionPlan {
    pub category_id: i64,
    /// Expenses that must be moved before the category row is removed
    pub reassign_expense_ids: Vec<i64>,
    pub target: ReassignTarget,
}

/// Plan the deletion of a category
///
/// Dependent expenses are reassigned to the user's "Uncategorized" category,
/// created on demand if absent. An unknown id (including a repeated delete)
/// is a `NotFound` error.
pub fn plan_category_deletion(
    categories: &[Category],
    expenses: &[Expense],
    category_id: i64,
) -> Result<CategoryDeletionPlan> {
    let category = categories
        .iter()
        .find(|c| c.id == category_id)
        .ok_or_else(|| Error::NotFound(format!("Category {}", category_id)))?;

    let reassign_expense_ids: Vec<i64> = expenses
        .iter()
        .filter(|e| e.category_id == Some(category_id))
        .map(|e| e.id)
        .collect();

    // The fallback category itself can never be deleted while expenses could
    // still reference it.
    if category.name.eq_ignore_ascii_case(UNCATEGORIZED) {
        return Err(Error::InvalidData(format!(
            "Cannot delete the {} category",
            UNCATEGORIZED
        )));
    }

    let target = match categories
        .iter()
        .find(|c| c.user_id == category.user_id && c.name.eq_ignore_ascii_case(UNCATEGORIZED))
    {
        Some(existing) => ReassignTarget::Existing {
            category_id: existing.id,
        },
        None => ReassignTarget::CreateUncategorized {
            user_id: category.user_id,
        },
    };

    Ok(CategoryDeletionPlan {
        category_id,
        reassign_expense_ids,
        target,
    })
}
