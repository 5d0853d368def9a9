//! Per-user spend forecasting
//!
//! Fits an additive model over daily spend totals: a least-squares linear
//! trend plus mean weekday effects (weekly seasonality) plus a residual
//! spread that drives the uncertainty band. The band half-width grows with
//! the horizon and never narrows. Spending cannot be negative, so point
//! estimates are clipped at zero; a truncated band keeps its nominal width
//! by letting the upper bound absorb the clipped mass.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::models::{Expense, ForecastPoint, ForecastSeries};

/// One aggregated observation: total spend for a calendar day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub amount: f64,
}

/// Aggregate expenses into chronologically ordered daily totals
pub fn daily_totals(expenses: &[Expense]) -> Vec<Observation> {
    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for expense in expenses {
        *by_day.entry(expense.date).or_insert(0.0) += expense.amount;
    }
    by_day
        .into_iter()
        .map(|(date, amount)| Observation { date, amount })
        .collect()
}

/// Outcome of a forecast request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForecastOutcome {
    Series(ForecastSeries),
    /// Not enough history to make seasonal decomposition meaningful
    InsufficientHistory { observations: usize, required: usize },
}

impl ForecastOutcome {
    pub fn series(&self) -> Option<&ForecastSeries> {
        match self {
            Self::Series(s) => Some(s),
            Self::InsufficientHistory { .. } => None,
        }
    }
}

/// Fitted per-user model state
///
/// Replaced wholesale on each refit; never shared across users and never
/// incrementally updated.
#[derive(Debug, Clone)]
pub struct FittedSpendModel {
    intercept: f64,
    slope: f64,
    weekday_effects: [f64; 7],
    sigma: f64,
    n: usize,
    last_date: NaiveDate,
}

impl FittedSpendModel {
    /// Produce `periods` future points with an uncertainty band
    pub fn project(&self, periods: usize, z: f64) -> ForecastSeries {
        let mut points = Vec::with_capacity(periods);

        for h in 1..=periods {
            let date = self.last_date + Duration::days(h as i64);
            let t = (self.n - 1) as f64 + h as f64;
            let weekday = date.weekday().num_days_from_monday() as usize;
            let estimate = self.intercept + self.slope * t + self.weekday_effects[weekday];

            // Half-width grows with horizon; rounding to cents first keeps
            // the band width monotone after rounding too.
            let half = round_cents(z * self.sigma * (1.0 + h as f64 / self.n as f64).sqrt());
            let point = round_cents(estimate.max(0.0));
            let lower = (point - half).max(0.0);
            let upper = lower + 2.0 * half;

            points.push(ForecastPoint {
                date,
                amount: point,
                lower_bound: round_cents(lower),
                upper_bound: round_cents(upper),
            });
        }

        ForecastSeries { points }
    }
}

/// Spend forecaster with config-driven floors
#[derive(Debug, Clone)]
pub struct SpendForecaster {
    min_observations: usize,
    min_span_days: i64,
    interval_z: f64,
}

impl SpendForecaster {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_observations: config.min_forecast_observations,
            min_span_days: config.min_forecast_span_days,
            interval_z: config.forecast_interval_z,
        }
    }

    /// Fit and forecast in one step with the configured observation floor
    pub fn forecast(&self, observations: &[Observation], periods: usize) -> ForecastOutcome {
        self.forecast_with_floor(observations, periods, self.min_observations)
    }

    /// Variant with a caller-chosen observation floor (used by the sparser
    /// per-category forecasts)
    pub fn forecast_with_floor(
        &self,
        observations: &[Observation],
        periods: usize,
        min_observations: usize,
    ) -> ForecastOutcome {
        match self.fit_with_floor(observations, min_observations) {
            Some(model) => ForecastOutcome::Series(model.project(periods, self.interval_z)),
            None => ForecastOutcome::InsufficientHistory {
                observations: observations.len(),
                required: min_observations,
            },
        }
    }

    /// Fit the additive model, or None below the observation/span floor
    pub fn fit(&self, observations: &[Observation]) -> Option<FittedSpendModel> {
        self.fit_with_floor(observations, self.min_observations)
    }

    fn fit_with_floor(
        &self,
        observations: &[Observation],
        min_observations: usize,
    ) -> Option<FittedSpendModel> {
        if observations.is_empty() || observations.len() < min_observations {
            return None;
        }

        let first = observations[0].date;
        let last = observations[observations.len() - 1].date;
        let span = (last - first).num_days() + 1;
        if span < self.min_span_days {
            debug!(span, required = self.min_span_days, "history span too short");
            return None;
        }

        // Zero-fill interior gaps: a day with no expenses is a zero-spend
        // day, not a missing measurement.
        let mut series: Vec<(NaiveDate, f64)> = Vec::with_capacity(span as usize);
        let mut iter = observations.iter().peekable();
        let mut day = first;
        while day <= last {
            let amount = match iter.peek() {
                Some(obs) if obs.date == day => {
                    let a = obs.amount;
                    iter.next();
                    a
                }
                _ => 0.0,
            };
            series.push((day, amount));
            day += Duration::days(1);
        }

        let n = series.len();
        let nf = n as f64;

        // Least-squares linear trend over the day index
        let t_mean = (nf - 1.0) / 2.0;
        let y_mean = series.iter().map(|(_, y)| y).sum::<f64>() / nf;
        let mut cov = 0.0;
        let mut var = 0.0;
        for (t, (_, y)) in series.iter().enumerate() {
            let dt = t as f64 - t_mean;
            cov += dt * (y - y_mean);
            var += dt * dt;
        }
        let slope = if var > 0.0 { cov / var } else { 0.0 };
        let intercept = y_mean - slope * t_mean;

        // Mean weekday residual = weekly seasonal component
        let mut weekday_sums = [0.0f64; 7];
        let mut weekday_counts = [0usize; 7];
        for (t, (date, y)) in series.iter().enumerate() {
            let residual = y - (intercept + slope * t as f64);
            let weekday = date.weekday().num_days_from_monday() as usize;
            weekday_sums[weekday] += residual;
            weekday_counts[weekday] += 1;
        }
        let mut weekday_effects = [0.0f64; 7];
        for w in 0..7 {
            if weekday_counts[w] > 0 {
                weekday_effects[w] = weekday_sums[w] / weekday_counts[w] as f64;
            }
        }

        // Residual spread after trend and seasonality
        let mut squared = 0.0;
        for (t, (date, y)) in series.iter().enumerate() {
            let weekday = date.weekday().num_days_from_monday() as usize;
            let fitted = intercept + slope * t as f64 + weekday_effects[weekday];
            squared += (y - fitted) * (y - fitted);
        }
        let sigma = (squared / nf).sqrt();

        debug!(n, slope, sigma, "spend model fitted");
        Some(FittedSpendModel {
            intercept,
            slope,
            weekday_effects,
            sigma,
            n,
            last_date: last,
        })
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
