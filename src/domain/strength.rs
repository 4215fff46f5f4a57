//! Benchmark-relative strength scoring.
//!
//! `raw_score(s, d) = Σ weight_i × (return(s, d, w_i) − return(benchmark, d, w_i))`.
//! The score fails closed: any undefined window return on either side, or a
//! date with no benchmark bar, leaves the score undefined for that date.

use crate::domain::error::RsrankError;
use crate::domain::history::SymbolHistory;
use crate::domain::returns::{returns_at, SCORING_WINDOWS};
use chrono::NaiveDate;
use std::collections::HashMap;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub windows: Vec<usize>,
    pub weights: Vec<f64>,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            windows: SCORING_WINDOWS.to_vec(),
            weights: vec![0.4, 0.4, 0.2],
        }
    }
}

impl ScoringWeights {
    pub fn new(windows: Vec<usize>, weights: Vec<f64>) -> Result<Self, RsrankError> {
        let invalid = |reason: &str| RsrankError::ConfigInvalid {
            section: "scoring".into(),
            key: "weights".into(),
            reason: reason.into(),
        };
        if windows.is_empty() || windows.len() != weights.len() {
            return Err(invalid("windows and weights must be non-empty and the same length"));
        }
        if windows.contains(&0) {
            return Err(RsrankError::ConfigInvalid {
                section: "scoring".into(),
                key: "windows".into(),
                reason: "windows must be positive".into(),
            });
        }
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(invalid("weights must be non-negative"));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(invalid("weights must sum to 1"));
        }
        Ok(Self { windows, weights })
    }

    pub fn max_window(&self) -> usize {
        self.windows.iter().copied().max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelativeStrengthScore {
    pub symbol: String,
    pub date: NaiveDate,
    pub raw_score: f64,
}

/// Benchmark window returns keyed by date, computed over the benchmark's own rows.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkReturns {
    by_date: HashMap<NaiveDate, Vec<Option<f64>>>,
}

impl BenchmarkReturns {
    pub fn from_history(history: &SymbolHistory, weights: &ScoringWeights) -> Self {
        let closes = history.closes();
        let by_date = history
            .bars
            .iter()
            .enumerate()
            .map(|(i, bar)| (bar.date, returns_at(&closes, i, &weights.windows)))
            .collect();
        Self { by_date }
    }

    pub fn get(&self, date: NaiveDate) -> Option<&[Option<f64>]> {
        self.by_date.get(&date).map(|v| v.as_slice())
    }
}

pub fn raw_score(
    symbol_returns: &[Option<f64>],
    benchmark_returns: &[Option<f64>],
    weights: &[f64],
) -> Option<f64> {
    if symbol_returns.len() != weights.len() || benchmark_returns.len() != weights.len() {
        return None;
    }
    let mut score = 0.0;
    for ((s, b), w) in symbol_returns.iter().zip(benchmark_returns).zip(weights) {
        score += w * ((*s)? - (*b)?);
    }
    Some(score)
}

#[derive(Debug, Clone, Default)]
pub struct ScoreOutcome {
    pub scores: Vec<RelativeStrengthScore>,
    /// Dates with a symbol bar but no benchmark bar.
    pub missing_benchmark: Vec<NaiveDate>,
}

/// Scores every bar of `history` dated after `after`.
pub fn score_history(
    history: &SymbolHistory,
    benchmark: &BenchmarkReturns,
    weights: &ScoringWeights,
    after: Option<NaiveDate>,
) -> ScoreOutcome {
    let closes = history.closes();
    let mut outcome = ScoreOutcome::default();

    for (i, bar) in history.bars.iter().enumerate() {
        if after.is_some_and(|a| bar.date <= a) {
            continue;
        }
        let Some(bench) = benchmark.get(bar.date) else {
            outcome.missing_benchmark.push(bar.date);
            continue;
        };
        let own = returns_at(&closes, i, &weights.windows);
        if let Some(score) = raw_score(&own, bench, &weights.weights) {
            outcome.scores.push(RelativeStrengthScore {
                symbol: history.symbol.clone(),
                date: bar.date,
                raw_score: score,
            });
        }
    }

    outcome
}
