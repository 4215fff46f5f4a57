//! Moving averages and volatility over a symbol's bar history.
//!
//! - `IndicatorPoint`: one point in an indicator time series
//! - `IndicatorType`: indicator identity + parameters
//! - `IndicatorSeries`: a time series of indicator values
//! - `IndicatorRecord`: the persisted per-(symbol, date) row

pub mod atr;
pub mod ema;
pub mod sma;

use crate::domain::history::SymbolHistory;
use chrono::NaiveDate;
use std::fmt;

pub const SMA_FAST: usize = 50;
pub const SMA_SLOW: usize = 200;
pub const EMA_FAST: usize = 10;
pub const EMA_SLOW: usize = 20;
pub const ATR_PERIOD: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorPoint {
    pub date: NaiveDate,
    pub valid: bool,
    pub value: f64,
}

impl IndicatorPoint {
    pub fn warmup(date: NaiveDate) -> Self {
        Self {
            date,
            valid: false,
            value: 0.0,
        }
    }

    pub fn get(&self) -> Option<f64> {
        self.valid.then_some(self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorType {
    Sma(usize),
    Ema(usize),
    AtrPct(usize),
}

impl IndicatorType {
    /// Bars needed before the first valid value.
    pub fn warmup_bars(&self) -> usize {
        match self {
            IndicatorType::Sma(n) | IndicatorType::Ema(n) => *n,
            IndicatorType::AtrPct(n) => n + 1,
        }
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorType::Sma(period) => write!(f, "SMA({})", period),
            IndicatorType::Ema(period) => write!(f, "EMA({})", period),
            IndicatorType::AtrPct(period) => write!(f, "ATR%({})", period),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    pub indicator_type: IndicatorType,
    pub values: Vec<IndicatorPoint>,
}

impl IndicatorSeries {
    pub fn empty(indicator_type: IndicatorType) -> Self {
        Self {
            indicator_type,
            values: Vec::new(),
        }
    }

    pub fn value_at(&self, index: usize) -> Option<f64> {
        self.values.get(index).and_then(IndicatorPoint::get)
    }
}

/// Persisted indicator row. Each field is `None` until its window of history exists.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub ema_10: Option<f64>,
    pub ema_20: Option<f64>,
    pub atr_pct_20: Option<f64>,
}

/// All indicator series for one history, aligned with `history.bars`.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    pub sma_50: IndicatorSeries,
    pub sma_200: IndicatorSeries,
    pub ema_10: IndicatorSeries,
    pub ema_20: IndicatorSeries,
    pub atr_pct_20: IndicatorSeries,
}

impl IndicatorSet {
    pub fn calculate(history: &SymbolHistory) -> Self {
        Self {
            sma_50: sma::calculate_sma(&history.bars, SMA_FAST),
            sma_200: sma::calculate_sma(&history.bars, SMA_SLOW),
            ema_10: ema::calculate_ema(&history.bars, EMA_FAST),
            ema_20: ema::calculate_ema(&history.bars, EMA_SLOW),
            atr_pct_20: atr::calculate_atr_pct(&history.bars, ATR_PERIOD),
        }
    }

    pub fn record_at(&self, history: &SymbolHistory, index: usize) -> Option<IndicatorRecord> {
        let bar = history.bars.get(index)?;
        Some(IndicatorRecord {
            symbol: history.symbol.clone(),
            date: bar.date,
            sma_50: self.sma_50.value_at(index),
            sma_200: self.sma_200.value_at(index),
            ema_10: self.ema_10.value_at(index),
            ema_20: self.ema_20.value_at(index),
            atr_pct_20: self.atr_pct_20.value_at(index),
        })
    }
}

/// Indicator rows for bars dated after `after`.
///
/// `history` must include enough bars before `after` to seed the windows; EMA
/// values only match a full recompute once roughly 5× the span of context is
/// present.
pub fn compute_indicators(
    history: &SymbolHistory,
    after: Option<NaiveDate>,
) -> Vec<IndicatorRecord> {
    let set = IndicatorSet::calculate(history);
    history
        .bars
        .iter()
        .enumerate()
        .filter(|(_, bar)| after.is_none_or(|a| bar.date > a))
        .filter_map(|(i, _)| set.record_at(history, i))
        .collect()
}
