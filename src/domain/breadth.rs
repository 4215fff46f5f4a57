//! Daily market breadth: how many symbols sit above or below their moving
//! averages and how many moved 4% or more on the day.

use crate::domain::history::SymbolHistory;
use crate::domain::indicator::IndicatorSet;
use chrono::NaiveDate;
use std::collections::BTreeMap;

const BIG_MOVE_PCT: f64 = 4.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreadthRecord {
    pub date: NaiveDate,
    pub total: usize,
    pub above_sma_50: usize,
    pub below_sma_50: usize,
    pub above_sma_200: usize,
    pub below_sma_200: usize,
    pub up_4pct: usize,
    pub down_4pct: usize,
}

impl BreadthRecord {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            total: 0,
            above_sma_50: 0,
            below_sma_50: 0,
            above_sma_200: 0,
            below_sma_200: 0,
            up_4pct: 0,
            down_4pct: 0,
        }
    }

    pub fn add(&mut self, sample: &BreadthSample) {
        self.total += 1;
        if let Some(sma) = sample.sma_50 {
            if sample.close > sma {
                self.above_sma_50 += 1;
            } else if sample.close < sma {
                self.below_sma_50 += 1;
            }
        }
        if let Some(sma) = sample.sma_200 {
            if sample.close > sma {
                self.above_sma_200 += 1;
            } else if sample.close < sma {
                self.below_sma_200 += 1;
            }
        }
        if let Some(change) = sample.daily_change_pct() {
            if change >= BIG_MOVE_PCT {
                self.up_4pct += 1;
            } else if change <= -BIG_MOVE_PCT {
                self.down_4pct += 1;
            }
        }
    }
}

/// One symbol's contribution to one date.
#[derive(Debug, Clone, PartialEq)]
pub struct BreadthSample {
    pub date: NaiveDate,
    pub close: f64,
    pub prev_close: f64,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
}

impl BreadthSample {
    pub fn daily_change_pct(&self) -> Option<f64> {
        (self.prev_close > 0.0).then(|| (self.close - self.prev_close) / self.prev_close * 100.0)
    }
}

/// Samples for bars after `after`. A bar counts once it has a previous close
/// and at least one of its moving averages.
pub fn breadth_samples(
    history: &SymbolHistory,
    indicators: &IndicatorSet,
    after: Option<NaiveDate>,
) -> Vec<BreadthSample> {
    let mut samples = Vec::new();
    for i in 1..history.len() {
        let bar = &history.bars[i];
        if after.is_some_and(|a| bar.date <= a) {
            continue;
        }
        let sma_50 = indicators.sma_50.value_at(i);
        let sma_200 = indicators.sma_200.value_at(i);
        if sma_50.is_none() && sma_200.is_none() {
            continue;
        }
        samples.push(BreadthSample {
            date: bar.date,
            close: bar.close,
            prev_close: history.bars[i - 1].close,
            sma_50,
            sma_200,
        });
    }
    samples
}

/// Folds samples from every symbol into one record per date, ascending.
pub fn tally_breadth<'a>(samples: impl IntoIterator<Item = &'a BreadthSample>) -> Vec<BreadthRecord> {
    let mut by_date: BTreeMap<NaiveDate, BreadthRecord> = BTreeMap::new();
    for sample in samples {
        by_date
            .entry(sample.date)
            .or_insert_with(|| BreadthRecord::new(sample.date))
            .add(sample);
    }
    by_date.into_values().collect()
}
