//! Per-symbol bar history and trading-row windows.

use crate::domain::ohlcv::PriceBar;
use chrono::NaiveDate;
use std::collections::HashMap;

/// Date-ordered bars for one symbol with a date → row index lookup.
///
/// Row offsets are trading-day offsets: `bars[i - w]` is the bar `w` trading
/// days before `bars[i]`, whatever the calendar gap between them.
#[derive(Debug, Clone)]
pub struct SymbolHistory {
    pub symbol: String,
    pub bars: Vec<PriceBar>,
    pub date_index: HashMap<NaiveDate, usize>,
}

impl SymbolHistory {
    pub fn new(symbol: String, mut bars: Vec<PriceBar>) -> Self {
        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);
        let date_index = bars
            .iter()
            .enumerate()
            .map(|(i, bar)| (bar.date, i))
            .collect();
        Self {
            symbol,
            bars,
            date_index,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn get_bar_index(&self, date: NaiveDate) -> Option<usize> {
        self.date_index.get(&date).copied()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }
}

/// The date `rows` trading days before the end of `calendar` (inclusive window start).
pub fn window_start(calendar: &[NaiveDate], rows: usize) -> Option<NaiveDate> {
    if calendar.is_empty() || rows == 0 {
        return None;
    }
    let start = calendar.len().saturating_sub(rows);
    calendar.get(start).copied()
}
