//! Daily price bar representation.

use chrono::NaiveDate;

/// One daily OHLCV bar. Unique per (symbol, date); benchmark bars share the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl PriceBar {
    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }

    /// True range as a percentage of the previous close. `None` for a non-positive close.
    pub fn true_range_pct(&self, prev_close: f64) -> Option<f64> {
        if prev_close <= 0.0 {
            return None;
        }
        Some(self.true_range(prev_close) / prev_close * 100.0)
    }

    pub fn dollar_volume(&self) -> f64 {
        self.close * self.volume as f64
    }
}
