//! Upstream price history port.

use crate::domain::error::RsrankError;
use crate::domain::ohlcv::PriceBar;
use chrono::NaiveDate;

/// Which slice of a symbol's bars to load.
///
/// With `after = None` the whole history (up to `through`) is returned.
/// With `after = Some(d)` the result is every bar dated after `d` plus the
/// last `context_rows` bars dated on or before `d`, enough to seed rolling
/// windows without reading the full history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRequest {
    pub after: Option<NaiveDate>,
    pub context_rows: usize,
    pub through: Option<NaiveDate>,
}

impl HistoryRequest {
    pub fn full() -> Self {
        Self {
            after: None,
            context_rows: 0,
            through: None,
        }
    }

    pub fn incremental(after: Option<NaiveDate>, context_rows: usize) -> Self {
        Self {
            after,
            context_rows,
            through: None,
        }
    }

    /// The last `rows` bars on or before `date`.
    pub fn tail(date: NaiveDate, rows: usize) -> Self {
        Self {
            after: Some(date),
            context_rows: rows,
            through: Some(date),
        }
    }

    /// Applies the request to date-ordered bars.
    pub fn slice<'a>(&self, bars: &'a [PriceBar]) -> &'a [PriceBar] {
        let end = match self.through {
            Some(t) => bars.partition_point(|b| b.date <= t),
            None => bars.len(),
        };
        let bars = &bars[..end];
        match self.after {
            None => bars,
            Some(a) => {
                let split = bars.partition_point(|b| b.date <= a);
                &bars[split.saturating_sub(self.context_rows)..]
            }
        }
    }
}

pub trait PriceHistoryPort {
    fn list_symbols(&self) -> Result<Vec<String>, RsrankError>;

    /// Date-ordered bars for one symbol.
    fn fetch_history(
        &self,
        symbol: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<PriceBar>, RsrankError>;

    /// Date-ordered bars for a benchmark series.
    fn fetch_benchmark(
        &self,
        symbol: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<PriceBar>, RsrankError>;

    /// Every date with at least one symbol bar, ascending.
    fn trading_dates(&self) -> Result<Vec<NaiveDate>, RsrankError>;

    fn latest_date(&self) -> Result<Option<NaiveDate>, RsrankError> {
        Ok(self.trading_dates()?.last().copied())
    }
}
