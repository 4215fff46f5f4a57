#![allow(dead_code)]

use chrono::{Datelike, NaiveDate, Weekday};
use rsrank::adapters::sqlite_adapter::SqliteAdapter;
use rsrank::domain::cohort::SymbolProfile;
use rsrank::domain::error::RsrankError;
use rsrank::domain::materializer::PipelineConfig;
pub use rsrank::domain::ohlcv::PriceBar;
use rsrank::domain::screening::ScreenListing;
use rsrank::domain::snapshot::RsRanks;
use rsrank::domain::trigger::TriggerMatch;
use rsrank::ports::cohort_port::CohortPort;
use rsrank::ports::data_port::{HistoryRequest, PriceHistoryPort};
use rsrank::ports::store_port::{
    Batch, BatchRows, DerivedStore, DerivedTable, Replacement, Watermark,
};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const BENCHMARK: &str = "SPY";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// `n` weekdays starting at `start`.
pub fn trading_days(start: NaiveDate, n: usize) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(n);
    let mut d = start;
    while days.len() < n {
        if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(d);
        }
        d = d.succ_opt().unwrap();
    }
    days
}

pub fn make_bar(symbol: &str, date: NaiveDate, close: f64, volume: i64) -> PriceBar {
    PriceBar {
        symbol: symbol.to_string(),
        date,
        open: close,
        high: close * 1.01,
        low: close * 0.99,
        close,
        volume,
    }
}

/// Four symbols with different shapes. GAP jumps 20% on heavy volume on the last day.
pub fn universe_bars(days: &[NaiveDate]) -> Vec<PriceBar> {
    let last = days.len() - 1;
    let mut bars = Vec::new();
    for (i, &d) in days.iter().enumerate() {
        let x = i as f64;
        bars.push(make_bar("AAA", d, 100.0 + 0.5 * x, 200_000));
        bars.push(make_bar("BBB", d, 150.0 - 0.4 * x, 300_000 + (i as i64 % 7) * 1_000));
        bars.push(make_bar("CCC", d, 80.0 + ((i * 7) % 5) as f64 * 0.5, 150_000));
        let gap_close = 60.0 + 0.1 * x;
        if i == last {
            bars.push(make_bar("GAP", d, gap_close * 1.2, 2_000_000));
        } else {
            bars.push(make_bar("GAP", d, gap_close, 200_000));
        }
    }
    bars
}

pub fn benchmark_bars(days: &[NaiveDate]) -> Vec<PriceBar> {
    days.iter()
        .enumerate()
        .map(|(i, &d)| make_bar(BENCHMARK, d, 400.0 + 0.2 * i as f64, 1_000_000))
        .collect()
}

fn profile(symbol: &str, cap: f64, sector: &str, industry: &str, indexes: &[&str]) -> SymbolProfile {
    SymbolProfile {
        symbol: symbol.to_string(),
        market_cap: Some(cap),
        sector: Some(sector.to_string()),
        industry: Some(industry.to_string()),
        index_memberships: indexes.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn profiles() -> Vec<SymbolProfile> {
    vec![
        profile("AAA", 5.0e9, "Technology", "Software", &["SP500"]),
        profile("BBB", 3.0e10, "Energy", "Oil & Gas", &["SP500", "NDX"]),
        profile("CCC", 1.5e8, "Healthcare", "Biotechnology", &[]),
        profile("GAP", 2.0e9, "Industrials", "Machinery", &["SP500"]),
    ]
}

/// Row of the spike symbol LIFT in [`long_universe_bars`] that jumps 20% on
/// ten times its usual volume.
pub const LIFT_SPIKE_ROW: usize = 99;

/// Positive, non-monotonic series for histories longer than the context window.
pub fn long_universe_bars(days: &[NaiveDate]) -> Vec<PriceBar> {
    let mut bars = Vec::new();
    for (i, &d) in days.iter().enumerate() {
        let x = i as f64;
        bars.push(make_bar("AAA", d, 100.0 + 0.1 * x + 5.0 * (x / 9.0).sin(), 200_000));
        bars.push(make_bar(
            "BBB",
            d,
            80.0 + 0.02 * x + 10.0 * (x / 23.0).sin(),
            300_000 + (i as i64 % 11) * 2_000,
        ));
        bars.push(make_bar("DDD", d, 30.0 + 0.03 * x + 2.0 * (x / 7.0).cos(), 150_000));
        let lift = 50.0 + 0.05 * x;
        if i < LIFT_SPIKE_ROW {
            bars.push(make_bar("LIFT", d, lift, 100_000));
        } else if i == LIFT_SPIKE_ROW {
            bars.push(make_bar("LIFT", d, lift * 1.2, 1_000_000));
        } else {
            bars.push(make_bar("LIFT", d, lift * 1.2, 100_000));
        }
    }
    bars
}

pub fn long_benchmark_bars(days: &[NaiveDate]) -> Vec<PriceBar> {
    days.iter()
        .enumerate()
        .map(|(i, &d)| {
            let x = i as f64;
            make_bar(BENCHMARK, d, 400.0 + 0.15 * x + 8.0 * (x / 31.0).sin(), 1_000_000)
        })
        .collect()
}

pub fn long_profiles() -> Vec<SymbolProfile> {
    vec![
        profile("AAA", 5.0e9, "Technology", "Software", &["SP500"]),
        profile("BBB", 3.0e10, "Energy", "Oil & Gas", &["SP500", "NDX"]),
        profile("DDD", 8.0e8, "Utilities", "Electric", &[]),
        profile("LIFT", 2.5e9, "Industrials", "Machinery", &["SP500"]),
    ]
}

pub fn seed_long(store: &SqliteAdapter, days: &[NaiveDate]) {
    store.insert_bars(&long_universe_bars(days)).unwrap();
    store.insert_benchmark_bars(&long_benchmark_bars(days)).unwrap();
    store.upsert_profiles(&long_profiles()).unwrap();
}

pub type IndicatorRow = (String, String, [Option<f64>; 5]);

/// Indicator rows ordered by symbol and date.
pub fn indicator_rows(path: &Path) -> Vec<IndicatorRow> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT symbol, date, sma_50, sma_200, ema_10, ema_20, atr_pct_20 \
             FROM indicators ORDER BY symbol, date",
        )
        .unwrap();
    stmt.query_map([], |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            [row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
        ))
    })
    .unwrap()
    .map(|r| r.unwrap())
    .collect()
}

pub fn test_pipeline() -> PipelineConfig {
    PipelineConfig {
        batch_dates: 7,
        ..PipelineConfig::default()
    }
}

pub fn open_store(path: &Path) -> SqliteAdapter {
    let store = SqliteAdapter::open(path.to_str().unwrap(), 2).unwrap();
    store.initialize_schema().unwrap();
    store
}

/// Loads the universe, benchmark and profiles for `days`.
pub fn seed(store: &SqliteAdapter, days: &[NaiveDate]) {
    store.insert_bars(&universe_bars(days)).unwrap();
    store.insert_benchmark_bars(&benchmark_bars(days)).unwrap();
    store.upsert_profiles(&profiles()).unwrap();
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => format!("{:?}", f),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

/// Every row of `table` rendered as text, sorted.
pub fn dump_table(path: &Path, table: &str) -> Vec<String> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", table)).unwrap();
    let columns = stmt.column_count();
    let mut rows: Vec<String> = stmt
        .query_map([], |row| {
            let mut parts = Vec::with_capacity(columns);
            for i in 0..columns {
                parts.push(render(row.get_ref(i)?));
            }
            Ok(parts.join("|"))
        })
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    rows.sort();
    rows
}

pub fn query_count(path: &Path, sql: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}

pub const DERIVED_TABLES: [&str; 8] = [
    "indicators",
    "ranks",
    "breadth",
    "index_ranks",
    "events",
    "event_aggregates",
    "symbol_metrics",
    "screening_view",
];

/// In-memory price and profile source.
#[derive(Default)]
pub struct MockPricePort {
    pub bars: BTreeMap<String, Vec<PriceBar>>,
    pub benchmark: Vec<PriceBar>,
    pub profiles: Vec<SymbolProfile>,
}

impl MockPricePort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(mut self, bars: Vec<PriceBar>) -> Self {
        for bar in bars {
            self.bars.entry(bar.symbol.clone()).or_default().push(bar);
        }
        for series in self.bars.values_mut() {
            series.sort_by_key(|b| b.date);
        }
        self
    }

    pub fn with_benchmark(mut self, bars: Vec<PriceBar>) -> Self {
        self.benchmark = bars;
        self
    }
}

impl PriceHistoryPort for MockPricePort {
    fn list_symbols(&self) -> Result<Vec<String>, RsrankError> {
        Ok(self.bars.keys().cloned().collect())
    }

    fn fetch_history(
        &self,
        symbol: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<PriceBar>, RsrankError> {
        Ok(self
            .bars
            .get(symbol)
            .map(|b| request.slice(b).to_vec())
            .unwrap_or_default())
    }

    fn fetch_benchmark(
        &self,
        _symbol: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<PriceBar>, RsrankError> {
        Ok(request.slice(&self.benchmark).to_vec())
    }

    fn trading_dates(&self) -> Result<Vec<NaiveDate>, RsrankError> {
        let mut dates: Vec<NaiveDate> = self.bars.values().flatten().map(|b| b.date).collect();
        dates.sort();
        dates.dedup();
        Ok(dates)
    }
}

impl CohortPort for MockPricePort {
    fn symbol_profiles(&self) -> Result<Vec<SymbolProfile>, RsrankError> {
        Ok(self.profiles.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Failure {
    /// Another writer advances the watermark just before the batch lands.
    Conflict,
    /// The write itself fails.
    Error,
}

/// Delegating store that fails the `fail_on`-th batch commit (1-based).
pub struct FlakyStore<'a> {
    pub inner: &'a SqliteAdapter,
    pub fail_on: usize,
    pub failure: Failure,
    pub commits: Cell<usize>,
    pub failed_through: Cell<Option<NaiveDate>>,
}

impl<'a> FlakyStore<'a> {
    pub fn new(inner: &'a SqliteAdapter, fail_on: usize, failure: Failure) -> Self {
        Self {
            inner,
            fail_on,
            failure,
            commits: Cell::new(0),
            failed_through: Cell::new(None),
        }
    }
}

fn empty_like(rows: &BatchRows) -> BatchRows {
    match rows {
        BatchRows::Indicators(_) => BatchRows::Indicators(Vec::new()),
        BatchRows::Ranks(_) => BatchRows::Ranks(Vec::new()),
        BatchRows::Breadth(_) => BatchRows::Breadth(Vec::new()),
    }
}

impl DerivedStore for FlakyStore<'_> {
    fn watermark(&self, table: DerivedTable) -> Result<Option<Watermark>, RsrankError> {
        self.inner.watermark(table)
    }

    fn commit_batch(&self, batch: &Batch, expected_version: i64) -> Result<Watermark, RsrankError> {
        let n = self.commits.get() + 1;
        self.commits.set(n);
        if n == self.fail_on {
            self.failed_through.set(Some(batch.through));
            match self.failure {
                Failure::Conflict => {
                    let interfering = Batch {
                        through: batch.through,
                        rows: empty_like(&batch.rows),
                    };
                    self.inner.commit_batch(&interfering, expected_version)?;
                }
                Failure::Error => {
                    return Err(RsrankError::DatabaseQuery {
                        reason: "injected write failure".into(),
                    });
                }
            }
        }
        self.inner.commit_batch(batch, expected_version)
    }

    fn replace_table(
        &self,
        replacement: &Replacement,
        as_of: NaiveDate,
    ) -> Result<Watermark, RsrankError> {
        self.inner.replace_table(replacement, as_of)
    }

    fn clear_derived(&self) -> Result<(), RsrankError> {
        self.inner.clear_derived()
    }

    fn row_count(&self, table: DerivedTable) -> Result<usize, RsrankError> {
        self.inner.row_count(table)
    }

    fn rs_ranks_on(&self, date: NaiveDate) -> Result<HashMap<String, RsRanks>, RsrankError> {
        self.inner.rs_ranks_on(date)
    }

    fn screening_listing(&self, limit: usize) -> Result<Vec<ScreenListing>, RsrankError> {
        self.inner.screening_listing(limit)
    }

    fn replace_trigger_matches(
        &self,
        date: NaiveDate,
        matches: &[TriggerMatch],
    ) -> Result<usize, RsrankError> {
        self.inner.replace_trigger_matches(date, matches)
    }

    fn trigger_matches_on(&self, date: NaiveDate) -> Result<Vec<TriggerMatch>, RsrankError> {
        self.inner.trigger_matches_on(date)
    }
}
