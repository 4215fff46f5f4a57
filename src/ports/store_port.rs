//! Persisted derived tables and their watermarks.

use crate::domain::breadth::BreadthRecord;
use crate::domain::error::RsrankError;
use crate::domain::events::{EventAggregate, EventRecord};
use crate::domain::indicator::IndicatorRecord;
use crate::domain::ranking::RankRecord;
use crate::domain::screening::{ScreenListing, ScreeningRow};
use crate::domain::snapshot::{MetricsSnapshot, RsRanks};
use crate::domain::trigger::TriggerMatch;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivedTable {
    Indicators,
    Ranks,
    Breadth,
    IndexRanks,
    Events,
    SymbolMetrics,
    ScreeningView,
}

impl DerivedTable {
    pub const ALL: [DerivedTable; 7] = [
        DerivedTable::Indicators,
        DerivedTable::Ranks,
        DerivedTable::Breadth,
        DerivedTable::IndexRanks,
        DerivedTable::Events,
        DerivedTable::SymbolMetrics,
        DerivedTable::ScreeningView,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedTable::Indicators => "indicators",
            DerivedTable::Ranks => "ranks",
            DerivedTable::Breadth => "breadth",
            DerivedTable::IndexRanks => "index_ranks",
            DerivedTable::Events => "events",
            DerivedTable::SymbolMetrics => "symbol_metrics",
            DerivedTable::ScreeningView => "screening_view",
        }
    }

    /// Upserted per date past the watermark; the rest are replaced wholesale.
    pub fn is_incremental(&self) -> bool {
        matches!(
            self,
            DerivedTable::Indicators | DerivedTable::Ranks | DerivedTable::Breadth
        )
    }
}

impl fmt::Display for DerivedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last fully committed date of a derived table. `version` increases on every
/// advance and guards against concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub last_processed_date: NaiveDate,
    pub version: i64,
}

/// Version to expect when no watermark row exists yet.
pub const NO_WATERMARK_VERSION: i64 = 0;

pub fn expected_version(watermark: Option<&Watermark>) -> i64 {
    watermark.map_or(NO_WATERMARK_VERSION, |w| w.version)
}

#[derive(Debug, Clone)]
pub enum BatchRows {
    Indicators(Vec<IndicatorRecord>),
    Ranks(Vec<RankRecord>),
    Breadth(Vec<BreadthRecord>),
}

/// Rows for a contiguous run of dates ending at `through`, committed together
/// with the watermark advance.
#[derive(Debug, Clone)]
pub struct Batch {
    pub through: NaiveDate,
    pub rows: BatchRows,
}

impl Batch {
    pub fn table(&self) -> DerivedTable {
        match self.rows {
            BatchRows::Indicators(_) => DerivedTable::Indicators,
            BatchRows::Ranks(_) => DerivedTable::Ranks,
            BatchRows::Breadth(_) => DerivedTable::Breadth,
        }
    }

    pub fn len(&self) -> usize {
        match &self.rows {
            BatchRows::Indicators(rows) => rows.len(),
            BatchRows::Ranks(rows) => rows.len(),
            BatchRows::Breadth(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub enum Replacement {
    IndexRanks(Vec<RankRecord>),
    Events {
        events: Vec<EventRecord>,
        aggregates: Vec<EventAggregate>,
    },
    SymbolMetrics(Vec<MetricsSnapshot>),
    ScreeningView(Vec<ScreeningRow>),
}

impl Replacement {
    pub fn table(&self) -> DerivedTable {
        match self {
            Replacement::IndexRanks(_) => DerivedTable::IndexRanks,
            Replacement::Events { .. } => DerivedTable::Events,
            Replacement::SymbolMetrics(_) => DerivedTable::SymbolMetrics,
            Replacement::ScreeningView(_) => DerivedTable::ScreeningView,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Replacement::IndexRanks(rows) => rows.len(),
            Replacement::Events { aggregates, .. } => aggregates.len(),
            Replacement::SymbolMetrics(rows) => rows.len(),
            Replacement::ScreeningView(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait DerivedStore {
    fn watermark(&self, table: DerivedTable) -> Result<Option<Watermark>, RsrankError>;

    /// Upserts the batch and advances the watermark to `batch.through` in one
    /// transaction. Fails with `WatermarkConflict` and writes nothing when the
    /// stored version differs from `expected_version`.
    fn commit_batch(&self, batch: &Batch, expected_version: i64) -> Result<Watermark, RsrankError>;

    /// Truncates and reloads the table in one transaction, then records `as_of`.
    fn replace_table(
        &self,
        replacement: &Replacement,
        as_of: NaiveDate,
    ) -> Result<Watermark, RsrankError>;

    /// Deletes every derived row and watermark.
    fn clear_derived(&self) -> Result<(), RsrankError>;

    fn row_count(&self, table: DerivedTable) -> Result<usize, RsrankError>;

    /// Global and cohort percentiles on `date`, keyed by symbol.
    fn rs_ranks_on(&self, date: NaiveDate) -> Result<HashMap<String, RsRanks>, RsrankError>;

    fn screening_listing(&self, limit: usize) -> Result<Vec<ScreenListing>, RsrankError>;

    /// Deletes the matches stored for `date` and inserts `matches` atomically.
    /// Returns the number of rows deleted.
    fn replace_trigger_matches(
        &self,
        date: NaiveDate,
        matches: &[TriggerMatch],
    ) -> Result<usize, RsrankError>;

    fn trigger_matches_on(&self, date: NaiveDate) -> Result<Vec<TriggerMatch>, RsrankError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_and_replaced_tables_partition_all() {
        let incremental: Vec<_> = DerivedTable::ALL
            .into_iter()
            .filter(DerivedTable::is_incremental)
            .collect();
        assert_eq!(
            incremental,
            vec![DerivedTable::Indicators, DerivedTable::Ranks, DerivedTable::Breadth]
        );
        assert!(!DerivedTable::ScreeningView.is_incremental());
    }

    #[test]
    fn expected_version_without_watermark() {
        assert_eq!(expected_version(None), NO_WATERMARK_VERSION);
        let w = Watermark {
            last_processed_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            version: 7,
        };
        assert_eq!(expected_version(Some(&w)), 7);
    }
}
