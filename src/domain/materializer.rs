//! Incremental materialization of the derived tables.
//!
//! `indicators`, `ranks` and `breadth` are upserted per date past their
//! watermark, in batches of `batch_dates` dates; each batch commits together
//! with its watermark advance. A missing watermark means a full rebuild.
//!
//! `index_ranks`, `events`, `symbol_metrics` and `screening_view` describe a
//! trailing window that moves every day, so they are recomputed for the
//! latest date and replaced wholesale in one transaction each.
//!
//! A full rebuild clears every derived table and watermark in its own
//! transaction before recomputing, so readers see empty tables until it
//! finishes. Run it while nothing else reads the database.
//!
//! Symbols are independent work units and are computed in parallel with rayon;
//! writes go through the store serially.

use crate::domain::breadth::{breadth_samples, tally_breadth};
use crate::domain::cohort::{build_cohort_map, CohortMap, SymbolProfile};
use crate::domain::error::RsrankError;
use crate::domain::events::{aggregate_events, detect_events, EventParams};
use crate::domain::history::{window_start, SymbolHistory};
use crate::domain::indicator::{
    compute_indicators, IndicatorSet, IndicatorType, ATR_PERIOD, EMA_SLOW, SMA_FAST, SMA_SLOW,
};
use crate::domain::ranking::{group_by_date, rank_global_and_cohorts, rank_index_universes};
use crate::domain::returns::DISPLAY_WINDOWS;
use crate::domain::screening::{build_screening_view, ScreenConfig};
use crate::domain::snapshot::{build_snapshot, STREAK_LOOKBACK};
use crate::domain::strength::{score_history, BenchmarkReturns, ScoringWeights};
use crate::ports::cohort_port::CohortPort;
use crate::ports::data_port::{HistoryRequest, PriceHistoryPort};
use crate::ports::store_port::{
    expected_version, Batch, BatchRows, DerivedStore, DerivedTable, Replacement, Watermark,
};
use chrono::NaiveDate;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub benchmark: String,
    pub weights: ScoringWeights,
    /// Dates per committed batch.
    pub batch_dates: usize,
    pub parallel: bool,
    /// Bars loaded before the watermark to seed rolling windows.
    pub context_rows: usize,
    pub events: EventParams,
    pub screening: ScreenConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            benchmark: "SPY".to_string(),
            weights: ScoringWeights::default(),
            batch_dates: 250,
            parallel: true,
            context_rows: 260,
            events: EventParams::default(),
            screening: ScreenConfig::default(),
        }
    }
}

/// Rows of history every computation needs behind its own date: the slowest
/// SMA, 5x the slowest EMA span, ATR, the longest scoring and display
/// windows, and the SMA-50 streak.
pub fn required_context_rows(weights: &ScoringWeights) -> usize {
    let longest_display = DISPLAY_WINDOWS.iter().copied().max().unwrap_or(0);
    [
        IndicatorType::Sma(SMA_SLOW).warmup_bars(),
        5 * IndicatorType::Ema(EMA_SLOW).warmup_bars(),
        IndicatorType::AtrPct(ATR_PERIOD).warmup_bars(),
        weights.max_window() + 1,
        longest_display + 1,
        SMA_FAST + STREAK_LOOKBACK,
    ]
    .into_iter()
    .max()
    .unwrap_or(0)
}

impl PipelineConfig {
    /// Context loaded before the watermark; never below [`required_context_rows`].
    pub fn history_rows(&self) -> usize {
        self.context_rows.max(required_context_rows(&self.weights))
    }

    /// Rows loaded for the latest-date tables: the context, or the event
    /// lookback plus its volume baseline when that reaches further back.
    pub fn latest_rows(&self) -> usize {
        self.history_rows()
            .max(self.events.lookback_days + self.events.avg_days + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    Incremental,
    UpToDate,
    Replaced,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunMode::Full => "full",
            RunMode::Incremental => "incremental",
            RunMode::UpToDate => "up-to-date",
            RunMode::Replaced => "replaced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub table: DerivedTable,
    pub mode: RunMode,
    pub rows_written: usize,
    pub watermark: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub latest: NaiveDate,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn step(&self, table: DerivedTable) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.table == table)
    }
}

/// Dates still to compute for one incremental table.
#[derive(Debug, Clone)]
struct Plan {
    table: DerivedTable,
    watermark: Option<Watermark>,
    pending: Vec<NaiveDate>,
}

impl Plan {
    fn after(&self) -> Option<NaiveDate> {
        self.watermark.map(|w| w.last_processed_date)
    }

    fn mode(&self) -> RunMode {
        match (self.watermark, self.pending.is_empty()) {
            (_, true) => RunMode::UpToDate,
            (None, false) => RunMode::Full,
            (Some(_), false) => RunMode::Incremental,
        }
    }
}

/// Fails with `RebuildRequired` when the watermark does not name a known trading date.
pub fn check_watermark(
    table: DerivedTable,
    watermark: &Watermark,
    calendar: &[NaiveDate],
) -> Result<(), RsrankError> {
    if calendar.binary_search(&watermark.last_processed_date).is_err() {
        return Err(RsrankError::RebuildRequired {
            table: table.to_string(),
            watermark: watermark.last_processed_date,
            reason: "watermark date has no price bars".into(),
        });
    }
    Ok(())
}

fn map_histories<T, F>(histories: &[SymbolHistory], parallel: bool, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&SymbolHistory) -> T + Sync + Send,
{
    if parallel {
        histories.par_iter().map(f).collect()
    } else {
        histories.iter().map(f).collect()
    }
}

pub struct Materializer<'a> {
    prices: &'a dyn PriceHistoryPort,
    cohorts: &'a dyn CohortPort,
    store: &'a dyn DerivedStore,
    config: &'a PipelineConfig,
}

impl<'a> Materializer<'a> {
    pub fn new(
        prices: &'a dyn PriceHistoryPort,
        cohorts: &'a dyn CohortPort,
        store: &'a dyn DerivedStore,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            prices,
            cohorts,
            store,
            config,
        }
    }

    /// Brings every derived table up to the latest trading date. With `full`,
    /// derived tables are emptied first and stay empty to readers until the
    /// rebuild commits.
    pub fn run(&self, full: bool) -> Result<RunReport, RsrankError> {
        if full {
            warn!("clearing derived tables for a full rebuild; readers see empty tables until it completes");
            self.store.clear_derived()?;
        }

        let calendar = self.prices.trading_dates()?;
        let latest = *calendar.last().ok_or_else(|| RsrankError::NoData {
            what: "no price bars loaded".into(),
        })?;
        let symbols = self.prices.list_symbols()?;
        let profiles = self.cohorts.symbol_profiles()?;
        let cohorts = build_cohort_map(&profiles);
        info!(symbols = symbols.len(), %latest, "materializing derived tables");

        let plans = [
            self.plan(DerivedTable::Indicators, &calendar)?,
            self.plan(DerivedTable::Ranks, &calendar)?,
            self.plan(DerivedTable::Breadth, &calendar)?,
        ];

        let mut steps = Vec::new();
        if plans.iter().any(|p| !p.pending.is_empty()) {
            // one load serves every incremental table; each step filters to its own watermark
            let earliest = plans
                .iter()
                .filter(|p| !p.pending.is_empty())
                .map(Plan::after)
                .min()
                .flatten();
            let request = HistoryRequest::incremental(earliest, self.config.history_rows());
            let histories = self.load_histories(&symbols, &request)?;

            steps.push(self.run_indicators(&plans[0], &histories)?);
            steps.push(self.run_ranks(&plans[1], &histories, &request, &cohorts)?);
            steps.push(self.run_breadth(&plans[2], &histories)?);
        } else {
            for plan in &plans {
                info!(table = %plan.table, "up to date");
                steps.push(StepReport {
                    table: plan.table,
                    mode: RunMode::UpToDate,
                    rows_written: 0,
                    watermark: plan.after(),
                });
            }
        }

        steps.extend(self.run_latest(latest, &calendar, &symbols, &profiles, &cohorts)?);
        Ok(RunReport { latest, steps })
    }

    fn plan(&self, table: DerivedTable, calendar: &[NaiveDate]) -> Result<Plan, RsrankError> {
        let watermark = self.store.watermark(table)?;
        let pending = match &watermark {
            None => calendar.to_vec(),
            Some(w) => {
                check_watermark(table, w, calendar)?;
                calendar
                    .iter()
                    .copied()
                    .filter(|d| *d > w.last_processed_date)
                    .collect()
            }
        };
        debug!(table = %table, pending = pending.len(), "planned");
        Ok(Plan {
            table,
            watermark,
            pending,
        })
    }

    fn load_histories(
        &self,
        symbols: &[String],
        request: &HistoryRequest,
    ) -> Result<Vec<SymbolHistory>, RsrankError> {
        let mut histories = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let bars = self.prices.fetch_history(symbol, request)?;
            if bars.is_empty() {
                debug!(%symbol, "no bars in range");
                continue;
            }
            histories.push(SymbolHistory::new(symbol.clone(), bars));
        }
        Ok(histories)
    }

    fn load_benchmark(&self, request: &HistoryRequest) -> Result<BenchmarkReturns, RsrankError> {
        let bars = self.prices.fetch_benchmark(&self.config.benchmark, request)?;
        if bars.is_empty() {
            warn!(benchmark = %self.config.benchmark, "benchmark series is empty");
        }
        let history = SymbolHistory::new(self.config.benchmark.clone(), bars);
        Ok(BenchmarkReturns::from_history(&history, &self.config.weights))
    }

    /// Commits rows grouped into runs of `batch_dates` pending dates.
    fn commit_in_batches<T>(
        &self,
        plan: &Plan,
        rows: Vec<T>,
        date_of: fn(&T) -> NaiveDate,
        wrap: fn(Vec<T>) -> BatchRows,
    ) -> Result<StepReport, RsrankError> {
        let mode = plan.mode();
        if plan.pending.is_empty() {
            info!(table = %plan.table, "up to date");
            return Ok(StepReport {
                table: plan.table,
                mode,
                rows_written: 0,
                watermark: plan.after(),
            });
        }

        let mut by_date: BTreeMap<NaiveDate, Vec<T>> = BTreeMap::new();
        for row in rows {
            by_date.entry(date_of(&row)).or_default().push(row);
        }

        let mut version = expected_version(plan.watermark.as_ref());
        let mut written = 0;
        let mut watermark = plan.after();
        for chunk in plan.pending.chunks(self.config.batch_dates.max(1)) {
            let mut batch_rows = Vec::new();
            for date in chunk {
                if let Some(rows) = by_date.remove(date) {
                    batch_rows.extend(rows);
                }
            }
            let Some(&through) = chunk.last() else {
                continue;
            };
            let batch = Batch {
                through,
                rows: wrap(batch_rows),
            };
            let count = batch.len();
            let advanced = self.store.commit_batch(&batch, version)?;
            version = advanced.version;
            written += count;
            watermark = Some(advanced.last_processed_date);
            debug!(table = %plan.table, %through, rows = count, "batch committed");
        }

        info!(table = %plan.table, %mode, rows = written, watermark = ?watermark, "step complete");
        Ok(StepReport {
            table: plan.table,
            mode,
            rows_written: written,
            watermark,
        })
    }

    fn run_indicators(
        &self,
        plan: &Plan,
        histories: &[SymbolHistory],
    ) -> Result<StepReport, RsrankError> {
        let after = plan.after();
        let rows: Vec<_> = map_histories(histories, self.config.parallel, |h| {
            compute_indicators(h, after)
        })
        .into_iter()
        .flatten()
        .collect();
        self.commit_in_batches(plan, rows, |r| r.date, BatchRows::Indicators)
    }

    fn run_ranks(
        &self,
        plan: &Plan,
        histories: &[SymbolHistory],
        request: &HistoryRequest,
        cohorts: &CohortMap,
    ) -> Result<StepReport, RsrankError> {
        let after = plan.after();
        let benchmark = self.load_benchmark(request)?;
        let weights = &self.config.weights;
        let outcomes = map_histories(histories, self.config.parallel, |h| {
            score_history(h, &benchmark, weights, after)
        });

        let mut missing: BTreeSet<NaiveDate> = BTreeSet::new();
        let mut scores = Vec::new();
        for outcome in outcomes {
            missing.extend(outcome.missing_benchmark);
            scores.extend(outcome.scores);
        }
        if !missing.is_empty() {
            warn!(
                dates = missing.len(),
                first = ?missing.first(),
                "benchmark bars missing; relative strength left null on those dates"
            );
        }

        let by_date = group_by_date(scores);
        let rows: Vec<_> = by_date
            .iter()
            .flat_map(|(date, day)| rank_global_and_cohorts(*date, day, cohorts))
            .collect();
        self.commit_in_batches(plan, rows, |r| r.date, BatchRows::Ranks)
    }

    fn run_breadth(
        &self,
        plan: &Plan,
        histories: &[SymbolHistory],
    ) -> Result<StepReport, RsrankError> {
        let after = plan.after();
        let samples: Vec<_> = map_histories(histories, self.config.parallel, |h| {
            breadth_samples(h, &IndicatorSet::calculate(h), after)
        })
        .into_iter()
        .flatten()
        .collect();
        let rows = tally_breadth(&samples);
        self.commit_in_batches(plan, rows, |r| r.date, BatchRows::Breadth)
    }

    fn replace(
        &self,
        replacement: Replacement,
        latest: NaiveDate,
    ) -> Result<StepReport, RsrankError> {
        let table = replacement.table();
        let rows = replacement.len();
        let watermark = self.store.replace_table(&replacement, latest)?;
        info!(table = %table, rows, %latest, "table replaced");
        Ok(StepReport {
            table,
            mode: RunMode::Replaced,
            rows_written: rows,
            watermark: Some(watermark.last_processed_date),
        })
    }

    /// Tables rebuilt from the trailing window ending at `latest`.
    fn run_latest(
        &self,
        latest: NaiveDate,
        calendar: &[NaiveDate],
        symbols: &[String],
        profiles: &[SymbolProfile],
        cohorts: &CohortMap,
    ) -> Result<Vec<StepReport>, RsrankError> {
        let request = HistoryRequest::tail(latest, self.config.latest_rows());
        let histories = self.load_histories(symbols, &request)?;
        let parallel = self.config.parallel;
        let mut steps = Vec::new();

        // index-universe ranks on the latest date only
        let benchmark = self.load_benchmark(&request)?;
        let previous = calendar.len().checked_sub(2).map(|i| calendar[i]);
        let weights = &self.config.weights;
        let latest_scores: Vec<_> = map_histories(&histories, parallel, |h| {
            score_history(h, &benchmark, weights, previous).scores
        })
        .into_iter()
        .flatten()
        .filter(|s| s.date == latest)
        .collect();
        let index_rows = rank_index_universes(latest, &latest_scores, cohorts);
        steps.push(self.replace(Replacement::IndexRanks(index_rows), latest)?);

        // events over the trailing lookback window
        let since = window_start(calendar, self.config.events.lookback_days);
        let params = &self.config.events;
        let per_symbol = map_histories(&histories, parallel, |h| {
            let events = detect_events(h, params, since);
            let aggregate = aggregate_events(&h.symbol, &events);
            (events, aggregate)
        });
        let mut events = Vec::new();
        let mut aggregates = Vec::new();
        for (symbol_events, aggregate) in per_symbol {
            if aggregate.has_events() {
                events.extend(symbol_events);
                aggregates.push(aggregate);
            }
        }
        let aggregate_map: HashMap<_, _> = aggregates
            .iter()
            .map(|a| (a.symbol.clone(), a.clone()))
            .collect();
        steps.push(self.replace(Replacement::Events { events, aggregates }, latest)?);

        // per-symbol metrics on the latest date
        let ranks = self.store.rs_ranks_on(latest)?;
        let profile_map: HashMap<&str, &SymbolProfile> =
            profiles.iter().map(|p| (p.symbol.as_str(), p)).collect();
        let snapshots: Vec<_> = map_histories(&histories, parallel, |h| {
            let index = h.get_bar_index(latest)?;
            let indicators = IndicatorSet::calculate(h);
            let symbol_ranks = ranks.get(&h.symbol).copied().unwrap_or_default();
            build_snapshot(
                h,
                &indicators,
                index,
                profile_map.get(h.symbol.as_str()).copied(),
                symbol_ranks,
            )
        })
        .into_iter()
        .flatten()
        .collect();
        steps.push(self.replace(Replacement::SymbolMetrics(snapshots.clone()), latest)?);

        let recent_since = window_start(calendar, self.config.screening.recent_event_days);
        let view = build_screening_view(
            &snapshots,
            &aggregate_map,
            recent_since,
            &self.config.screening,
        );
        steps.push(self.replace(Replacement::ScreeningView(view), latest)?);

        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, day).unwrap()
    }

    #[test]
    fn watermark_off_calendar_requires_rebuild() {
        let calendar = vec![d(1), d(2), d(5)];
        let ok = Watermark {
            last_processed_date: d(2),
            version: 3,
        };
        assert!(check_watermark(DerivedTable::Ranks, &ok, &calendar).is_ok());

        let drifted = Watermark {
            last_processed_date: d(3),
            version: 3,
        };
        let err = check_watermark(DerivedTable::Ranks, &drifted, &calendar).unwrap_err();
        assert!(matches!(err, RsrankError::RebuildRequired { .. }));
    }

    #[test]
    fn plan_mode_follows_watermark() {
        let full = Plan {
            table: DerivedTable::Indicators,
            watermark: None,
            pending: vec![d(1)],
        };
        assert_eq!(full.mode(), RunMode::Full);

        let incremental = Plan {
            watermark: Some(Watermark {
                last_processed_date: d(1),
                version: 1,
            }),
            pending: vec![d(2)],
            ..full.clone()
        };
        assert_eq!(incremental.mode(), RunMode::Incremental);

        let done = Plan {
            pending: Vec::new(),
            ..incremental
        };
        assert_eq!(done.mode(), RunMode::UpToDate);
    }

    #[test]
    fn default_context_covers_slowest_window() {
        let config = PipelineConfig::default();
        assert_eq!(required_context_rows(&config.weights), 200);
        assert!(config.context_rows >= 200);
        assert_eq!(config.history_rows(), 260);
    }

    #[test]
    fn long_scoring_window_raises_required_context() {
        let weights = ScoringWeights::new(vec![20, 300], vec![0.5, 0.5]).unwrap();
        assert_eq!(required_context_rows(&weights), 301);

        let config = PipelineConfig {
            weights,
            ..PipelineConfig::default()
        };
        assert_eq!(config.history_rows(), 301);
    }

    #[test]
    fn event_lookback_extends_latest_rows() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.latest_rows(), 260);

        config.events.lookback_days = 365;
        assert_eq!(config.latest_rows(), 365 + 20 + 1);
        // the incremental context is unaffected
        assert_eq!(config.history_rows(), 260);
    }
}
