//! Per-symbol metrics at one date: display returns, liquidity, moving-average
//! position and relative-strength ranks. Feeds the screening view, the
//! `symbol_metrics` table and trigger evaluation.
//!
//! Returns and distances are in percent (12.0 means +12%).

use crate::domain::cohort::{MarketCapBucket, SymbolProfile};
use crate::domain::history::SymbolHistory;
use crate::domain::indicator::IndicatorSet;
use crate::domain::returns::{trailing_return, DISPLAY_WINDOWS};
use chrono::NaiveDate;
use serde::Serialize;

/// Trading rows scanned for the SMA-50 streak statistics.
pub const STREAK_LOOKBACK: usize = 30;
const VOLUME_BASELINE_DAYS: usize = 20;
const MIN_VOLUME_BASELINE: usize = 10;
const AVG_VOLUME_DAYS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sma50Streak {
    pub days_above: usize,
    pub days_below: usize,
    pub percent_above: f64,
    /// Most negative distance below SMA-50 in the window; 0 when never below.
    pub max_distance_below: f64,
    /// Consecutive rows ending today on the same side: positive above, negative below.
    pub current_streak: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RsRanks {
    pub global: Option<u8>,
    pub cohort: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub symbol: String,
    pub date: NaiveDate,
    pub close: f64,
    pub volume: i64,
    pub dollar_volume: f64,
    pub market_cap: Option<f64>,
    pub market_cap_bucket: Option<MarketCapBucket>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub return_1d: Option<f64>,
    pub return_5d: Option<f64>,
    pub return_20d: Option<f64>,
    pub return_60d: Option<f64>,
    pub return_120d: Option<f64>,
    /// Today's volume as a percentage of the prior-20-bar average.
    pub volume_change: Option<f64>,
    pub avg_volume_10d: Option<f64>,
    pub volume_vs_avg_10d: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub ema_10: Option<f64>,
    pub ema_20: Option<f64>,
    pub atr_pct_20: Option<f64>,
    pub distance_from_sma_50: Option<f64>,
    pub sma50_streak: Option<Sma50Streak>,
    pub rs_global: Option<u8>,
    pub rs_cohort: Option<u8>,
}

fn return_pct(closes: &[f64], index: usize, window: usize) -> Option<f64> {
    trailing_return(closes, index, window).map(|r| r * 100.0)
}

fn distance_pct(price: f64, average: f64) -> Option<f64> {
    (average != 0.0).then(|| (price - average) / average * 100.0)
}

/// Mean of the positive volumes among up to `days` bars before `index`.
fn prior_volume_mean(history: &SymbolHistory, index: usize, days: usize, min: usize) -> Option<f64> {
    let start = index.saturating_sub(days);
    let volumes: Vec<f64> = history.bars[start..index]
        .iter()
        .filter(|b| b.volume > 0)
        .map(|b| b.volume as f64)
        .collect();
    if volumes.len() < min {
        return None;
    }
    let avg = volumes.iter().sum::<f64>() / volumes.len() as f64;
    (avg > 0.0).then_some(avg)
}

pub fn sma50_streak(history: &SymbolHistory, indicators: &IndicatorSet, index: usize) -> Option<Sma50Streak> {
    let start = (index + 1).saturating_sub(STREAK_LOOKBACK);
    let distances: Vec<f64> = (start..=index)
        .filter_map(|i| {
            let sma = indicators.sma_50.value_at(i)?;
            distance_pct(history.bars[i].close, sma)
        })
        .collect();
    if distances.is_empty() {
        return None;
    }

    let days_above = distances.iter().filter(|d| **d >= 0.0).count();
    let days_below = distances.len() - days_above;
    let max_distance_below = distances.iter().copied().fold(0.0_f64, f64::min);

    let today_above = distances.last().is_some_and(|d| *d >= 0.0);
    let run = distances
        .iter()
        .rev()
        .take_while(|d| (**d >= 0.0) == today_above)
        .count() as i64;

    Some(Sma50Streak {
        days_above,
        days_below,
        percent_above: days_above as f64 / distances.len() as f64 * 100.0,
        max_distance_below,
        current_streak: if today_above { run } else { -run },
    })
}

/// Snapshot of `history` at row `index`.
pub fn build_snapshot(
    history: &SymbolHistory,
    indicators: &IndicatorSet,
    index: usize,
    profile: Option<&SymbolProfile>,
    ranks: RsRanks,
) -> Option<MetricsSnapshot> {
    let bar = history.bars.get(index)?;
    let closes = history.closes();
    let sma_50 = indicators.sma_50.value_at(index);

    let volume_change = prior_volume_mean(history, index, VOLUME_BASELINE_DAYS, MIN_VOLUME_BASELINE)
        .filter(|_| bar.volume > 0)
        .map(|avg| bar.volume as f64 / avg * 100.0);
    let avg_volume_10d = prior_volume_mean(history, index, AVG_VOLUME_DAYS, AVG_VOLUME_DAYS);
    let [return_1d, return_5d, return_20d, return_60d, return_120d] =
        DISPLAY_WINDOWS.map(|w| return_pct(&closes, index, w));

    Some(MetricsSnapshot {
        symbol: history.symbol.clone(),
        date: bar.date,
        close: bar.close,
        volume: bar.volume,
        dollar_volume: bar.dollar_volume(),
        market_cap: profile.and_then(|p| p.market_cap),
        market_cap_bucket: profile
            .and_then(|p| p.market_cap)
            .map(MarketCapBucket::from_market_cap),
        sector: profile.and_then(|p| p.sector.clone()),
        industry: profile.and_then(|p| p.industry.clone()),
        return_1d,
        return_5d,
        return_20d,
        return_60d,
        return_120d,
        volume_change,
        avg_volume_10d,
        volume_vs_avg_10d: avg_volume_10d.map(|avg| bar.volume as f64 / avg * 100.0),
        sma_50,
        sma_200: indicators.sma_200.value_at(index),
        ema_10: indicators.ema_10.value_at(index),
        ema_20: indicators.ema_20.value_at(index),
        atr_pct_20: indicators.atr_pct_20.value_at(index),
        distance_from_sma_50: sma_50.and_then(|sma| distance_pct(bar.close, sma)),
        sma50_streak: sma50_streak(history, indicators, index),
        rs_global: ranks.global,
        rs_cohort: ranks.cohort,
    })
}

/// Snapshot at the bar dated exactly `date`; `None` when the symbol did not trade.
pub fn snapshot_on(
    history: &SymbolHistory,
    date: NaiveDate,
    profile: Option<&SymbolProfile>,
    ranks: RsRanks,
) -> Option<MetricsSnapshot> {
    let index = history.get_bar_index(date)?;
    let indicators = IndicatorSet::calculate(history);
    build_snapshot(history, &indicators, index, profile, ranks)
}
