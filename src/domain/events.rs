//! Volume-spike and gap day detection, plus per-symbol aggregation.
//!
//! Volume spike: `volume >= spike_multiplier × mean(volume over the prior
//! avg_days bars)` and `close >= prev_close × (1 + min_daily_gain)`; magnitude
//! is the volume ratio.
//!
//! Gap: `low > prev_close × (1 + min_gap_pct)` or
//! `close > prev_close × (1 + min_gap_pct_strong)`; magnitude is the daily return.

use crate::domain::history::SymbolHistory;
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub struct EventParams {
    /// Trailing trading days scanned for events.
    pub lookback_days: usize,
    /// Prior bars in the volume baseline.
    pub avg_days: usize,
    pub spike_multiplier: f64,
    pub min_daily_gain: f64,
    pub min_gap_pct: f64,
    pub min_gap_pct_strong: f64,
}

impl Default for EventParams {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            avg_days: 20,
            spike_multiplier: 3.5,
            min_daily_gain: 0.03,
            min_gap_pct: 0.05,
            min_gap_pct_strong: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    VolumeSpike,
    Gap,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::VolumeSpike => "volume_spike",
            EventType::Gap => "gap",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volume_spike" => Ok(EventType::VolumeSpike),
            "gap" => Ok(EventType::Gap),
            other => Err(format!("unknown event type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub event_type: EventType,
    pub magnitude: f64,
}

/// Volume ratio for bar `i` against the mean of exactly `avg_days` prior bars.
fn volume_ratio(history: &SymbolHistory, i: usize, avg_days: usize) -> Option<f64> {
    if avg_days == 0 || i < avg_days {
        return None;
    }
    let prior = &history.bars[i - avg_days..i];
    let avg = prior.iter().map(|b| b.volume as f64).sum::<f64>() / avg_days as f64;
    if avg <= 0.0 {
        return None;
    }
    Some(history.bars[i].volume as f64 / avg)
}

/// Events on bars dated on or after `since`.
pub fn detect_events(
    history: &SymbolHistory,
    params: &EventParams,
    since: Option<NaiveDate>,
) -> Vec<EventRecord> {
    let mut events = Vec::new();

    for i in 1..history.len() {
        let bar = &history.bars[i];
        if since.is_some_and(|s| bar.date < s) {
            continue;
        }
        let prev_close = history.bars[i - 1].close;
        if prev_close <= 0.0 {
            continue;
        }

        if let Some(ratio) = volume_ratio(history, i, params.avg_days) {
            if ratio >= params.spike_multiplier
                && bar.close >= prev_close * (1.0 + params.min_daily_gain)
            {
                events.push(EventRecord {
                    symbol: history.symbol.clone(),
                    date: bar.date,
                    event_type: EventType::VolumeSpike,
                    magnitude: ratio,
                });
            }
        }

        if bar.low > prev_close * (1.0 + params.min_gap_pct)
            || bar.close > prev_close * (1.0 + params.min_gap_pct_strong)
        {
            events.push(EventRecord {
                symbol: history.symbol.clone(),
                date: bar.date,
                event_type: EventType::Gap,
                magnitude: bar.close / prev_close - 1.0,
            });
        }
    }

    events
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventAggregate {
    pub symbol: String,
    pub spike_count: usize,
    pub avg_volume_ratio: Option<f64>,
    pub spike_dates: Vec<NaiveDate>,
    pub gap_count: usize,
    pub avg_gap_return: Option<f64>,
    pub gap_dates: Vec<NaiveDate>,
    pub last_event_date: Option<NaiveDate>,
    pub last_event_type: Option<EventType>,
}

impl EventAggregate {
    pub fn has_events(&self) -> bool {
        self.spike_count > 0 || self.gap_count > 0
    }
}

pub fn join_dates(dates: &[NaiveDate]) -> String {
    dates
        .iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Aggregates one symbol's events. On a date with both types, volume_spike is
/// reported as the last event type.
pub fn aggregate_events(symbol: &str, events: &[EventRecord]) -> EventAggregate {
    let mut spikes: Vec<&EventRecord> = events
        .iter()
        .filter(|e| e.event_type == EventType::VolumeSpike)
        .collect();
    let mut gaps: Vec<&EventRecord> = events
        .iter()
        .filter(|e| e.event_type == EventType::Gap)
        .collect();
    spikes.sort_by_key(|e| e.date);
    spikes.dedup_by_key(|e| e.date);
    gaps.sort_by_key(|e| e.date);
    gaps.dedup_by_key(|e| e.date);

    let ratios: Vec<f64> = spikes.iter().map(|e| e.magnitude).collect();
    let returns: Vec<f64> = gaps.iter().map(|e| e.magnitude).collect();

    let last = events
        .iter()
        .max_by(|a, b| a.date.cmp(&b.date).then_with(|| b.event_type.cmp(&a.event_type)));

    EventAggregate {
        symbol: symbol.to_string(),
        spike_count: spikes.len(),
        avg_volume_ratio: mean(&ratios),
        spike_dates: spikes.iter().map(|e| e.date).collect(),
        gap_count: gaps.len(),
        avg_gap_return: mean(&returns),
        gap_dates: gaps.iter().map(|e| e.date).collect(),
        last_event_date: last.map(|e| e.date),
        last_event_type: last.map(|e| e.event_type),
    }
}
