//! Screening view: latest metrics joined with event aggregates, filtered by
//! liquidity floors and a sector/industry denylist, tagged, and sorted.

use crate::domain::events::{EventAggregate, EventType};
use crate::domain::snapshot::MetricsSnapshot;
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Metric the view is sorted on, descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMetric {
    Return1d,
    Return5d,
    Return20d,
    Return60d,
    Return120d,
    RsGlobal,
    DollarVolume,
    AtrPct,
}

impl SortMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortMetric::Return1d => "return_1d",
            SortMetric::Return5d => "return_5d",
            SortMetric::Return20d => "return_20d",
            SortMetric::Return60d => "return_60d",
            SortMetric::Return120d => "return_120d",
            SortMetric::RsGlobal => "rs_global",
            SortMetric::DollarVolume => "dollar_volume",
            SortMetric::AtrPct => "atr_pct_20",
        }
    }

    pub fn value(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        match self {
            SortMetric::Return1d => snapshot.return_1d,
            SortMetric::Return5d => snapshot.return_5d,
            SortMetric::Return20d => snapshot.return_20d,
            SortMetric::Return60d => snapshot.return_60d,
            SortMetric::Return120d => snapshot.return_120d,
            SortMetric::RsGlobal => snapshot.rs_global.map(f64::from),
            SortMetric::DollarVolume => Some(snapshot.dollar_volume),
            SortMetric::AtrPct => snapshot.atr_pct_20,
        }
    }
}

impl fmt::Display for SortMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "return_1d" => Ok(SortMetric::Return1d),
            "return_5d" => Ok(SortMetric::Return5d),
            "return_20d" => Ok(SortMetric::Return20d),
            "return_60d" => Ok(SortMetric::Return60d),
            "return_120d" => Ok(SortMetric::Return120d),
            "rs_global" => Ok(SortMetric::RsGlobal),
            "dollar_volume" => Ok(SortMetric::DollarVolume),
            "atr_pct_20" => Ok(SortMetric::AtrPct),
            other => Err(format!("unknown sort metric '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenConfig {
    pub exclude_industries: Vec<String>,
    pub exclude_sectors: Vec<String>,
    pub min_price: f64,
    pub min_market_cap: f64,
    pub max_atr_pct: Option<f64>,
    pub min_avg_volume: f64,
    pub min_dollar_volume: f64,
    /// Trading days within which an event still earns a tag.
    pub recent_event_days: usize,
    pub high_rs_threshold: u8,
    pub sort_by: SortMetric,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            exclude_industries: vec!["Biotechnology".to_string()],
            exclude_sectors: Vec::new(),
            min_price: 3.0,
            min_market_cap: 1_000_000_000.0,
            max_atr_pct: None,
            min_avg_volume: 50_000.0,
            min_dollar_volume: 10_000_000.0,
            recent_event_days: 60,
            high_rs_threshold: 90,
            sort_by: SortMetric::Return20d,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreeningRow {
    pub snapshot: MetricsSnapshot,
    pub events: EventAggregate,
    pub tags: Vec<String>,
}

impl ScreeningRow {
    pub fn tags_joined(&self) -> String {
        self.tags.join(", ")
    }
}

/// One persisted screening row as read back for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenListing {
    pub position: usize,
    pub symbol: String,
    pub close: f64,
    pub return_5d: Option<f64>,
    pub return_20d: Option<f64>,
    pub rs_global: Option<u8>,
    pub atr_pct_20: Option<f64>,
    pub tags: String,
}

fn listed(value: Option<&str>, denylist: &[String]) -> bool {
    value.is_some_and(|v| denylist.iter().any(|d| d.eq_ignore_ascii_case(v)))
}

/// Denylist and liquidity floors. A missing market cap or average volume fails
/// the corresponding floor.
pub fn passes_filters(snapshot: &MetricsSnapshot, config: &ScreenConfig) -> bool {
    if listed(snapshot.industry.as_deref(), &config.exclude_industries)
        || listed(snapshot.sector.as_deref(), &config.exclude_sectors)
    {
        return false;
    }
    if snapshot.close <= config.min_price
        || snapshot.dollar_volume <= config.min_dollar_volume
        || snapshot.market_cap.is_none_or(|cap| cap <= config.min_market_cap)
        || snapshot.avg_volume_10d.is_none_or(|v| v <= config.min_avg_volume)
    {
        return false;
    }
    if let (Some(max), Some(atr)) = (config.max_atr_pct, snapshot.atr_pct_20) {
        if atr > max {
            return false;
        }
    }
    true
}

const RETURN_TAGS: [(&str, f64); 4] = [
    ("return_5d", 10.0),
    ("return_20d", 20.0),
    ("return_60d", 50.0),
    ("return_120d", 100.0),
];

/// Tags in a fixed order. `recent_since` is the first trading date that still
/// counts as recent; `None` means no event is recent.
pub fn build_tags(
    snapshot: &MetricsSnapshot,
    events: &EventAggregate,
    recent_since: Option<NaiveDate>,
    config: &ScreenConfig,
) -> Vec<String> {
    let mut tags = Vec::new();

    if snapshot.rs_global.is_some_and(|rs| rs >= config.high_rs_threshold) {
        tags.push("high_rs".to_string());
    }

    let returns = [
        snapshot.return_5d,
        snapshot.return_20d,
        snapshot.return_60d,
        snapshot.return_120d,
    ];
    for ((name, threshold), value) in RETURN_TAGS.iter().zip(returns) {
        if value.is_some_and(|v| v > *threshold) {
            tags.push(format!("{} > {}", name, threshold));
        }
    }

    let recent = match (events.last_event_date, recent_since) {
        (Some(last), Some(since)) => last >= since,
        _ => false,
    };
    if recent {
        let dated = events.last_event_type;
        for (event_type, count) in [
            (EventType::VolumeSpike, events.spike_count),
            (EventType::Gap, events.gap_count),
        ] {
            if count > 0 && dated != Some(event_type) {
                tags.push(event_type.to_string());
            }
        }
        if let (Some(event_type), Some(date)) = (dated, events.last_event_date) {
            tags.push(format!("{} ({})", event_type, date.format("%Y-%m-%d")));
        }
    }

    tags
}

fn compare_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Filtered, tagged rows sorted by `config.sort_by` descending; untagged symbols are dropped.
pub fn build_screening_view(
    snapshots: &[MetricsSnapshot],
    aggregates: &HashMap<String, EventAggregate>,
    recent_since: Option<NaiveDate>,
    config: &ScreenConfig,
) -> Vec<ScreeningRow> {
    let mut rows: Vec<ScreeningRow> = snapshots
        .iter()
        .filter(|s| passes_filters(s, config))
        .filter_map(|s| {
            let events = aggregates.get(&s.symbol).cloned().unwrap_or_else(|| EventAggregate {
                symbol: s.symbol.clone(),
                ..Default::default()
            });
            let tags = build_tags(s, &events, recent_since, config);
            (!tags.is_empty()).then(|| ScreeningRow {
                snapshot: s.clone(),
                events,
                tags,
            })
        })
        .collect();

    rows.sort_by(|a, b| {
        compare_desc(
            config.sort_by.value(&a.snapshot),
            config.sort_by.value(&b.snapshot),
        )
        .then_with(|| a.snapshot.symbol.cmp(&b.snapshot.symbol))
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn snapshot(symbol: &str, return_20d: Option<f64>) -> MetricsSnapshot {
        MetricsSnapshot {
            symbol: symbol.into(),
            date: d(6, 28),
            close: 50.0,
            volume: 1_000_000,
            dollar_volume: 50_000_000.0,
            market_cap: Some(5.0e9),
            market_cap_bucket: None,
            sector: Some("Technology".into()),
            industry: Some("Software".into()),
            return_1d: Some(1.0),
            return_5d: Some(2.0),
            return_20d,
            return_60d: None,
            return_120d: None,
            volume_change: None,
            avg_volume_10d: Some(800_000.0),
            volume_vs_avg_10d: None,
            sma_50: None,
            sma_200: None,
            ema_10: None,
            ema_20: None,
            atr_pct_20: Some(3.0),
            distance_from_sma_50: None,
            sma50_streak: None,
            rs_global: None,
            rs_cohort: None,
        }
    }

    #[test]
    fn filters_apply_floors_and_denylist() {
        let config = ScreenConfig::default();
        assert!(passes_filters(&snapshot("OK", None), &config));

        let mut biotech = snapshot("BIO", None);
        biotech.industry = Some("biotechnology".into());
        assert!(!passes_filters(&biotech, &config));

        let mut cheap = snapshot("CHEAP", None);
        cheap.close = 2.5;
        assert!(!passes_filters(&cheap, &config));

        let mut unknown_cap = snapshot("NOCAP", None);
        unknown_cap.market_cap = None;
        assert!(!passes_filters(&unknown_cap, &config));

        let mut thin = snapshot("THIN", None);
        thin.avg_volume_10d = Some(10_000.0);
        assert!(!passes_filters(&thin, &config));

        let volatile = snapshot("WILD", None);
        let capped = ScreenConfig {
            max_atr_pct: Some(2.0),
            ..ScreenConfig::default()
        };
        assert!(!passes_filters(&volatile, &capped));
    }

    #[test]
    fn return_and_rs_tags() {
        let mut s = snapshot("RUN", Some(25.0));
        s.rs_global = Some(95);
        let tags = build_tags(&s, &EventAggregate::default(), None, &ScreenConfig::default());
        assert_eq!(tags, vec!["high_rs", "return_20d > 20"]);
    }

    #[test]
    fn dated_event_tag_replaces_plain_tag() {
        let s = snapshot("EVT", None);
        let events = EventAggregate {
            symbol: "EVT".into(),
            spike_count: 1,
            gap_count: 2,
            spike_dates: vec![d(6, 20)],
            gap_dates: vec![d(6, 1), d(6, 10)],
            last_event_date: Some(d(6, 20)),
            last_event_type: Some(EventType::VolumeSpike),
            ..Default::default()
        };
        let tags = build_tags(&s, &events, Some(d(4, 1)), &ScreenConfig::default());
        assert_eq!(tags, vec!["gap", "volume_spike (2024-06-20)"]);

        // stale events earn nothing
        let tags = build_tags(&s, &events, Some(d(6, 21)), &ScreenConfig::default());
        assert!(tags.is_empty());
    }

    #[test]
    fn view_drops_untagged_and_sorts_descending() {
        let snapshots = vec![
            snapshot("MID", Some(30.0)),
            snapshot("TOP", Some(80.0)),
            snapshot("FLAT", Some(1.0)),
        ];
        let mut aggregates = HashMap::new();
        aggregates.insert(
            "FLAT".to_string(),
            EventAggregate {
                symbol: "FLAT".into(),
                gap_count: 1,
                gap_dates: vec![d(6, 27)],
                last_event_date: Some(d(6, 27)),
                last_event_type: Some(EventType::Gap),
                ..Default::default()
            },
        );
        let view = build_screening_view(&snapshots, &aggregates, Some(d(4, 1)), &ScreenConfig::default());
        let order: Vec<&str> = view.iter().map(|r| r.snapshot.symbol.as_str()).collect();
        assert_eq!(order, vec!["TOP", "MID", "FLAT"]);
        assert_eq!(view[2].tags_joined(), "gap (2024-06-27)");

        let none_tagged = build_screening_view(
            &[snapshot("QUIET", Some(5.0))],
            &HashMap::new(),
            Some(d(4, 1)),
            &ScreenConfig::default(),
        );
        assert!(none_tagged.is_empty());
    }

    #[test]
    fn sort_metric_parses() {
        assert_eq!("rs_global".parse::<SortMetric>(), Ok(SortMetric::RsGlobal));
        assert!("pe".parse::<SortMetric>().is_err());
    }
}
