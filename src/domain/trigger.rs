//! Named trigger rules evaluated against per-symbol metrics snapshots.
//!
//! A rule is an AND-conjunction of `field operator threshold` conditions. A
//! condition on a field the snapshot cannot supply evaluates to false. Global
//! filters drop symbols before any rule is evaluated.
//!
//! A run loads the rules file, resolves the target date, evaluates the
//! universe and replaces the matches stored for that date in one transaction,
//! so reruns for the same date are idempotent.

use crate::domain::cohort::SymbolProfile;
use crate::domain::error::RsrankError;
use crate::domain::history::SymbolHistory;
use crate::domain::snapshot::{snapshot_on, MetricsSnapshot};
use crate::domain::trigger_parser::parse_conditions;
use crate::ports::cohort_port::CohortPort;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::{HistoryRequest, PriceHistoryPort};
use crate::ports::store_port::DerivedStore;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const TRIGGER_SECTION_PREFIX: &str = "trigger.";
pub const GLOBAL_FILTERS_SECTION: &str = "global_filters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricField {
    Close,
    Volume,
    MarketCap,
    Return1d,
    Return5d,
    Return20d,
    Return60d,
    Return120d,
    VolumeChange,
    AvgVolume10d,
    Ma50,
    Ma200,
    Ema10,
    Ema20,
    AtrPct20,
    DistanceFrom50ma,
    DaysAbove50ma,
    DaysBelow50ma,
    PercentAbove50ma,
    MaxDistanceBelow50ma,
    Sma50Streak,
    RsGlobal,
    RsCohort,
}

impl MetricField {
    pub const ALL: [MetricField; 23] = [
        MetricField::Close,
        MetricField::Volume,
        MetricField::MarketCap,
        MetricField::Return1d,
        MetricField::Return5d,
        MetricField::Return20d,
        MetricField::Return60d,
        MetricField::Return120d,
        MetricField::VolumeChange,
        MetricField::AvgVolume10d,
        MetricField::Ma50,
        MetricField::Ma200,
        MetricField::Ema10,
        MetricField::Ema20,
        MetricField::AtrPct20,
        MetricField::DistanceFrom50ma,
        MetricField::DaysAbove50ma,
        MetricField::DaysBelow50ma,
        MetricField::PercentAbove50ma,
        MetricField::MaxDistanceBelow50ma,
        MetricField::Sma50Streak,
        MetricField::RsGlobal,
        MetricField::RsCohort,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Close => "close",
            MetricField::Volume => "volume",
            MetricField::MarketCap => "market_cap",
            MetricField::Return1d => "return_1d",
            MetricField::Return5d => "return_5d",
            MetricField::Return20d => "return_20d",
            MetricField::Return60d => "return_60d",
            MetricField::Return120d => "return_120d",
            MetricField::VolumeChange => "volume_change",
            MetricField::AvgVolume10d => "avg_volume_10d",
            MetricField::Ma50 => "ma_50",
            MetricField::Ma200 => "ma_200",
            MetricField::Ema10 => "ema_10",
            MetricField::Ema20 => "ema_20",
            MetricField::AtrPct20 => "atr_pct_20",
            MetricField::DistanceFrom50ma => "distance_from_50ma",
            MetricField::DaysAbove50ma => "days_above_50ma",
            MetricField::DaysBelow50ma => "days_below_50ma",
            MetricField::PercentAbove50ma => "percent_above_50ma",
            MetricField::MaxDistanceBelow50ma => "max_distance_below_50ma",
            MetricField::Sma50Streak => "sma50_streak",
            MetricField::RsGlobal => "rs_global",
            MetricField::RsCohort => "rs_cohort",
        }
    }

    pub fn value(&self, s: &MetricsSnapshot) -> Option<f64> {
        let streak = s.sma50_streak.as_ref();
        match self {
            MetricField::Close => Some(s.close),
            MetricField::Volume => Some(s.volume as f64),
            MetricField::MarketCap => s.market_cap,
            MetricField::Return1d => s.return_1d,
            MetricField::Return5d => s.return_5d,
            MetricField::Return20d => s.return_20d,
            MetricField::Return60d => s.return_60d,
            MetricField::Return120d => s.return_120d,
            MetricField::VolumeChange => s.volume_change,
            MetricField::AvgVolume10d => s.avg_volume_10d,
            MetricField::Ma50 => s.sma_50,
            MetricField::Ma200 => s.sma_200,
            MetricField::Ema10 => s.ema_10,
            MetricField::Ema20 => s.ema_20,
            MetricField::AtrPct20 => s.atr_pct_20,
            MetricField::DistanceFrom50ma => s.distance_from_sma_50,
            MetricField::DaysAbove50ma => streak.map(|st| st.days_above as f64),
            MetricField::DaysBelow50ma => streak.map(|st| st.days_below as f64),
            MetricField::PercentAbove50ma => streak.map(|st| st.percent_above),
            MetricField::MaxDistanceBelow50ma => streak.map(|st| st.max_distance_below),
            MetricField::Sma50Streak => streak.map(|st| st.current_streak as f64),
            MetricField::RsGlobal => s.rs_global.map(f64::from),
            MetricField::RsCohort => s.rs_cohort.map(f64::from),
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let alias = match s {
            "price" | "close_price" => "close",
            "sma_50" => "ma_50",
            "sma_200" => "ma_200",
            other => other,
        };
        MetricField::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == alias)
            .ok_or_else(|| format!("unknown field '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }

    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Ge => value >= threshold,
            Operator::Le => value <= threshold,
            Operator::Eq => value == threshold,
            Operator::Ne => value != threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: MetricField,
    pub operator: Operator,
    pub threshold: f64,
}

impl Condition {
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> bool {
        self.field
            .value(snapshot)
            .is_some_and(|v| self.operator.apply(v, self.threshold))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator.symbol(), self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRule {
    pub name: String,
    pub description: Option<String>,
    pub conditions: Vec<Condition>,
}

const PRIMARY_FIELDS: [MetricField; 3] = [
    MetricField::Return5d,
    MetricField::Return1d,
    MetricField::Return20d,
];

impl TriggerRule {
    pub fn matches(&self, snapshot: &MetricsSnapshot) -> bool {
        self.conditions.iter().all(|c| c.evaluate(snapshot))
    }

    /// The headline field: the first of return_5d, return_1d, return_20d the
    /// rule refers to.
    pub fn primary_field(&self) -> Option<MetricField> {
        PRIMARY_FIELDS
            .into_iter()
            .find(|f| self.conditions.iter().any(|c| c.field == *f))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalFilters {
    pub exclude_sectors: Vec<String>,
    pub exclude_industries: Vec<String>,
    pub min_price: Option<f64>,
    pub min_volume: Option<i64>,
}

impl GlobalFilters {
    pub fn admits(&self, snapshot: &MetricsSnapshot) -> bool {
        let excluded = |value: &Option<String>, list: &[String]| {
            value
                .as_deref()
                .is_some_and(|v| list.iter().any(|x| x.eq_ignore_ascii_case(v)))
        };
        if excluded(&snapshot.sector, &self.exclude_sectors)
            || excluded(&snapshot.industry, &self.exclude_industries)
        {
            return false;
        }
        if self.min_price.is_some_and(|p| snapshot.close < p) {
            return false;
        }
        if self.min_volume.is_some_and(|v| snapshot.volume < v) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerConfig {
    pub global_filters: GlobalFilters,
    pub rules: Vec<TriggerRule>,
    /// Rules that failed to load, with the reason.
    pub skipped: Vec<(String, String)>,
}

fn parse_optional<T: FromStr>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<T>, RsrankError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| RsrankError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: format!("cannot parse '{}'", raw),
        }),
    }
}

/// Reads `[global_filters]` and every `[trigger.<name>]` section. A malformed
/// rule is logged and skipped; malformed global filters are an error.
pub fn load_trigger_config(config: &dyn ConfigPort) -> Result<TriggerConfig, RsrankError> {
    let global_filters = GlobalFilters {
        exclude_sectors: config
            .get_list(GLOBAL_FILTERS_SECTION, "exclude_sectors")
            .unwrap_or_default(),
        exclude_industries: config
            .get_list(GLOBAL_FILTERS_SECTION, "exclude_industries")
            .unwrap_or_default(),
        min_price: parse_optional(config, GLOBAL_FILTERS_SECTION, "min_price")?,
        min_volume: parse_optional(config, GLOBAL_FILTERS_SECTION, "min_volume")?,
    };

    let mut rules = Vec::new();
    let mut skipped = Vec::new();
    for section in config.sections() {
        let Some(name) = section.strip_prefix(TRIGGER_SECTION_PREFIX) else {
            continue;
        };
        match load_rule(config, &section, name) {
            Ok(rule) => rules.push(rule),
            Err(e) => {
                warn!(rule = name, error = %e, "skipping trigger rule");
                skipped.push((name.to_string(), e.to_string()));
            }
        }
    }

    Ok(TriggerConfig {
        global_filters,
        rules,
        skipped,
    })
}

fn load_rule(config: &dyn ConfigPort, section: &str, name: &str) -> Result<TriggerRule, RsrankError> {
    if name.trim().is_empty() {
        return Err(RsrankError::RuleInvalid {
            name: section.to_string(),
            reason: "rule name is empty".into(),
        });
    }
    let raw = config
        .get_string(section, "conditions")
        .ok_or_else(|| RsrankError::RuleInvalid {
            name: name.to_string(),
            reason: "missing 'conditions'".into(),
        })?;
    let conditions = parse_conditions(&raw).map_err(|e| RsrankError::RuleInvalid {
        name: name.to_string(),
        reason: e.display_with_context(&raw),
    })?;
    Ok(TriggerRule {
        name: name.to_string(),
        description: config.get_string(section, "description"),
        conditions,
    })
}

/// Snapshot values stored alongside each match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    pub return_1d: Option<f64>,
    pub return_5d: Option<f64>,
    pub return_20d: Option<f64>,
    pub return_60d: Option<f64>,
    pub volume_change: Option<f64>,
    pub market_cap: Option<f64>,
    pub price: f64,
    pub ma_50: Option<f64>,
    pub ma_200: Option<f64>,
    pub distance_from_50ma: Option<f64>,
    pub days_above_50ma: Option<usize>,
    pub percent_above_50ma: Option<f64>,
    pub max_distance_below_50ma: Option<f64>,
    pub rs_global: Option<u8>,
}

impl TriggerMetadata {
    pub fn from_snapshot(s: &MetricsSnapshot) -> Self {
        let streak = s.sma50_streak.as_ref();
        Self {
            return_1d: s.return_1d,
            return_5d: s.return_5d,
            return_20d: s.return_20d,
            return_60d: s.return_60d,
            volume_change: s.volume_change,
            market_cap: s.market_cap,
            price: s.close,
            ma_50: s.sma_50,
            ma_200: s.sma_200,
            distance_from_50ma: s.distance_from_sma_50,
            days_above_50ma: streak.map(|st| st.days_above),
            percent_above_50ma: streak.map(|st| st.percent_above),
            max_distance_below_50ma: streak.map(|st| st.max_distance_below),
            rs_global: s.rs_global,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    pub symbol: String,
    pub rule_name: String,
    pub trigger_date: NaiveDate,
    pub trigger_value: Option<f64>,
    pub metadata: TriggerMetadata,
}

/// Matches for every admitted snapshot against every rule, ordered by rule
/// then symbol.
pub fn evaluate_triggers(config: &TriggerConfig, snapshots: &[MetricsSnapshot]) -> Vec<TriggerMatch> {
    let admitted: Vec<&MetricsSnapshot> = snapshots
        .iter()
        .filter(|s| config.global_filters.admits(s))
        .collect();

    let mut matches = Vec::new();
    for rule in &config.rules {
        let primary = rule.primary_field();
        let mut hits: Vec<TriggerMatch> = admitted
            .iter()
            .filter(|s| rule.matches(s))
            .map(|s| TriggerMatch {
                symbol: s.symbol.clone(),
                rule_name: rule.name.clone(),
                trigger_date: s.date,
                trigger_value: primary.and_then(|f| f.value(s)),
                metadata: TriggerMetadata::from_snapshot(s),
            })
            .collect();
        hits.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        debug!(rule = %rule.name, matches = hits.len(), "rule evaluated");
        matches.extend(hits);
    }
    matches
}

#[derive(Debug, Clone)]
pub struct TriggerRunSummary {
    pub date: NaiveDate,
    pub evaluated: usize,
    pub deleted: usize,
    pub matches: Vec<TriggerMatch>,
    pub skipped_rules: Vec<(String, String)>,
}

impl TriggerRunSummary {
    pub fn count_for(&self, rule_name: &str) -> usize {
        self.matches.iter().filter(|m| m.rule_name == rule_name).count()
    }
}

/// Ports a trigger run reads from and writes to.
pub struct TriggerContext<'a> {
    pub prices: &'a dyn PriceHistoryPort,
    pub cohorts: &'a dyn CohortPort,
    pub store: &'a dyn DerivedStore,
    pub context_rows: usize,
}

pub fn run_triggers(
    ctx: &TriggerContext<'_>,
    rules_config: &dyn ConfigPort,
    date: Option<NaiveDate>,
) -> Result<TriggerRunSummary, RsrankError> {
    let config = load_trigger_config(rules_config)?;
    info!(rules = config.rules.len(), skipped = config.skipped.len(), "loaded trigger rules");

    let date = match date {
        Some(d) => d,
        None => ctx.prices.latest_date()?.ok_or_else(|| RsrankError::NoData {
            what: "no price bars to resolve a trigger date".into(),
        })?,
    };
    info!(%date, "running triggers");

    let profiles: HashMap<String, SymbolProfile> = ctx
        .cohorts
        .symbol_profiles()?
        .into_iter()
        .map(|p| (p.symbol.clone(), p))
        .collect();
    let ranks = ctx.store.rs_ranks_on(date)?;
    let request = HistoryRequest::tail(date, ctx.context_rows);

    let mut snapshots = Vec::new();
    for symbol in ctx.prices.list_symbols()? {
        let bars = ctx.prices.fetch_history(&symbol, &request)?;
        let history = SymbolHistory::new(symbol.clone(), bars);
        let symbol_ranks = ranks.get(&symbol).copied().unwrap_or_default();
        if let Some(snapshot) = snapshot_on(&history, date, profiles.get(&symbol), symbol_ranks) {
            snapshots.push(snapshot);
        }
    }

    let matches = evaluate_triggers(&config, &snapshots);
    let deleted = ctx.store.replace_trigger_matches(date, &matches)?;
    if deleted > 0 {
        info!(%date, deleted, "replaced earlier trigger matches");
    }
    info!(%date, evaluated = snapshots.len(), matches = matches.len(), "trigger run complete");

    Ok(TriggerRunSummary {
        date,
        evaluated: snapshots.len(),
        deleted,
        matches,
        skipped_rules: config.skipped,
    })
}

/// Shared by tests across the crate.
#[cfg(test)]
pub(crate) fn blank_snapshot(symbol: &str, date: NaiveDate) -> MetricsSnapshot {
    MetricsSnapshot {
        symbol: symbol.into(),
        date,
        close: 20.0,
        volume: 100_000,
        dollar_volume: 2_000_000.0,
        market_cap: None,
        market_cap_bucket: None,
        sector: None,
        industry: None,
        return_1d: None,
        return_5d: None,
        return_20d: None,
        return_60d: None,
        return_120d: None,
        volume_change: None,
        avg_volume_10d: None,
        volume_vs_avg_10d: None,
        sma_50: None,
        sma_200: None,
        ema_10: None,
        ema_20: None,
        atr_pct_20: None,
        distance_from_sma_50: None,
        sma50_streak: None,
        rs_global: None,
        rs_cohort: None,
    }
}
