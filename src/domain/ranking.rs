//! Percentile ranking of relative-strength scores.
//!
//! Within one (date, scope) population, scores are sorted ascending with the
//! symbol name as tie-break and split into 100 buckets with NTILE semantics:
//! the first `N % 100` buckets hold `⌈N/100⌉` rows, the rest `⌊N/100⌋`. With
//! fewer than 100 symbols the result is a relative rank (1..=N), not a true
//! percentile.

use crate::domain::cohort::{CohortMap, MarketCapBucket};
use crate::domain::strength::RelativeStrengthScore;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub const PERCENTILE_BUCKETS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RankScope {
    Global,
    Cohort(MarketCapBucket),
    Index(String),
}

impl fmt::Display for RankScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankScope::Global => write!(f, "global"),
            RankScope::Cohort(bucket) => write!(f, "cohort:{}", bucket),
            RankScope::Index(universe) => write!(f, "index:{}", universe),
        }
    }
}

impl FromStr for RankScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(RankScope::Global);
        }
        if let Some(bucket) = s.strip_prefix("cohort:") {
            return bucket.parse().map(RankScope::Cohort);
        }
        if let Some(universe) = s.strip_prefix("index:") {
            if !universe.is_empty() {
                return Ok(RankScope::Index(universe.to_string()));
            }
        }
        Err(format!("unknown rank scope '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub scope: RankScope,
    pub percentile: u8,
}

/// 1-based NTILE bucket for the 0-based `position` in a population of `n`.
pub fn ntile(position: usize, n: usize, buckets: usize) -> usize {
    let q = n / buckets;
    let r = n % buckets;
    let big = r * (q + 1);
    if position < big {
        position / (q + 1) + 1
    } else {
        r + (position - big) / q + 1
    }
}

/// Percentile for each (symbol, score) in one population, ascending by score.
pub fn percentile_ranks(entries: &[(&str, f64)]) -> Vec<(String, u8)> {
    let mut sorted: Vec<&(&str, f64)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    let n = sorted.len();
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, (symbol, _))| {
            (
                symbol.to_string(),
                ntile(i, n, PERCENTILE_BUCKETS) as u8,
            )
        })
        .collect()
}

fn rank_population(
    date: NaiveDate,
    scope: RankScope,
    entries: &[(&str, f64)],
    out: &mut Vec<RankRecord>,
) {
    for (symbol, percentile) in percentile_ranks(entries) {
        out.push(RankRecord {
            symbol,
            date,
            scope: scope.clone(),
            percentile,
        });
    }
}

/// Global and market-cap cohort passes for one date.
pub fn rank_global_and_cohorts(
    date: NaiveDate,
    scores: &[RelativeStrengthScore],
    cohorts: &CohortMap,
) -> Vec<RankRecord> {
    let mut out = Vec::new();
    let global: Vec<(&str, f64)> = scores
        .iter()
        .map(|s| (s.symbol.as_str(), s.raw_score))
        .collect();
    rank_population(date, RankScope::Global, &global, &mut out);

    let mut by_bucket: BTreeMap<MarketCapBucket, Vec<(&str, f64)>> = BTreeMap::new();
    for s in scores {
        if let Some(bucket) = cohorts
            .get(&s.symbol)
            .and_then(|c| c.market_cap_bucket)
        {
            by_bucket
                .entry(bucket)
                .or_default()
                .push((s.symbol.as_str(), s.raw_score));
        }
    }
    for (bucket, entries) in by_bucket {
        rank_population(date, RankScope::Cohort(bucket), &entries, &mut out);
    }
    out
}

/// Index-universe pass for one date. Symbols outside a universe get no record for it.
pub fn rank_index_universes(
    date: NaiveDate,
    scores: &[RelativeStrengthScore],
    cohorts: &CohortMap,
) -> Vec<RankRecord> {
    let universes: BTreeSet<&str> = cohorts
        .values()
        .flat_map(|c| c.index_memberships.iter().map(|u| u.as_str()))
        .collect();

    let mut out = Vec::new();
    for universe in universes {
        let entries: Vec<(&str, f64)> = scores
            .iter()
            .filter(|s| {
                cohorts
                    .get(&s.symbol)
                    .is_some_and(|c| c.index_memberships.contains(universe))
            })
            .map(|s| (s.symbol.as_str(), s.raw_score))
            .collect();
        rank_population(
            date,
            RankScope::Index(universe.to_string()),
            &entries,
            &mut out,
        );
    }
    out
}

/// All three passes for one date.
pub fn rank_date(
    date: NaiveDate,
    scores: &[RelativeStrengthScore],
    cohorts: &CohortMap,
) -> Vec<RankRecord> {
    let mut out = rank_global_and_cohorts(date, scores, cohorts);
    out.extend(rank_index_universes(date, scores, cohorts));
    out
}

pub fn group_by_date(
    scores: Vec<RelativeStrengthScore>,
) -> BTreeMap<NaiveDate, Vec<RelativeStrengthScore>> {
    let mut grouped: BTreeMap<NaiveDate, Vec<RelativeStrengthScore>> = BTreeMap::new();
    for s in scores {
        grouped.entry(s.date).or_default().push(s);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cohort::{build_cohort_map, SymbolProfile};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    fn score(symbol: &str, raw: f64) -> RelativeStrengthScore {
        RelativeStrengthScore {
            symbol: symbol.into(),
            date: date(),
            raw_score: raw,
        }
    }

    #[test]
    fn ntile_matches_sql_semantics() {
        // 150 rows: buckets 1..=50 hold 2 rows, 51..=100 hold 1 row
        assert_eq!(ntile(0, 150, 100), 1);
        assert_eq!(ntile(1, 150, 100), 1);
        assert_eq!(ntile(2, 150, 100), 2);
        assert_eq!(ntile(99, 150, 100), 50);
        assert_eq!(ntile(100, 150, 100), 51);
        assert_eq!(ntile(149, 150, 100), 100);
        // fewer rows than buckets: rank order
        assert_eq!(ntile(0, 3, 100), 1);
        assert_eq!(ntile(2, 3, 100), 3);
        // exact multiple
        assert_eq!(ntile(199, 200, 100), 100);
        assert_eq!(ntile(2, 200, 100), 2);
    }

    #[test]
    fn ties_break_by_symbol() {
        let entries = [("ZZZ", 1.0), ("AAA", 1.0), ("MMM", 0.5)];
        let ranks = percentile_ranks(&entries);
        assert_eq!(ranks[0], ("MMM".to_string(), 1));
        assert_eq!(ranks[1], ("AAA".to_string(), 2));
        assert_eq!(ranks[2], ("ZZZ".to_string(), 3));
    }

    #[test]
    fn scope_round_trips_through_str() {
        let scopes = [
            RankScope::Global,
            RankScope::Cohort(MarketCapBucket::Mid),
            RankScope::Index("NDX".into()),
        ];
        for scope in scopes {
            assert_eq!(scope.to_string().parse::<RankScope>(), Ok(scope));
        }
        assert!("index:".parse::<RankScope>().is_err());
        assert!("sector:tech".parse::<RankScope>().is_err());
    }

    #[test]
    fn cohort_and_index_passes_are_independent() {
        let profiles = vec![
            SymbolProfile {
                symbol: "BIG1".into(),
                market_cap: Some(5.0e11),
                index_memberships: ["SPX".to_string()].into_iter().collect(),
                ..Default::default()
            },
            SymbolProfile {
                symbol: "BIG2".into(),
                market_cap: Some(6.0e11),
                index_memberships: ["SPX".to_string(), "NDX".to_string()]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
            SymbolProfile {
                symbol: "SMALL".into(),
                market_cap: Some(5.0e8),
                ..Default::default()
            },
        ];
        let cohorts = build_cohort_map(&profiles);
        let scores = vec![score("BIG1", 0.3), score("BIG2", 0.1), score("SMALL", 0.2)];

        let ranks = rank_date(date(), &scores, &cohorts);
        let lookup: HashMap<(String, String), u8> = ranks
            .iter()
            .map(|r| ((r.symbol.clone(), r.scope.to_string()), r.percentile))
            .collect();

        assert_eq!(lookup[&("BIG1".into(), "global".into())], 3);
        assert_eq!(lookup[&("SMALL".into(), "global".into())], 2);
        assert_eq!(lookup[&("BIG2".into(), "global".into())], 1);
        assert_eq!(lookup[&("BIG1".into(), "cohort:mega".into())], 2);
        assert_eq!(lookup[&("BIG2".into(), "cohort:mega".into())], 1);
        assert_eq!(lookup[&("SMALL".into(), "cohort:small".into())], 1);
        assert_eq!(lookup[&("BIG2".into(), "index:NDX".into())], 1);
        assert_eq!(lookup[&("BIG1".into(), "index:SPX".into())], 2);
        assert!(!lookup.contains_key(&("BIG1".into(), "index:NDX".into())));
        assert!(!lookup.contains_key(&("SMALL".into(), "index:SPX".into())));
    }

    #[test]
    fn unassigned_symbols_only_rank_globally() {
        let cohorts = CohortMap::new();
        let scores = vec![score("A", 0.1), score("B", 0.2)];
        let ranks = rank_date(date(), &scores, &cohorts);
        assert_eq!(ranks.len(), 2);
        assert!(ranks.iter().all(|r| r.scope == RankScope::Global));
    }

    #[test]
    fn group_by_date_partitions() {
        let d2 = NaiveDate::from_ymd_opt(2024, 6, 4).unwrap();
        let mut later = score("A", 0.1);
        later.date = d2;
        let grouped = group_by_date(vec![score("A", 0.2), later, score("B", 0.3)]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&date()].len(), 2);
        assert_eq!(grouped[&d2].len(), 1);
    }

    proptest! {
        #[test]
        fn buckets_are_balanced_and_deterministic(
            raw in prop::collection::vec(-1.0f64..1.0, 1..450),
        ) {
            let names: Vec<String> = (0..raw.len()).map(|i| format!("S{:04}", i)).collect();
            let entries: Vec<(&str, f64)> = names
                .iter()
                .map(|n| n.as_str())
                .zip(raw.iter().copied())
                .collect();

            let first = percentile_ranks(&entries);
            let mut reversed = entries.clone();
            reversed.reverse();
            let second = percentile_ranks(&reversed);
            prop_assert_eq!(&first, &second);

            let n = entries.len();
            let ceil = n.div_ceil(PERCENTILE_BUCKETS);
            let floor = n / PERCENTILE_BUCKETS;
            let mut sizes: BTreeMap<u8, usize> = BTreeMap::new();
            for (_, p) in &first {
                prop_assert!(*p >= 1 && *p as usize <= PERCENTILE_BUCKETS);
                *sizes.entry(*p).or_default() += 1;
            }
            prop_assert_eq!(sizes.len(), n.min(PERCENTILE_BUCKETS));
            for size in sizes.values() {
                prop_assert!(*size <= ceil && *size >= floor.max(1));
            }
            // percentiles never decrease along the sorted order
            prop_assert!(first.windows(2).all(|w| w[0].1 <= w[1].1));
        }
    }
}
