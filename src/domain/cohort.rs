//! Market-cap cohorts and index universes.
//!
//! Cohort assignments are derived from the upstream symbol profile (market cap
//! plus static index membership lists) and refreshed out of band; they are not
//! recomputed per date.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarketCapBucket {
    Micro,
    Small,
    Mid,
    Large,
    Mega,
}

impl MarketCapBucket {
    pub const ALL: [MarketCapBucket; 5] = [
        MarketCapBucket::Micro,
        MarketCapBucket::Small,
        MarketCapBucket::Mid,
        MarketCapBucket::Large,
        MarketCapBucket::Mega,
    ];

    /// Buckets break at $200M, $2B, $20B and $100B.
    pub fn from_market_cap(market_cap: f64) -> Self {
        if market_cap < 200_000_000.0 {
            MarketCapBucket::Micro
        } else if market_cap < 2_000_000_000.0 {
            MarketCapBucket::Small
        } else if market_cap < 20_000_000_000.0 {
            MarketCapBucket::Mid
        } else if market_cap < 100_000_000_000.0 {
            MarketCapBucket::Large
        } else {
            MarketCapBucket::Mega
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketCapBucket::Micro => "micro",
            MarketCapBucket::Small => "small",
            MarketCapBucket::Mid => "mid",
            MarketCapBucket::Large => "large",
            MarketCapBucket::Mega => "mega",
        }
    }
}

impl fmt::Display for MarketCapBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketCapBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "micro" => Ok(MarketCapBucket::Micro),
            "small" => Ok(MarketCapBucket::Small),
            "mid" => Ok(MarketCapBucket::Mid),
            "large" => Ok(MarketCapBucket::Large),
            "mega" => Ok(MarketCapBucket::Mega),
            other => Err(format!("unknown market cap bucket '{}'", other)),
        }
    }
}

/// Upstream reference data for one symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolProfile {
    pub symbol: String,
    pub market_cap: Option<f64>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub index_memberships: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CohortAssignment {
    pub symbol: String,
    pub market_cap_bucket: Option<MarketCapBucket>,
    pub index_memberships: BTreeSet<String>,
}

pub fn assign_cohort(profile: &SymbolProfile) -> CohortAssignment {
    CohortAssignment {
        symbol: profile.symbol.clone(),
        market_cap_bucket: profile.market_cap.map(MarketCapBucket::from_market_cap),
        index_memberships: profile.index_memberships.clone(),
    }
}

pub type CohortMap = HashMap<String, CohortAssignment>;

pub fn build_cohort_map(profiles: &[SymbolProfile]) -> CohortMap {
    profiles
        .iter()
        .map(|p| (p.symbol.clone(), assign_cohort(p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(MarketCapBucket::from_market_cap(0.0), MarketCapBucket::Micro);
        assert_eq!(
            MarketCapBucket::from_market_cap(199_999_999.0),
            MarketCapBucket::Micro
        );
        assert_eq!(
            MarketCapBucket::from_market_cap(200_000_000.0),
            MarketCapBucket::Small
        );
        assert_eq!(
            MarketCapBucket::from_market_cap(2_000_000_000.0),
            MarketCapBucket::Mid
        );
        assert_eq!(
            MarketCapBucket::from_market_cap(20_000_000_000.0),
            MarketCapBucket::Large
        );
        assert_eq!(
            MarketCapBucket::from_market_cap(100_000_000_000.0),
            MarketCapBucket::Mega
        );
    }

    #[test]
    fn bucket_round_trips_through_str() {
        for bucket in MarketCapBucket::ALL {
            assert_eq!(bucket.as_str().parse::<MarketCapBucket>(), Ok(bucket));
        }
        assert!("giant".parse::<MarketCapBucket>().is_err());
    }

    #[test]
    fn assignment_without_market_cap_has_no_bucket() {
        let profile = SymbolProfile {
            symbol: "NEW".into(),
            index_memberships: ["SPX".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let a = assign_cohort(&profile);
        assert!(a.market_cap_bucket.is_none());
        assert!(a.index_memberships.contains("SPX"));
    }

    #[test]
    fn cohort_map_is_keyed_by_symbol() {
        let profiles = vec![
            SymbolProfile {
                symbol: "AAPL".into(),
                market_cap: Some(3.0e12),
                ..Default::default()
            },
            SymbolProfile {
                symbol: "TINY".into(),
                market_cap: Some(5.0e7),
                ..Default::default()
            },
        ];
        let map = build_cohort_map(&profiles);
        assert_eq!(map["AAPL"].market_cap_bucket, Some(MarketCapBucket::Mega));
        assert_eq!(map["TINY"].market_cap_bucket, Some(MarketCapBucket::Micro));
    }
}
