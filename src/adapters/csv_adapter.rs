//! CSV import of upstream data.
//!
//! Price and benchmark files are long format, one bar per line:
//! `symbol,date,open,high,low,close,volume`. Profile files are
//! `symbol,market_cap,sector,industry,indexes` where `indexes` is a
//! `;`-separated list of universe names. Empty cells read as missing.

use crate::domain::cohort::SymbolProfile;
use crate::domain::error::RsrankError;
use crate::domain::ohlcv::PriceBar;
use chrono::NaiveDate;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct BarRow {
    symbol: String,
    date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    symbol: String,
    market_cap: Option<f64>,
    sector: Option<String>,
    industry: Option<String>,
    indexes: Option<String>,
}

pub struct CsvImporter;

impl CsvImporter {
    pub fn read_bars<P: AsRef<Path>>(path: P) -> Result<Vec<PriceBar>, RsrankError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::parse_bars(file, &path.display().to_string())
    }

    pub fn read_profiles<P: AsRef<Path>>(path: P) -> Result<Vec<SymbolProfile>, RsrankError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::parse_profiles(file, &path.display().to_string())
    }

    /// Bars sorted by symbol then date. `source` names the input in errors.
    pub fn parse_bars<R: Read>(reader: R, source: &str) -> Result<Vec<PriceBar>, RsrankError> {
        let import_err = |line: u64, reason: String| RsrankError::Import {
            file: source.to_string(),
            reason: format!("line {}: {}", line, reason),
        };

        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut bars = Vec::new();
        for result in rdr.deserialize::<BarRow>() {
            let row = result.map_err(|e| RsrankError::Import {
                file: source.to_string(),
                reason: e.to_string(),
            })?;
            let line = bars.len() as u64 + 2;

            let date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d")
                .map_err(|e| import_err(line, format!("invalid date '{}': {}", row.date, e)))?;
            if row.symbol.is_empty() {
                return Err(import_err(line, "empty symbol".into()));
            }
            if row.close <= 0.0 || row.high < row.low {
                return Err(import_err(
                    line,
                    format!("inconsistent bar for {} on {}", row.symbol, row.date),
                ));
            }
            if row.volume < 0 {
                return Err(import_err(line, "negative volume".into()));
            }

            bars.push(PriceBar {
                symbol: row.symbol,
                date,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }

        bars.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.date.cmp(&b.date)));
        debug!(source, bars = bars.len(), "parsed bars");
        Ok(bars)
    }

    pub fn parse_profiles<R: Read>(
        reader: R,
        source: &str,
    ) -> Result<Vec<SymbolProfile>, RsrankError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut profiles = Vec::new();
        for result in rdr.deserialize::<ProfileRow>() {
            let row = result.map_err(|e| RsrankError::Import {
                file: source.to_string(),
                reason: e.to_string(),
            })?;
            if row.market_cap.is_some_and(|m| m < 0.0) {
                return Err(RsrankError::Import {
                    file: source.to_string(),
                    reason: format!("negative market cap for {}", row.symbol),
                });
            }
            let index_memberships = row
                .indexes
                .as_deref()
                .unwrap_or("")
                .split(';')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            profiles.push(SymbolProfile {
                symbol: row.symbol,
                market_cap: row.market_cap,
                sector: row.sector.filter(|s| !s.is_empty()),
                industry: row.industry.filter(|s| !s.is_empty()),
                index_memberships,
            });
        }
        debug!(source, profiles = profiles.len(), "parsed profiles");
        Ok(profiles)
    }
}
