//! SQLite adapter: upstream price/profile tables, derived tables and watermarks
//! in one database behind an r2d2 pool.
//!
//! Dates are stored as `YYYY-MM-DD` text so lexical order is date order.

use crate::domain::cohort::SymbolProfile;
use crate::domain::error::RsrankError;
use crate::domain::events::join_dates;
use crate::domain::ohlcv::PriceBar;
use crate::domain::ranking::RankScope;
use crate::domain::screening::ScreenListing;
use crate::domain::snapshot::RsRanks;
use crate::domain::trigger::{TriggerMatch, TriggerMetadata};
use crate::ports::cohort_port::CohortPort;
use crate::ports::data_port::{HistoryRequest, PriceHistoryPort};
use crate::ports::store_port::{
    Batch, BatchRows, DerivedStore, DerivedTable, Replacement, Watermark, NO_WATERMARK_VERSION,
};
use chrono::NaiveDate;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, HashMap};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prices (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    PRIMARY KEY (symbol, date)
);
CREATE INDEX IF NOT EXISTS idx_prices_date ON prices(date);

CREATE TABLE IF NOT EXISTS benchmark_prices (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    PRIMARY KEY (symbol, date)
);

CREATE TABLE IF NOT EXISTS symbol_profiles (
    symbol TEXT PRIMARY KEY,
    market_cap REAL,
    sector TEXT,
    industry TEXT
);

CREATE TABLE IF NOT EXISTS index_memberships (
    symbol TEXT NOT NULL,
    universe TEXT NOT NULL,
    PRIMARY KEY (symbol, universe)
);

CREATE TABLE IF NOT EXISTS indicators (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    sma_50 REAL,
    sma_200 REAL,
    ema_10 REAL,
    ema_20 REAL,
    atr_pct_20 REAL,
    PRIMARY KEY (symbol, date)
);

CREATE TABLE IF NOT EXISTS ranks (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    scope TEXT NOT NULL,
    percentile INTEGER NOT NULL,
    PRIMARY KEY (symbol, date, scope)
);
CREATE INDEX IF NOT EXISTS idx_ranks_date ON ranks(date);

CREATE TABLE IF NOT EXISTS breadth (
    date TEXT PRIMARY KEY,
    total INTEGER NOT NULL,
    above_sma_50 INTEGER NOT NULL,
    below_sma_50 INTEGER NOT NULL,
    above_sma_200 INTEGER NOT NULL,
    below_sma_200 INTEGER NOT NULL,
    up_4pct INTEGER NOT NULL,
    down_4pct INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS index_ranks (
    symbol TEXT NOT NULL,
    scope TEXT NOT NULL,
    date TEXT NOT NULL,
    percentile INTEGER NOT NULL,
    PRIMARY KEY (symbol, scope)
);

CREATE TABLE IF NOT EXISTS events (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    event_type TEXT NOT NULL,
    magnitude REAL NOT NULL,
    PRIMARY KEY (symbol, date, event_type)
);

CREATE TABLE IF NOT EXISTS event_aggregates (
    symbol TEXT PRIMARY KEY,
    spike_count INTEGER NOT NULL,
    avg_volume_ratio REAL,
    spike_dates TEXT NOT NULL,
    gap_count INTEGER NOT NULL,
    avg_gap_return REAL,
    gap_dates TEXT NOT NULL,
    last_event_date TEXT,
    last_event_type TEXT
);

CREATE TABLE IF NOT EXISTS symbol_metrics (
    symbol TEXT PRIMARY KEY,
    date TEXT NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    dollar_volume REAL NOT NULL,
    market_cap REAL,
    market_cap_bucket TEXT,
    sector TEXT,
    industry TEXT,
    return_1d REAL,
    return_5d REAL,
    return_20d REAL,
    return_60d REAL,
    return_120d REAL,
    volume_change REAL,
    avg_volume_10d REAL,
    volume_vs_avg_10d REAL,
    sma_50 REAL,
    sma_200 REAL,
    ema_10 REAL,
    ema_20 REAL,
    atr_pct_20 REAL,
    distance_from_sma_50 REAL,
    sma50_streak TEXT,
    rs_global INTEGER,
    rs_cohort INTEGER
);

CREATE TABLE IF NOT EXISTS screening_view (
    symbol TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    date TEXT NOT NULL,
    close REAL NOT NULL,
    return_5d REAL,
    return_20d REAL,
    rs_global INTEGER,
    atr_pct_20 REAL,
    spike_count INTEGER NOT NULL,
    gap_count INTEGER NOT NULL,
    last_event_date TEXT,
    last_event_type TEXT,
    tags TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trigger_matches (
    symbol TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    trigger_date TEXT NOT NULL,
    trigger_value REAL,
    metadata TEXT NOT NULL,
    PRIMARY KEY (symbol, rule_name, trigger_date)
);

CREATE TABLE IF NOT EXISTS watermarks (
    table_name TEXT PRIMARY KEY,
    last_processed_date TEXT NOT NULL,
    version INTEGER NOT NULL
);
";

fn pool_err(e: r2d2::Error) -> RsrankError {
    RsrankError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> RsrankError {
    RsrankError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(value: &str) -> Result<NaiveDate, RsrankError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|e| RsrankError::Database {
        reason: format!("bad stored date '{}': {}", value, e),
    })
}

fn date_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let date_str: String = row.get(idx)?;
    NaiveDate::parse_from_str(&date_str, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, RsrankError> {
    rows.collect::<rusqlite::Result<Vec<T>>>().map_err(query_err)
}

fn query_bars<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<PriceBar>, RsrankError> {
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(PriceBar {
                symbol: row.get(0)?,
                date: date_column(row, 1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: row.get(6)?,
            })
        })
        .map_err(query_err)?;
    collect_rows(rows)
}

fn read_watermark(
    conn: &Connection,
    table: DerivedTable,
) -> Result<Option<Watermark>, RsrankError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT last_processed_date, version FROM watermarks WHERE table_name = ?1",
            params![table.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(query_err)?;
    row.map(|(date, version)| {
        Ok(Watermark {
            last_processed_date: parse_date(&date)?,
            version,
        })
    })
    .transpose()
}

fn write_watermark(tx: &Transaction<'_>, table: DerivedTable, wm: &Watermark) -> Result<(), RsrankError> {
    tx.execute(
        "INSERT INTO watermarks (table_name, last_processed_date, version) VALUES (?1, ?2, ?3)
         ON CONFLICT(table_name) DO UPDATE SET
             last_processed_date = excluded.last_processed_date,
             version = excluded.version",
        params![table.as_str(), fmt_date(wm.last_processed_date), wm.version],
    )
    .map_err(query_err)?;
    Ok(())
}

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn open(path: &str, pool_size: u32) -> Result<Self, RsrankError> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.execute_batch("PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_err)?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every call shares the one connection.
    pub fn in_memory() -> Result<Self, RsrankError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).map_err(pool_err)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, RsrankError> {
        self.pool.get().map_err(pool_err)
    }

    pub fn initialize_schema(&self) -> Result<(), RsrankError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_err)
    }

    pub fn insert_bars(&self, bars: &[PriceBar]) -> Result<usize, RsrankError> {
        self.insert_into("prices", bars)
    }

    pub fn insert_benchmark_bars(&self, bars: &[PriceBar]) -> Result<usize, RsrankError> {
        self.insert_into("benchmark_prices", bars)
    }

    fn insert_into(&self, table: &str, bars: &[PriceBar]) -> Result<usize, RsrankError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT OR REPLACE INTO {} (symbol, date, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    table
                ))
                .map_err(query_err)?;
            for bar in bars {
                stmt.execute(params![
                    bar.symbol,
                    fmt_date(bar.date),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ])
                .map_err(query_err)?;
            }
        }
        tx.commit().map_err(query_err)?;
        Ok(bars.len())
    }

    /// Upserts profiles; a symbol's index memberships are replaced by the given set.
    pub fn upsert_profiles(&self, profiles: &[SymbolProfile]) -> Result<usize, RsrankError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        for p in profiles {
            tx.execute(
                "INSERT OR REPLACE INTO symbol_profiles (symbol, market_cap, sector, industry)
                 VALUES (?1, ?2, ?3, ?4)",
                params![p.symbol, p.market_cap, p.sector, p.industry],
            )
            .map_err(query_err)?;
            tx.execute(
                "DELETE FROM index_memberships WHERE symbol = ?1",
                params![p.symbol],
            )
            .map_err(query_err)?;
            for universe in &p.index_memberships {
                tx.execute(
                    "INSERT INTO index_memberships (symbol, universe) VALUES (?1, ?2)",
                    params![p.symbol, universe],
                )
                .map_err(query_err)?;
            }
        }
        tx.commit().map_err(query_err)?;
        Ok(profiles.len())
    }

    fn load_bars(
        &self,
        table: &str,
        symbol: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<PriceBar>, RsrankError> {
        let conn = self.conn()?;
        let columns = "symbol, date, open, high, low, close, volume";
        let through = request.through.map(fmt_date);

        match request.after {
            None => query_bars(
                &conn,
                &format!(
                    "SELECT {columns} FROM {table}
                     WHERE symbol = ?1 AND (?2 IS NULL OR date <= ?2) ORDER BY date"
                ),
                params![symbol, through],
            ),
            Some(after) => {
                let after = fmt_date(after);
                let mut bars = query_bars(
                    &conn,
                    &format!(
                        "SELECT {columns} FROM {table}
                         WHERE symbol = ?1 AND date <= ?2 ORDER BY date DESC LIMIT ?3"
                    ),
                    params![symbol, after, request.context_rows as i64],
                )?;
                bars.reverse();
                bars.extend(query_bars(
                    &conn,
                    &format!(
                        "SELECT {columns} FROM {table}
                         WHERE symbol = ?1 AND date > ?2 AND (?3 IS NULL OR date <= ?3)
                         ORDER BY date"
                    ),
                    params![symbol, after, through],
                )?);
                Ok(bars)
            }
        }
    }

    fn insert_batch_rows(tx: &Transaction<'_>, rows: &BatchRows) -> Result<(), RsrankError> {
        match rows {
            BatchRows::Indicators(rows) => {
                let mut stmt = tx
                    .prepare(
                        "INSERT OR REPLACE INTO indicators
                         (symbol, date, sma_50, sma_200, ema_10, ema_20, atr_pct_20)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )
                    .map_err(query_err)?;
                for r in rows {
                    stmt.execute(params![
                        r.symbol,
                        fmt_date(r.date),
                        r.sma_50,
                        r.sma_200,
                        r.ema_10,
                        r.ema_20,
                        r.atr_pct_20
                    ])
                    .map_err(query_err)?;
                }
            }
            BatchRows::Ranks(rows) => {
                let mut stmt = tx
                    .prepare(
                        "INSERT OR REPLACE INTO ranks (symbol, date, scope, percentile)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(query_err)?;
                for r in rows {
                    stmt.execute(params![
                        r.symbol,
                        fmt_date(r.date),
                        r.scope.to_string(),
                        r.percentile
                    ])
                    .map_err(query_err)?;
                }
            }
            BatchRows::Breadth(rows) => {
                let mut stmt = tx
                    .prepare(
                        "INSERT OR REPLACE INTO breadth
                         (date, total, above_sma_50, below_sma_50, above_sma_200, below_sma_200,
                          up_4pct, down_4pct)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .map_err(query_err)?;
                for r in rows {
                    stmt.execute(params![
                        fmt_date(r.date),
                        r.total as i64,
                        r.above_sma_50 as i64,
                        r.below_sma_50 as i64,
                        r.above_sma_200 as i64,
                        r.below_sma_200 as i64,
                        r.up_4pct as i64,
                        r.down_4pct as i64
                    ])
                    .map_err(query_err)?;
                }
            }
        }
        Ok(())
    }

    fn reload_rows(tx: &Transaction<'_>, replacement: &Replacement) -> Result<(), RsrankError> {
        match replacement {
            Replacement::IndexRanks(rows) => {
                tx.execute("DELETE FROM index_ranks", []).map_err(query_err)?;
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO index_ranks (symbol, scope, date, percentile)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(query_err)?;
                for r in rows {
                    stmt.execute(params![
                        r.symbol,
                        r.scope.to_string(),
                        fmt_date(r.date),
                        r.percentile
                    ])
                    .map_err(query_err)?;
                }
            }
            Replacement::Events { events, aggregates } => {
                tx.execute("DELETE FROM events", []).map_err(query_err)?;
                tx.execute("DELETE FROM event_aggregates", [])
                    .map_err(query_err)?;
                let mut stmt = tx
                    .prepare(
                        "INSERT OR REPLACE INTO events (symbol, date, event_type, magnitude)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(query_err)?;
                for e in events {
                    stmt.execute(params![
                        e.symbol,
                        fmt_date(e.date),
                        e.event_type.as_str(),
                        e.magnitude
                    ])
                    .map_err(query_err)?;
                }
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO event_aggregates
                         (symbol, spike_count, avg_volume_ratio, spike_dates, gap_count,
                          avg_gap_return, gap_dates, last_event_date, last_event_type)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    )
                    .map_err(query_err)?;
                for a in aggregates {
                    stmt.execute(params![
                        a.symbol,
                        a.spike_count as i64,
                        a.avg_volume_ratio,
                        join_dates(&a.spike_dates),
                        a.gap_count as i64,
                        a.avg_gap_return,
                        join_dates(&a.gap_dates),
                        a.last_event_date.map(fmt_date),
                        a.last_event_type.map(|t| t.as_str())
                    ])
                    .map_err(query_err)?;
                }
            }
            Replacement::SymbolMetrics(rows) => {
                tx.execute("DELETE FROM symbol_metrics", [])
                    .map_err(query_err)?;
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO symbol_metrics
                         (symbol, date, close, volume, dollar_volume, market_cap,
                          market_cap_bucket, sector, industry, return_1d, return_5d,
                          return_20d, return_60d, return_120d, volume_change, avg_volume_10d,
                          volume_vs_avg_10d, sma_50, sma_200, ema_10, ema_20, atr_pct_20,
                          distance_from_sma_50, sma50_streak, rs_global, rs_cohort)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                                 ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                                 ?25, ?26)",
                    )
                    .map_err(query_err)?;
                for s in rows {
                    let streak = s
                        .sma50_streak
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()
                        .map_err(|e| RsrankError::DatabaseQuery {
                            reason: format!("encoding streak for {}: {}", s.symbol, e),
                        })?;
                    stmt.execute(params![
                        s.symbol,
                        fmt_date(s.date),
                        s.close,
                        s.volume,
                        s.dollar_volume,
                        s.market_cap,
                        s.market_cap_bucket.map(|b| b.as_str()),
                        s.sector,
                        s.industry,
                        s.return_1d,
                        s.return_5d,
                        s.return_20d,
                        s.return_60d,
                        s.return_120d,
                        s.volume_change,
                        s.avg_volume_10d,
                        s.volume_vs_avg_10d,
                        s.sma_50,
                        s.sma_200,
                        s.ema_10,
                        s.ema_20,
                        s.atr_pct_20,
                        s.distance_from_sma_50,
                        streak,
                        s.rs_global,
                        s.rs_cohort
                    ])
                    .map_err(query_err)?;
                }
            }
            Replacement::ScreeningView(rows) => {
                tx.execute("DELETE FROM screening_view", [])
                    .map_err(query_err)?;
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO screening_view
                         (symbol, position, date, close, return_5d, return_20d, rs_global,
                          atr_pct_20, spike_count, gap_count, last_event_date, last_event_type,
                          tags)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    )
                    .map_err(query_err)?;
                for (i, row) in rows.iter().enumerate() {
                    let s = &row.snapshot;
                    stmt.execute(params![
                        s.symbol,
                        (i + 1) as i64,
                        fmt_date(s.date),
                        s.close,
                        s.return_5d,
                        s.return_20d,
                        s.rs_global,
                        s.atr_pct_20,
                        row.events.spike_count as i64,
                        row.events.gap_count as i64,
                        row.events.last_event_date.map(fmt_date),
                        row.events.last_event_type.map(|t| t.as_str()),
                        row.tags_joined()
                    ])
                    .map_err(query_err)?;
                }
            }
        }
        Ok(())
    }
}

impl PriceHistoryPort for SqliteAdapter {
    fn list_symbols(&self) -> Result<Vec<String>, RsrankError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT symbol FROM prices ORDER BY symbol")
            .map_err(query_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(query_err)?;
        collect_rows(rows)
    }

    fn fetch_history(
        &self,
        symbol: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<PriceBar>, RsrankError> {
        self.load_bars("prices", symbol, request)
    }

    fn fetch_benchmark(
        &self,
        symbol: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<PriceBar>, RsrankError> {
        self.load_bars("benchmark_prices", symbol, request)
    }

    fn trading_dates(&self) -> Result<Vec<NaiveDate>, RsrankError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT date FROM prices ORDER BY date")
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| date_column(row, 0))
            .map_err(query_err)?;
        collect_rows(rows)
    }

    fn latest_date(&self) -> Result<Option<NaiveDate>, RsrankError> {
        let conn = self.conn()?;
        let max: Option<String> = conn
            .query_row("SELECT MAX(date) FROM prices", [], |row| row.get(0))
            .map_err(query_err)?;
        max.as_deref().map(parse_date).transpose()
    }
}

impl CohortPort for SqliteAdapter {
    fn symbol_profiles(&self) -> Result<Vec<SymbolProfile>, RsrankError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT symbol, market_cap, sector, industry FROM symbol_profiles ORDER BY symbol",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SymbolProfile {
                    symbol: row.get(0)?,
                    market_cap: row.get(1)?,
                    sector: row.get(2)?,
                    industry: row.get(3)?,
                    ..SymbolProfile::default()
                })
            })
            .map_err(query_err)?;
        let mut profiles: BTreeMap<String, SymbolProfile> = collect_rows(rows)?
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let mut stmt = conn
            .prepare("SELECT symbol, universe FROM index_memberships")
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(query_err)?;
        for (symbol, universe) in collect_rows(rows)? {
            if let Some(profile) = profiles.get_mut(&symbol) {
                profile.index_memberships.insert(universe);
            }
        }
        Ok(profiles.into_values().collect())
    }
}

impl DerivedStore for SqliteAdapter {
    fn watermark(&self, table: DerivedTable) -> Result<Option<Watermark>, RsrankError> {
        let conn = self.conn()?;
        read_watermark(&conn, table)
    }

    fn commit_batch(&self, batch: &Batch, expected_version: i64) -> Result<Watermark, RsrankError> {
        let table = batch.table();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;

        let found = read_watermark(&tx, table)?.map_or(NO_WATERMARK_VERSION, |w| w.version);
        if found != expected_version {
            return Err(RsrankError::WatermarkConflict {
                table: table.to_string(),
                expected: expected_version,
                found,
            });
        }

        Self::insert_batch_rows(&tx, &batch.rows)?;
        let advanced = Watermark {
            last_processed_date: batch.through,
            version: expected_version + 1,
        };
        write_watermark(&tx, table, &advanced)?;
        tx.commit().map_err(query_err)?;
        Ok(advanced)
    }

    fn replace_table(
        &self,
        replacement: &Replacement,
        as_of: NaiveDate,
    ) -> Result<Watermark, RsrankError> {
        let table = replacement.table();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;

        let current = read_watermark(&tx, table)?;
        let watermark = match current {
            Some(w) if w.last_processed_date == as_of => w,
            other => Watermark {
                last_processed_date: as_of,
                version: other.map_or(NO_WATERMARK_VERSION, |w| w.version) + 1,
            },
        };

        Self::reload_rows(&tx, replacement)?;
        write_watermark(&tx, table, &watermark)?;
        tx.commit().map_err(query_err)?;
        Ok(watermark)
    }

    fn clear_derived(&self) -> Result<(), RsrankError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        for table in DerivedTable::ALL {
            tx.execute(&format!("DELETE FROM {}", table.as_str()), [])
                .map_err(query_err)?;
        }
        tx.execute("DELETE FROM event_aggregates", [])
            .map_err(query_err)?;
        tx.execute("DELETE FROM watermarks", []).map_err(query_err)?;
        tx.commit().map_err(query_err)
    }

    fn row_count(&self, table: DerivedTable) -> Result<usize, RsrankError> {
        let count: i64 = self
            .conn()?
            .query_row(&format!("SELECT COUNT(*) FROM {}", table.as_str()), [], |row| {
                row.get(0)
            })
            .map_err(query_err)?;
        Ok(count as usize)
    }

    fn rs_ranks_on(&self, date: NaiveDate) -> Result<HashMap<String, RsRanks>, RsrankError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT symbol, scope, percentile FROM ranks WHERE date = ?1")
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![fmt_date(date)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u8>(2)?,
                ))
            })
            .map_err(query_err)?;

        let mut ranks: HashMap<String, RsRanks> = HashMap::new();
        for (symbol, scope, percentile) in collect_rows(rows)? {
            let entry = ranks.entry(symbol).or_default();
            match scope.parse::<RankScope>() {
                Ok(RankScope::Global) => entry.global = Some(percentile),
                Ok(RankScope::Cohort(_)) => entry.cohort = Some(percentile),
                _ => {}
            }
        }
        Ok(ranks)
    }

    fn screening_listing(&self, limit: usize) -> Result<Vec<ScreenListing>, RsrankError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT position, symbol, close, return_5d, return_20d, rs_global, atr_pct_20, tags
                 FROM screening_view ORDER BY position LIMIT ?1",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ScreenListing {
                    position: row.get::<_, i64>(0)? as usize,
                    symbol: row.get(1)?,
                    close: row.get(2)?,
                    return_5d: row.get(3)?,
                    return_20d: row.get(4)?,
                    rs_global: row.get(5)?,
                    atr_pct_20: row.get(6)?,
                    tags: row.get(7)?,
                })
            })
            .map_err(query_err)?;
        collect_rows(rows)
    }

    fn replace_trigger_matches(
        &self,
        date: NaiveDate,
        matches: &[TriggerMatch],
    ) -> Result<usize, RsrankError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        let deleted = tx
            .execute(
                "DELETE FROM trigger_matches WHERE trigger_date = ?1",
                params![fmt_date(date)],
            )
            .map_err(query_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO trigger_matches
                     (symbol, rule_name, trigger_date, trigger_value, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(query_err)?;
            for m in matches {
                let metadata =
                    serde_json::to_string(&m.metadata).map_err(|e| RsrankError::DatabaseQuery {
                        reason: format!("encoding metadata for {}: {}", m.symbol, e),
                    })?;
                stmt.execute(params![
                    m.symbol,
                    m.rule_name,
                    fmt_date(m.trigger_date),
                    m.trigger_value,
                    metadata
                ])
                .map_err(query_err)?;
            }
        }
        tx.commit().map_err(query_err)?;
        Ok(deleted)
    }

    fn trigger_matches_on(&self, date: NaiveDate) -> Result<Vec<TriggerMatch>, RsrankError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT symbol, rule_name, trigger_date, trigger_value, metadata
                 FROM trigger_matches WHERE trigger_date = ?1 ORDER BY rule_name, symbol",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![fmt_date(date)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    date_column(row, 2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(query_err)?;

        collect_rows(rows)?
            .into_iter()
            .map(|(symbol, rule_name, trigger_date, trigger_value, raw)| {
                let metadata: TriggerMetadata =
                    serde_json::from_str(&raw).map_err(|e| RsrankError::Database {
                        reason: format!("bad metadata for {} / {}: {}", symbol, rule_name, e),
                    })?;
                Ok(TriggerMatch {
                    symbol,
                    rule_name,
                    trigger_date,
                    trigger_value,
                    metadata,
                })
            })
            .collect()
    }
}
