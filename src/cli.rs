//! CLI definition and dispatch.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

use crate::adapters::csv_adapter::CsvImporter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::sqlite_adapter::SqliteAdapter;
use crate::domain::config_validation::{load_engine_config, EngineConfig};
use crate::domain::error::RsrankError;
use crate::domain::materializer::Materializer;
use crate::domain::trigger::{load_trigger_config, run_triggers, TriggerContext};
use crate::ports::data_port::PriceHistoryPort;
use crate::ports::store_port::{DerivedStore, DerivedTable};

#[derive(Parser, Debug)]
#[command(name = "rsrank", about = "Incremental indicator and relative-strength ranking engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database schema
    Init {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Load price, benchmark and profile CSV files
    Import {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        prices: Option<PathBuf>,
        #[arg(long)]
        benchmark: Option<PathBuf>,
        #[arg(long)]
        profiles: Option<PathBuf>,
    },
    /// Bring every derived table up to the latest trading date
    Materialize {
        #[arg(short, long)]
        config: PathBuf,
        /// Clear derived tables and watermarks first; readers see empty
        /// tables until the rebuild finishes, so run it offline
        #[arg(long)]
        full: bool,
    },
    /// Evaluate trigger rules and replace the stored matches for the date
    Triggers {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        rules: PathBuf,
        /// Defaults to the latest trading date
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print the screening view
    Screen {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show watermarks and row counts
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Check a trigger rules file without touching the database
    ValidateRules {
        #[arg(short, long)]
        rules: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Init { config } => run_init(&config),
        Command::Import {
            config,
            prices,
            benchmark,
            profiles,
        } => run_import(
            &config,
            prices.as_deref(),
            benchmark.as_deref(),
            profiles.as_deref(),
        ),
        Command::Materialize { config, full } => run_materialize(&config, full),
        Command::Triggers {
            config,
            rules,
            date,
        } => run_trigger_command(&config, &rules, date),
        Command::Screen { config, limit } => run_screen(&config, limit),
        Command::Status { config } => run_status(&config),
        Command::ValidateRules { rules } => run_validate_rules(&rules),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(&e)
        }
    }
}

pub fn load_engine(path: &Path) -> Result<EngineConfig, RsrankError> {
    info!("loading config from {}", path.display());
    let adapter = FileConfigAdapter::from_file(path)?;
    load_engine_config(&adapter)
}

fn open_store(engine: &EngineConfig) -> Result<SqliteAdapter, RsrankError> {
    let store = SqliteAdapter::open(&engine.sqlite_path, engine.pool_size)?;
    store.initialize_schema()?;
    Ok(store)
}

fn run_init(config: &Path) -> Result<(), RsrankError> {
    let engine = load_engine(config)?;
    open_store(&engine)?;
    println!("initialized {}", engine.sqlite_path);
    Ok(())
}

fn run_import(
    config: &Path,
    prices: Option<&Path>,
    benchmark: Option<&Path>,
    profiles: Option<&Path>,
) -> Result<(), RsrankError> {
    let engine = load_engine(config)?;
    let store = open_store(&engine)?;

    if prices.is_none() && benchmark.is_none() && profiles.is_none() {
        warn!("nothing to import; pass --prices, --benchmark or --profiles");
    }
    if let Some(path) = prices {
        let count = store.insert_bars(&CsvImporter::read_bars(path)?)?;
        println!("imported {} price bars from {}", count, path.display());
    }
    if let Some(path) = benchmark {
        let count = store.insert_benchmark_bars(&CsvImporter::read_bars(path)?)?;
        println!("imported {} benchmark bars from {}", count, path.display());
    }
    if let Some(path) = profiles {
        let count = store.upsert_profiles(&CsvImporter::read_profiles(path)?)?;
        println!("imported {} profiles from {}", count, path.display());
    }
    Ok(())
}

fn run_materialize(config: &Path, full: bool) -> Result<(), RsrankError> {
    let engine = load_engine(config)?;
    let store = open_store(&engine)?;
    let materializer = Materializer::new(&store, &store, &store, &engine.pipeline);
    let report = materializer.run(full)?;

    println!("materialized through {}", report.latest);
    for step in &report.steps {
        println!(
            "  {:<16} {:<12} {:>8} rows",
            step.table.as_str(),
            step.mode,
            step.rows_written
        );
    }
    Ok(())
}

fn run_trigger_command(
    config: &Path,
    rules: &Path,
    date: Option<NaiveDate>,
) -> Result<(), RsrankError> {
    let engine = load_engine(config)?;
    let store = open_store(&engine)?;
    let rules_config = FileConfigAdapter::from_file(rules)?;
    let ctx = TriggerContext {
        prices: &store,
        cohorts: &store,
        store: &store,
        context_rows: engine.pipeline.history_rows(),
    };
    let summary = run_triggers(&ctx, &rules_config, date)?;

    for (name, reason) in &summary.skipped_rules {
        println!("skipped rule {}: {}", name, reason);
    }
    println!(
        "{}: {} symbols evaluated, {} matches",
        summary.date,
        summary.evaluated,
        summary.matches.len()
    );
    for m in &summary.matches {
        let value = m
            .trigger_value
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<24} {:<8} {}", m.rule_name, m.symbol, value);
    }
    Ok(())
}

fn fmt_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "-".to_string())
}

fn run_screen(config: &Path, limit: usize) -> Result<(), RsrankError> {
    let engine = load_engine(config)?;
    let store = open_store(&engine)?;
    let rows = store.screening_listing(limit)?;
    if rows.is_empty() {
        println!("screening view is empty; run materialize first");
        return Ok(());
    }

    println!(
        "{:>4}  {:<8} {:>10} {:>9} {:>9} {:>4} {:>7}  tags",
        "#", "symbol", "close", "ret_5d", "ret_20d", "rs", "atr%"
    );
    for row in rows {
        println!(
            "{:>4}  {:<8} {:>10.2} {:>9} {:>9} {:>4} {:>7}  {}",
            row.position,
            row.symbol,
            row.close,
            fmt_opt(row.return_5d),
            fmt_opt(row.return_20d),
            row.rs_global
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string()),
            fmt_opt(row.atr_pct_20),
            row.tags
        );
    }
    Ok(())
}

fn run_status(config: &Path) -> Result<(), RsrankError> {
    let engine = load_engine(config)?;
    let store = open_store(&engine)?;

    match store.latest_date()? {
        Some(date) => println!("latest price date: {}", date),
        None => println!("latest price date: none"),
    }
    for table in DerivedTable::ALL {
        let watermark = store.watermark(table)?;
        let rows = store.row_count(table)?;
        let (date, version) = match watermark {
            Some(w) => (w.last_processed_date.to_string(), w.version.to_string()),
            None => ("never".to_string(), "-".to_string()),
        };
        let kind = if table.is_incremental() { "incremental" } else { "replaced" };
        println!(
            "  {:<16} {:<12} {:<12} v{:<4} {:>8} rows",
            table.as_str(),
            kind,
            date,
            version,
            rows
        );
    }
    Ok(())
}

fn run_validate_rules(rules: &Path) -> Result<(), RsrankError> {
    let adapter = FileConfigAdapter::from_file(rules)?;
    let config = load_trigger_config(&adapter)?;

    for rule in &config.rules {
        let conditions: Vec<String> = rule.conditions.iter().map(|c| c.to_string()).collect();
        println!("{}: {}", rule.name, conditions.join(" AND "));
    }
    if let Some((name, reason)) = config.skipped.first() {
        for (name, reason) in &config.skipped {
            println!("invalid rule {}: {}", name, reason);
        }
        return Err(RsrankError::RuleInvalid {
            name: name.clone(),
            reason: reason.clone(),
        });
    }
    println!("{} rules OK", config.rules.len());
    Ok(())
}
