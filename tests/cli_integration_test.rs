//! CLI integration tests driving `cli::run` end to end.
//!
//! Tests cover:
//! - init, import, materialize, triggers, screen and status against a temp database
//! - Exit codes for config, import, rule and rebuild failures
//! - validate-rules on good and broken rule files

mod common;

use clap::Parser;
use common::*;
use rsrank::cli::{self, Cli};
use rsrank::domain::cohort::SymbolProfile;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tempfile::TempDir;

const DAYS: usize = 70;

const RULES: &str = r#"
[global_filters]
min_price = 5

[trigger.breakout]
conditions = return_5d > 10 AND volume_change > 150
"#;

fn code(c: ExitCode) -> String {
    format!("{:?}", c)
}

fn run(args: &[&str]) -> ExitCode {
    let mut argv = vec!["rsrank"];
    argv.extend_from_slice(args);
    cli::run(Cli::try_parse_from(argv).unwrap())
}

fn bars_csv(bars: &[PriceBar]) -> String {
    let mut out = String::from("symbol,date,open,high,low,close,volume\n");
    for b in bars {
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            b.symbol, b.date, b.open, b.high, b.low, b.close, b.volume
        ));
    }
    out
}

fn profiles_csv(profiles: &[SymbolProfile]) -> String {
    let mut out = String::from("symbol,market_cap,sector,industry,indexes\n");
    for p in profiles {
        let indexes: Vec<&str> = p.index_memberships.iter().map(String::as_str).collect();
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            p.symbol,
            p.market_cap.map(|c| c.to_string()).unwrap_or_default(),
            p.sector.clone().unwrap_or_default(),
            p.industry.clone().unwrap_or_default(),
            indexes.join(";")
        ));
    }
    out
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("rsrank.db");
        let ini = format!(
            "[sqlite]\npath = {}\npool_size = 2\n\n[pipeline]\nbatch_dates = 10\n",
            db.display()
        );
        fs::write(dir.path().join("rsrank.ini"), ini).unwrap();

        let days = trading_days(date(2024, 1, 1), DAYS);
        fs::write(dir.path().join("prices.csv"), bars_csv(&universe_bars(&days))).unwrap();
        fs::write(dir.path().join("spy.csv"), bars_csv(&benchmark_bars(&days))).unwrap();
        fs::write(dir.path().join("profiles.csv"), profiles_csv(&profiles())).unwrap();
        fs::write(dir.path().join("rules.ini"), RULES).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn arg(&self, name: &str) -> String {
        self.path(name).to_str().unwrap().to_string()
    }

    fn db(&self) -> PathBuf {
        self.path("rsrank.db")
    }

    fn import_all(&self) -> ExitCode {
        run(&[
            "import",
            "--config",
            &self.arg("rsrank.ini"),
            "--prices",
            &self.arg("prices.csv"),
            "--benchmark",
            &self.arg("spy.csv"),
            "--profiles",
            &self.arg("profiles.csv"),
        ])
    }
}

fn count(db: &Path, table: &str) -> i64 {
    query_count(db, &format!("SELECT COUNT(*) FROM {}", table))
}

mod end_to_end {
    use super::*;

    #[test]
    fn full_workflow() {
        let ws = Workspace::new();
        let config = ws.arg("rsrank.ini");

        assert_eq!(code(run(&["init", "--config", &config])), code(ExitCode::SUCCESS));
        assert!(ws.db().exists());
        assert_eq!(code(ws.import_all()), code(ExitCode::SUCCESS));
        assert_eq!(count(&ws.db(), "prices"), (4 * DAYS) as i64);
        assert_eq!(count(&ws.db(), "benchmark_prices"), DAYS as i64);
        assert_eq!(count(&ws.db(), "index_memberships"), 4);

        assert_eq!(
            code(run(&["materialize", "--config", &config])),
            code(ExitCode::SUCCESS)
        );
        assert_eq!(count(&ws.db(), "indicators"), (4 * DAYS) as i64);
        assert_eq!(count(&ws.db(), "symbol_metrics"), 4);
        assert_eq!(count(&ws.db(), "watermarks"), 7);

        assert_eq!(
            code(run(&["triggers", "--config", &config, "--rules", &ws.arg("rules.ini")])),
            code(ExitCode::SUCCESS)
        );
        assert_eq!(
            query_count(
                &ws.db(),
                "SELECT COUNT(*) FROM trigger_matches WHERE rule_name = 'breakout' AND symbol = 'GAP'"
            ),
            1
        );

        assert_eq!(
            code(run(&["screen", "--config", &config, "--limit", "5"])),
            code(ExitCode::SUCCESS)
        );
        assert_eq!(code(run(&["status", "--config", &config])), code(ExitCode::SUCCESS));
    }

    #[test]
    fn materialize_twice_then_full_rebuild() {
        let ws = Workspace::new();
        let config = ws.arg("rsrank.ini");
        assert_eq!(code(ws.import_all()), code(ExitCode::SUCCESS));

        assert_eq!(
            code(run(&["materialize", "--config", &config])),
            code(ExitCode::SUCCESS)
        );
        let before: Vec<Vec<String>> = DERIVED_TABLES
            .iter()
            .map(|t| dump_table(&ws.db(), t))
            .collect();
        assert_eq!(
            code(run(&["materialize", "--config", &config])),
            code(ExitCode::SUCCESS)
        );
        assert_eq!(
            code(run(&["materialize", "--config", &config, "--full"])),
            code(ExitCode::SUCCESS)
        );
        let after: Vec<Vec<String>> = DERIVED_TABLES
            .iter()
            .map(|t| dump_table(&ws.db(), t))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn materialize_without_prices_is_no_data() {
        let ws = Workspace::new();
        assert_eq!(
            code(run(&["materialize", "--config", &ws.arg("rsrank.ini")])),
            code(ExitCode::from(5))
        );
    }
}

mod exit_codes {
    use super::*;

    #[test]
    fn missing_sqlite_path_is_config_error() {
        let ws = Workspace::new();
        fs::write(ws.path("bad.ini"), "[pipeline]\nbatch_dates = 5\n").unwrap();
        assert_eq!(
            code(run(&["init", "--config", &ws.arg("bad.ini")])),
            code(ExitCode::from(2))
        );
    }

    #[test]
    fn missing_config_file_is_config_error() {
        let ws = Workspace::new();
        assert_eq!(
            code(run(&["status", "--config", &ws.arg("absent.ini")])),
            code(ExitCode::from(2))
        );
    }

    #[test]
    fn malformed_csv_is_import_error() {
        let ws = Workspace::new();
        fs::write(
            ws.path("broken.csv"),
            "symbol,date,open,high,low,close,volume\nAAA,2024-01-02,1,1,1,abc,100\n",
        )
        .unwrap();
        assert_eq!(
            code(run(&[
                "import",
                "--config",
                &ws.arg("rsrank.ini"),
                "--prices",
                &ws.arg("broken.csv"),
            ])),
            code(ExitCode::from(7))
        );
        assert_eq!(count(&ws.db(), "prices"), 0);
    }

    #[test]
    fn drifted_watermark_exits_with_rebuild_code() {
        let ws = Workspace::new();
        let config = ws.arg("rsrank.ini");
        assert_eq!(code(ws.import_all()), code(ExitCode::SUCCESS));
        assert_eq!(
            code(run(&["materialize", "--config", &config])),
            code(ExitCode::SUCCESS)
        );
        rusqlite::Connection::open(ws.db())
            .unwrap()
            .execute(
                "UPDATE watermarks SET last_processed_date = '2030-01-01' WHERE table_name = 'indicators'",
                [],
            )
            .unwrap();
        assert_eq!(
            code(run(&["materialize", "--config", &config])),
            code(ExitCode::from(6))
        );
        assert_eq!(
            code(run(&["materialize", "--config", &config, "--full"])),
            code(ExitCode::SUCCESS)
        );
    }
}

mod validate_rules {
    use super::*;

    #[test]
    fn good_rules_pass() {
        let ws = Workspace::new();
        assert_eq!(
            code(run(&["validate-rules", "--rules", &ws.arg("rules.ini")])),
            code(ExitCode::SUCCESS)
        );
    }

    #[test]
    fn broken_rule_is_rule_error() {
        let ws = Workspace::new();
        fs::write(
            ws.path("broken.ini"),
            "[trigger.ok]\nconditions = return_5d > 1\n\n[trigger.bad]\nconditions = return_5d >> 3\n",
        )
        .unwrap();
        assert_eq!(
            code(run(&["validate-rules", "--rules", &ws.arg("broken.ini")])),
            code(ExitCode::from(4))
        );
    }

    #[test]
    fn unknown_field_is_rule_error() {
        let ws = Workspace::new();
        fs::write(
            ws.path("unknown.ini"),
            "[trigger.mystery]\nconditions = sharpe_ratio > 1\n",
        )
        .unwrap();
        assert_eq!(
            code(run(&["validate-rules", "--rules", &ws.arg("unknown.ini")])),
            code(ExitCode::from(4))
        );
    }
}
