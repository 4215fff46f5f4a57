//! Engine configuration validation.
//!
//! Validates every section before a run and builds the typed settings the
//! materializer consumes.

use crate::domain::error::RsrankError;
use crate::domain::events::EventParams;
use crate::domain::materializer::{required_context_rows, PipelineConfig};
use crate::domain::screening::{ScreenConfig, SortMetric};
use crate::domain::strength::ScoringWeights;
use crate::ports::config_port::ConfigPort;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub sqlite_path: String,
    pub pool_size: u32,
    pub pipeline: PipelineConfig,
}

fn invalid(section: &str, key: &str, reason: &str) -> RsrankError {
    RsrankError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

pub fn validate_engine_config(config: &dyn ConfigPort) -> Result<(), RsrankError> {
    load_engine_config(config).map(|_| ())
}

pub fn load_engine_config(config: &dyn ConfigPort) -> Result<EngineConfig, RsrankError> {
    let sqlite_path = validate_sqlite_path(config)?;
    let pool_size = validate_pool_size(config)?;
    let weights = load_weights(config)?;
    let benchmark = validate_benchmark(config)?;
    let (batch_dates, context_rows) = validate_pipeline(config, &weights)?;
    let events = load_event_params(config)?;
    let screening = load_screen_config(config)?;

    Ok(EngineConfig {
        sqlite_path,
        pool_size,
        pipeline: PipelineConfig {
            benchmark,
            weights,
            batch_dates,
            parallel: config.get_bool("pipeline", "parallel", true),
            context_rows,
            events,
            screening,
        },
    })
}

fn validate_sqlite_path(config: &dyn ConfigPort) -> Result<String, RsrankError> {
    match config.get_string("sqlite", "path") {
        Some(path) if !path.trim().is_empty() => Ok(path.trim().to_string()),
        _ => Err(RsrankError::ConfigMissing {
            section: "sqlite".to_string(),
            key: "path".to_string(),
        }),
    }
}

fn validate_pool_size(config: &dyn ConfigPort) -> Result<u32, RsrankError> {
    let value = config.get_int("sqlite", "pool_size", 4);
    if !(1..=64).contains(&value) {
        return Err(invalid("sqlite", "pool_size", "pool_size must be between 1 and 64"));
    }
    Ok(value as u32)
}

fn validate_benchmark(config: &dyn ConfigPort) -> Result<String, RsrankError> {
    match config.get_string("benchmark", "symbol") {
        None => Ok(PipelineConfig::default().benchmark),
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(_) => Err(invalid("benchmark", "symbol", "benchmark symbol must not be empty")),
    }
}

fn parse_numbers<T: std::str::FromStr>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<Vec<T>>, RsrankError> {
    let Some(items) = config.get_list(section, key) else {
        return Ok(None);
    };
    items
        .iter()
        .map(|item| {
            item.parse::<T>()
                .map_err(|_| invalid(section, key, &format!("'{}' is not a number", item)))
        })
        .collect::<Result<Vec<T>, _>>()
        .map(Some)
}

fn load_weights(config: &dyn ConfigPort) -> Result<ScoringWeights, RsrankError> {
    let defaults = ScoringWeights::default();
    let windows = parse_numbers::<usize>(config, "scoring", "windows")?.unwrap_or(defaults.windows);
    let weights = parse_numbers::<f64>(config, "scoring", "weights")?.unwrap_or(defaults.weights);
    ScoringWeights::new(windows, weights)
}

fn validate_pipeline(
    config: &dyn ConfigPort,
    weights: &ScoringWeights,
) -> Result<(usize, usize), RsrankError> {
    let defaults = PipelineConfig::default();
    let batch_dates = config.get_int("pipeline", "batch_dates", defaults.batch_dates as i64);
    if batch_dates < 1 {
        return Err(invalid("pipeline", "batch_dates", "batch_dates must be at least 1"));
    }
    let context_rows = config.get_int("pipeline", "context_rows", defaults.context_rows as i64);
    let required = required_context_rows(weights);
    if context_rows < required as i64 {
        return Err(invalid(
            "pipeline",
            "context_rows",
            &format!(
                "context_rows must be at least {} to cover the slowest indicator, scoring and return windows",
                required
            ),
        ));
    }
    Ok((batch_dates as usize, context_rows as usize))
}

fn load_event_params(config: &dyn ConfigPort) -> Result<EventParams, RsrankError> {
    let d = EventParams::default();
    let lookback_days = config.get_int("events", "lookback_days", d.lookback_days as i64);
    if lookback_days < 1 {
        return Err(invalid("events", "lookback_days", "lookback_days must be at least 1"));
    }
    let avg_days = config.get_int("events", "avg_days", d.avg_days as i64);
    if avg_days < 1 {
        return Err(invalid("events", "avg_days", "avg_days must be at least 1"));
    }
    let spike_multiplier = config.get_double("events", "spike_multiplier", d.spike_multiplier);
    if spike_multiplier <= 0.0 {
        return Err(invalid("events", "spike_multiplier", "spike_multiplier must be positive"));
    }
    let min_daily_gain = config.get_double("events", "min_daily_gain", d.min_daily_gain);
    let min_gap_pct = config.get_double("events", "min_gap_pct", d.min_gap_pct);
    if min_gap_pct < 0.0 {
        return Err(invalid("events", "min_gap_pct", "min_gap_pct must be non-negative"));
    }
    let min_gap_pct_strong =
        config.get_double("events", "min_gap_pct_strong", d.min_gap_pct_strong);
    if min_gap_pct_strong < min_gap_pct {
        return Err(invalid(
            "events",
            "min_gap_pct_strong",
            "min_gap_pct_strong must not be below min_gap_pct",
        ));
    }
    Ok(EventParams {
        lookback_days: lookback_days as usize,
        avg_days: avg_days as usize,
        spike_multiplier,
        min_daily_gain,
        min_gap_pct,
        min_gap_pct_strong,
    })
}

fn load_screen_config(config: &dyn ConfigPort) -> Result<ScreenConfig, RsrankError> {
    let d = ScreenConfig::default();
    let non_negative = |key: &str, default: f64| -> Result<f64, RsrankError> {
        let value = config.get_double("screening", key, default);
        if value < 0.0 {
            return Err(invalid("screening", key, &format!("{} must be non-negative", key)));
        }
        Ok(value)
    };

    let max_atr_pct = match config.get_string("screening", "max_atr_pct") {
        None => None,
        Some(raw) => Some(raw.trim().parse::<f64>().map_err(|_| {
            invalid("screening", "max_atr_pct", "max_atr_pct must be a number")
        })?),
    };

    let recent_event_days =
        config.get_int("screening", "recent_event_days", d.recent_event_days as i64);
    if recent_event_days < 1 {
        return Err(invalid(
            "screening",
            "recent_event_days",
            "recent_event_days must be at least 1",
        ));
    }
    let high_rs_threshold =
        config.get_int("screening", "high_rs_threshold", d.high_rs_threshold as i64);
    if !(1..=100).contains(&high_rs_threshold) {
        return Err(invalid(
            "screening",
            "high_rs_threshold",
            "high_rs_threshold must be between 1 and 100",
        ));
    }
    let sort_by = match config.get_string("screening", "sort_by") {
        None => d.sort_by,
        Some(raw) => raw
            .trim()
            .parse::<SortMetric>()
            .map_err(|reason| invalid("screening", "sort_by", &reason))?,
    };

    Ok(ScreenConfig {
        exclude_industries: config
            .get_list("screening", "exclude_industries")
            .unwrap_or(d.exclude_industries),
        exclude_sectors: config
            .get_list("screening", "exclude_sectors")
            .unwrap_or(d.exclude_sectors),
        min_price: non_negative("min_price", d.min_price)?,
        min_market_cap: non_negative("min_market_cap", d.min_market_cap)?,
        max_atr_pct,
        min_avg_volume: non_negative("min_avg_volume", d.min_avg_volume)?,
        min_dollar_volume: non_negative("min_dollar_volume", d.min_dollar_volume)?,
        recent_event_days: recent_event_days as usize,
        high_rs_threshold: high_rs_threshold as u8,
        sort_by,
    })
}
