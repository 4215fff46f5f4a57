//! Simple Moving Average over a running sum.
//!
//! SMA(n)[i] = (C[i-n+1] + ... + C[i]) / n
//! Warmup: first (n-1) bars are invalid.

use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::PriceBar;
use std::collections::VecDeque;

/// Fixed-size sliding window with an O(1) running sum.
#[derive(Debug, Clone)]
pub struct RollingMean {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl RollingMean {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period),
            sum: 0.0,
        }
    }

    /// Adds a value and returns the mean once the window is full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        if self.period == 0 {
            return None;
        }
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        self.mean()
    }

    pub fn mean(&self) -> Option<f64> {
        (self.period > 0 && self.window.len() == self.period)
            .then(|| self.sum / self.period as f64)
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

/// SMA of an arbitrary value sequence; `None` until `period` values exist.
pub fn rolling_means(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut rolling = RollingMean::new(period);
    values.iter().map(|&v| rolling.push(v)).collect()
}

pub fn calculate_sma(bars: &[PriceBar], period: usize) -> IndicatorSeries {
    if period == 0 || bars.is_empty() {
        return IndicatorSeries::empty(IndicatorType::Sma(period));
    }

    let mut rolling = RollingMean::new(period);
    let values = bars
        .iter()
        .map(|bar| match rolling.push(bar.close) {
            Some(mean) => IndicatorPoint {
                date: bar.date,
                valid: true,
                value: mean,
            },
            None => IndicatorPoint::warmup(bar.date),
        })
        .collect();

    IndicatorSeries {
        indicator_type: IndicatorType::Sma(period),
        values,
    }
}
