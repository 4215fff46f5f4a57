//! Average true range as a percentage of the previous close.
//!
//! TR%[i] = true_range(bar[i], C[i-1]) / C[i-1] * 100
//! ATR%(n)[i] = mean(TR%[i-n+1..=i])
//! The first bar has no previous close, so n+1 bars are needed.

use crate::domain::indicator::sma::RollingMean;
use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::PriceBar;

pub fn calculate_atr_pct(bars: &[PriceBar], period: usize) -> IndicatorSeries {
    if period == 0 || bars.is_empty() {
        return IndicatorSeries::empty(IndicatorType::AtrPct(period));
    }

    let mut rolling = RollingMean::new(period);
    let mut values = Vec::with_capacity(bars.len());
    values.push(IndicatorPoint::warmup(bars[0].date));

    for pair in bars.windows(2) {
        let (prev, bar) = (&pair[0], &pair[1]);
        let mean = match bar.true_range_pct(prev.close) {
            Some(tr_pct) => rolling.push(tr_pct),
            None => {
                rolling.reset();
                None
            }
        };
        values.push(match mean {
            Some(v) => IndicatorPoint {
                date: bar.date,
                valid: true,
                value: v,
            },
            None => IndicatorPoint::warmup(bar.date),
        });
    }

    IndicatorSeries {
        indicator_type: IndicatorType::AtrPct(period),
        values,
    }
}
