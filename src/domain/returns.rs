//! Trailing N-trading-day simple returns.
//!
//! `return(s, d, w) = close(d) / close(d - w) - 1` where `d - w` is a row
//! offset into the symbol's own bar history. Undefined (never zero) when fewer
//! than `w` prior bars exist or the base close is not positive.

/// Windows feeding the relative-strength score.
pub const SCORING_WINDOWS: [usize; 3] = [4, 13, 20];

/// Windows shown in metrics snapshots (`return_1d` .. `return_120d`).
pub const DISPLAY_WINDOWS: [usize; 5] = [1, 5, 20, 60, 120];

pub fn trailing_return(closes: &[f64], index: usize, window: usize) -> Option<f64> {
    if window == 0 || index >= closes.len() || index < window {
        return None;
    }
    let base = closes[index - window];
    if base <= 0.0 || !base.is_finite() {
        return None;
    }
    Some(closes[index] / base - 1.0)
}

/// Returns for every window at one row, in window order.
pub fn returns_at(closes: &[f64], index: usize, windows: &[usize]) -> Vec<Option<f64>> {
    windows
        .iter()
        .map(|&w| trailing_return(closes, index, w))
        .collect()
}
