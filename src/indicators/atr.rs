/// Average True Range (ATR) indicator
///
/// Measures market volatility by calculating the average of true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// Uses Wilder's smoothing for the moving average.

/// Calculate ATR over aligned high/low/close series
///
/// Returns the current ATR value, or None if insufficient data or the
/// result is not a finite positive number.
pub fn calculate_atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    if highs.len() != closes.len() || lows.len() != closes.len() {
        return None;
    }

    // Calculate true ranges
    let mut true_ranges = Vec::with_capacity(closes.len() - 1);
    for i in 1..closes.len() {
        let high = highs[i];
        let low = lows[i];
        let prev_close = closes[i - 1];

        // f64::max ignores NaN operands, so a poisoned bar has to be
        // rejected before it feeds the smoothing
        if !high.is_finite() || !low.is_finite() || !prev_close.is_finite() {
            return None;
        }

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        true_ranges.push(tr);
    }

    if true_ranges.len() < period {
        return None;
    }

    // First ATR is simple average of first 'period' true ranges
    let first_atr: f64 = true_ranges.iter().take(period).sum::<f64>() / period as f64;

    // Apply Wilder's smoothing for subsequent values
    let mut atr = first_atr;
    for tr in &true_ranges[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }

    if atr.is_finite() && atr > 0.0 {
        Some(atr)
    } else {
        None
    }
}
