use crate::indicators::{calculate_atr, calculate_ema, median};
use crate::models::KlineWindow;

/// Volume-breakout signal parameters (bar counts refer to the kline
/// interval the window was fetched at).
#[derive(Debug, Clone)]
pub struct BreakoutParams {
    /// Prior high/low reference window, in bars, excluding the current bar
    pub lookback: usize,
    /// Maximum breakout distance past the reference, as a fraction
    pub overextension_cap: f64,
    /// Baseline volume window for the median
    pub vol_base_window: usize,
    /// Required multiple of baseline median volume
    pub vol_spike_mult: f64,
    /// Number of most recent bars whose volume must confirm the move
    pub vol_confirm_bars: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub atr_period: usize,
}

impl Default for BreakoutParams {
    fn default() -> Self {
        Self {
            lookback: 96,
            overextension_cap: 0.02,
            vol_base_window: 48,
            vol_spike_mult: 2.0,
            vol_confirm_bars: 3,
            ema_fast: 20,
            ema_slow: 50,
            atr_period: 14,
        }
    }
}

/// Outcome of one signal evaluation. A triggered signal always carries a
/// finite positive ATR; a valid ATR may come back without a trigger so the
/// caller can still size an order-flow entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalResult {
    pub triggered: bool,
    pub atr: Option<f64>,
}

impl SignalResult {
    fn not_triggered() -> Self {
        Self {
            triggered: false,
            atr: None,
        }
    }
}

impl BreakoutParams {
    /// Minimum bars the window must contain before evaluation
    pub fn required_len(&self) -> usize {
        self.lookback.max(self.vol_base_window).max(self.atr_period) + self.vol_confirm_bars + 2
    }

    fn confirm_bars(&self) -> usize {
        self.vol_confirm_bars.max(1)
    }
}

/// Upward breakout with volume confirmation and bullish EMA alignment.
/// Pure and deterministic; fails closed on short or non-finite data.
pub fn evaluate_long(params: &BreakoutParams, window: &KlineWindow) -> SignalResult {
    let n = window.len();
    if n < params.required_len() {
        return SignalResult::not_triggered();
    }

    let curr_close = window.closes[n - 1];
    let prev_high = match reference_level(&window.highs, params.lookback, true) {
        Some(v) => v,
        None => return SignalResult::not_triggered(),
    };
    if !curr_close.is_finite() || !prev_high.is_finite() || prev_high <= 0.0 {
        return SignalResult::not_triggered();
    }

    if curr_close <= prev_high {
        return SignalResult::not_triggered();
    }
    let breakout_ratio = (curr_close - prev_high) / prev_high;
    if !breakout_ratio.is_finite() || breakout_ratio > params.overextension_cap {
        return SignalResult::not_triggered();
    }

    if !volume_confirmed(params, &window.volumes) {
        return SignalResult::not_triggered();
    }

    match trend_alignment(params, &window.closes) {
        Some(true) => {}
        _ => return SignalResult::not_triggered(),
    }

    match calculate_atr(&window.highs, &window.lows, &window.closes, params.atr_period) {
        Some(atr) => SignalResult {
            triggered: true,
            atr: Some(atr),
        },
        None => SignalResult::not_triggered(),
    }
}

/// Mirror image of `evaluate_long`: downward break of the prior low,
/// volume confirmation, bearish EMA alignment.
pub fn evaluate_short(params: &BreakoutParams, window: &KlineWindow) -> SignalResult {
    let n = window.len();
    if n < params.required_len() {
        return SignalResult::not_triggered();
    }

    let curr_close = window.closes[n - 1];
    let prev_low = match reference_level(&window.lows, params.lookback, false) {
        Some(v) => v,
        None => return SignalResult::not_triggered(),
    };
    if !curr_close.is_finite() || !prev_low.is_finite() || prev_low <= 0.0 {
        return SignalResult::not_triggered();
    }

    if curr_close >= prev_low {
        return SignalResult::not_triggered();
    }
    let breakdown_ratio = (prev_low - curr_close) / prev_low;
    if !breakdown_ratio.is_finite() || breakdown_ratio > params.overextension_cap {
        return SignalResult::not_triggered();
    }

    if !volume_confirmed(params, &window.volumes) {
        return SignalResult::not_triggered();
    }

    match trend_alignment(params, &window.closes) {
        Some(false) => {}
        _ => return SignalResult::not_triggered(),
    }

    match calculate_atr(&window.highs, &window.lows, &window.closes, params.atr_period) {
        Some(atr) => SignalResult {
            triggered: true,
            atr: Some(atr),
        },
        None => SignalResult::not_triggered(),
    }
}

/// Max (or min) over the `lookback` bars preceding the current one.
/// Falls back to the single previous bar when the lookback exceeds the
/// available history.
fn reference_level(series: &[f64], lookback: usize, take_max: bool) -> Option<f64> {
    let n = series.len();
    if lookback == 0 || n < lookback + 2 {
        if n >= 2 {
            return Some(series[n - 2]);
        }
        return None;
    }

    let slice = &series[n - 1 - lookback..n - 1];
    let level = slice.iter().copied().fold(
        if take_max { f64::MIN } else { f64::MAX },
        |acc, v| if take_max { acc.max(v) } else { acc.min(v) },
    );
    Some(level)
}

/// Sum of the last `confirm_bars` volumes must reach
/// `spike_mult * baseline_median * confirm_bars`, where the baseline
/// window ends `confirm_bars` before now.
fn volume_confirmed(params: &BreakoutParams, volumes: &[f64]) -> bool {
    let confirm = params.confirm_bars();
    let n = volumes.len();
    if n < params.vol_base_window + confirm {
        return false;
    }

    let base = &volumes[n - params.vol_base_window - confirm..n - confirm];
    let base_med = match median(base) {
        Some(m) if m.is_finite() => m,
        _ => return false,
    };

    let recent_sum: f64 = volumes[n - confirm..].iter().sum();
    if !recent_sum.is_finite() {
        return false;
    }

    recent_sum >= params.vol_spike_mult * base_med * confirm as f64
}

/// Some(true) for bullish fast-over-slow EMA alignment, Some(false) for
/// bearish, None when the segment is too short or degenerate.
fn trend_alignment(params: &BreakoutParams, closes: &[f64]) -> Option<bool> {
    let need = params.ema_slow + 10;
    if closes.len() < need {
        return None;
    }
    let segment = &closes[closes.len() - need..];
    let fast = calculate_ema(segment, params.ema_fast)?;
    let slow = calculate_ema(segment, params.ema_slow)?;
    if fast == slow {
        return None;
    }
    Some(fast > slow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BreakoutParams {
        BreakoutParams {
            lookback: 3,
            overextension_cap: 0.05,
            vol_base_window: 4,
            vol_spike_mult: 2.0,
            vol_confirm_bars: 2,
            ema_fast: 3,
            ema_slow: 5,
            atr_period: 3,
        }
    }

    /// Gently rising 16-bar window ending in a confirmed upward breakout
    fn long_breakout_window() -> KlineWindow {
        let mut closes: Vec<f64> = (0..15).map(|i| 100.0 + i as f64 * 0.5).collect();
        closes.push(110.0); // breaks the 107.5 prior high by ~2.3%

        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();

        let mut volumes = vec![10.0; 14];
        volumes.extend_from_slice(&[40.0, 40.0]);

        KlineWindow {
            closes,
            highs,
            lows,
            volumes,
        }
    }

    /// Mirror: gently falling window ending in a confirmed breakdown
    fn short_breakdown_window() -> KlineWindow {
        let mut closes: Vec<f64> = (0..15).map(|i| 100.0 - i as f64 * 0.5).collect();
        closes.push(90.0); // breaks the 92.5 prior low

        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();

        let mut volumes = vec![10.0; 14];
        volumes.extend_from_slice(&[40.0, 40.0]);

        KlineWindow {
            closes,
            highs,
            lows,
            volumes,
        }
    }

    #[test]
    fn test_long_breakout_triggers() {
        let result = evaluate_long(&params(), &long_breakout_window());
        assert!(result.triggered);
        let atr = result.atr.unwrap();
        assert!(atr.is_finite() && atr > 0.0);
    }

    #[test]
    fn test_short_breakdown_triggers() {
        let result = evaluate_short(&params(), &short_breakdown_window());
        assert!(result.triggered);
        assert!(result.atr.unwrap() > 0.0);
    }

    #[test]
    fn test_long_does_not_trigger_short() {
        let result = evaluate_short(&params(), &long_breakout_window());
        assert!(!result.triggered);
    }

    #[test]
    fn test_overextended_breakout_rejected() {
        let mut w = long_breakout_window();
        let n = w.closes.len();
        w.closes[n - 1] = 130.0; // > 5% past the prior high
        w.highs[n - 1] = 130.5;
        w.lows[n - 1] = 129.5;

        assert!(!evaluate_long(&params(), &w).triggered);
    }

    #[test]
    fn test_no_volume_spike_rejected() {
        let mut w = long_breakout_window();
        let n = w.volumes.len();
        w.volumes[n - 2] = 10.0;
        w.volumes[n - 1] = 10.0;

        assert!(!evaluate_long(&params(), &w).triggered);
    }

    #[test]
    fn test_close_below_reference_rejected() {
        let mut w = long_breakout_window();
        let n = w.closes.len();
        w.closes[n - 1] = 107.0; // under the 107.5 prior high

        assert!(!evaluate_long(&params(), &w).triggered);
    }

    #[test]
    fn test_insufficient_history_fails_closed() {
        let w = KlineWindow {
            closes: vec![100.0; 7],
            highs: vec![101.0; 7],
            lows: vec![99.0; 7],
            volumes: vec![10.0; 7],
        };
        let result = evaluate_long(&params(), &w);
        assert!(!result.triggered);
        assert!(result.atr.is_none());
    }

    #[test]
    fn test_non_finite_data_fails_closed() {
        let mut w = long_breakout_window();
        let n = w.closes.len();
        w.closes[n - 1] = f64::NAN;

        let result = evaluate_long(&params(), &w);
        assert!(!result.triggered);
        assert!(result.atr.is_none());
    }

    #[test]
    fn test_deterministic() {
        let w = long_breakout_window();
        let p = params();
        assert_eq!(evaluate_long(&p, &w), evaluate_long(&p, &w));
    }

    #[test]
    fn test_reference_level_fallback_to_previous_bar() {
        // Lookback larger than history: use the single previous bar
        let series = vec![5.0, 7.0, 6.0];
        assert_eq!(reference_level(&series, 10, true), Some(7.0));
        assert_eq!(reference_level(&series, 0, true), Some(7.0));
        assert_eq!(reference_level(&[1.0], 10, true), None);
    }
}
