use std::collections::{HashMap, VecDeque};

use crate::models::AggTrade;

/// How the large-trade gate is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Current aggregated quantity must exceed a percentile of its own history
    Percentile,
    /// Current aggregated quantity must exceed a fixed threshold
    Absolute,
}

#[derive(Debug, Clone)]
pub struct OrderFlowParams {
    /// Sliding aggregation window, seconds
    pub merge_window_s: u64,
    pub filter_mode: FilterMode,
    /// Percentile thresholds (0..100) in percentile mode
    pub buy_percentile: f64,
    pub sell_percentile: f64,
    /// Fixed thresholds in absolute mode, base-asset quantity
    pub buy_abs_threshold: f64,
    pub sell_abs_threshold: f64,
    /// Allowed price drift around the anchor, as a fraction
    pub anchor_drift: f64,
    /// Bounded per-side history length for percentile gating
    pub history_cap: usize,
}

impl Default for OrderFlowParams {
    fn default() -> Self {
        Self {
            merge_window_s: 10,
            filter_mode: FilterMode::Percentile,
            buy_percentile: 90.0,
            sell_percentile: 90.0,
            buy_abs_threshold: 0.0,
            sell_abs_threshold: 0.0,
            anchor_drift: 0.003,
            history_cap: 500,
        }
    }
}

/// One evaluation of the order-flow window for a symbol
#[derive(Debug, Clone, Default)]
pub struct FlowSnapshot {
    pub buy_signal: bool,
    pub sell_signal: bool,
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// Volume-weighted average price of taker buys in the window
    pub buy_anchor: Option<f64>,
    pub sell_anchor: Option<f64>,
    /// Percentile rank (0..100) of the current volume within its history
    pub buy_pct_rank: Option<f64>,
    pub sell_pct_rank: Option<f64>,
}

#[derive(Default)]
struct SymbolHistory {
    buy: VecDeque<f64>,
    sell: VecDeque<f64>,
    last_write_ms: i64,
}

/// Rolling large-trade detector. Answers two questions: is there unusual
/// one-sided taker flow right now (entry confirmation), and is there
/// unusual opposing flow against an open position (early-exit trigger).
pub struct OrderFlowSignal {
    params: OrderFlowParams,
    history: HashMap<String, SymbolHistory>,
}

impl OrderFlowSignal {
    pub fn new(params: OrderFlowParams) -> Self {
        Self {
            params,
            history: HashMap::new(),
        }
    }

    /// Aggregate the trades inside the merge window and gate the per-side
    /// quantities. `trades` may include entries older than the window;
    /// they are skipped.
    pub fn evaluate(&mut self, symbol: &str, trades: &[AggTrade], now_ms: i64) -> FlowSnapshot {
        let cutoff_ms = now_ms - self.params.merge_window_s as i64 * 1000;

        let mut buy_qty = 0.0;
        let mut sell_qty = 0.0;
        let mut buy_px_qty = 0.0;
        let mut sell_px_qty = 0.0;

        for t in trades {
            if t.ts_ms < cutoff_ms || !t.price.is_finite() || !t.qty.is_finite() {
                continue;
            }
            if t.is_taker_buy {
                buy_qty += t.qty;
                buy_px_qty += t.price * t.qty;
            } else {
                sell_qty += t.qty;
                sell_px_qty += t.price * t.qty;
            }
        }

        let buy_anchor = (buy_qty > 0.0).then(|| buy_px_qty / buy_qty);
        let sell_anchor = (sell_qty > 0.0).then(|| sell_px_qty / sell_qty);

        let cap = self.params.history_cap;
        let entry = self.history.entry(symbol.to_string()).or_default();

        // At most one history sample per second, so the fast control loop
        // cannot flood the percentile base with duplicates
        if now_ms - entry.last_write_ms >= 1000 {
            if buy_qty > 0.0 {
                push_bounded(&mut entry.buy, buy_qty, cap);
            }
            if sell_qty > 0.0 {
                push_bounded(&mut entry.sell, sell_qty, cap);
            }
            entry.last_write_ms = now_ms;
        }

        let (buy_gate, sell_gate) = match self.params.filter_mode {
            FilterMode::Percentile => (
                percentile(entry.buy.make_contiguous(), self.params.buy_percentile),
                percentile(entry.sell.make_contiguous(), self.params.sell_percentile),
            ),
            FilterMode::Absolute => (
                self.params.buy_abs_threshold,
                self.params.sell_abs_threshold,
            ),
        };

        FlowSnapshot {
            buy_signal: buy_qty > buy_gate && buy_anchor.is_some(),
            sell_signal: sell_qty > sell_gate && sell_anchor.is_some(),
            buy_volume: buy_qty,
            sell_volume: sell_qty,
            buy_anchor,
            sell_anchor,
            buy_pct_rank: percentile_rank(entry.buy.make_contiguous(), buy_qty),
            sell_pct_rank: percentile_rank(entry.sell.make_contiguous(), sell_qty),
        }
    }

    /// True iff `price` is within the configured drift of the anchor.
    /// Confirms the live price has not already left the large-trade
    /// cluster before acting on it.
    pub fn near_anchor_ok(&self, price: f64, anchor: Option<f64>) -> bool {
        let anchor = match anchor {
            Some(a) if a > 0.0 && a.is_finite() => a,
            _ => return false,
        };
        if !price.is_finite() || price <= 0.0 {
            return false;
        }
        let drift = self.params.anchor_drift;
        price >= anchor * (1.0 - drift) && price <= anchor * (1.0 + drift)
    }
}

fn push_bounded(deque: &mut VecDeque<f64>, value: f64, cap: usize) {
    if cap == 0 {
        return;
    }
    while deque.len() >= cap {
        deque.pop_front();
    }
    deque.push_back(value);
}

/// Value at percentile p (0..100) by nearest-rank on the sorted sample.
/// An empty sample gates everything out.
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let max_idx = sorted.len() - 1;
    let k = ((p / 100.0) * max_idx as f64).round() as isize;
    let k = k.clamp(0, max_idx as isize) as usize;
    sorted[k]
}

/// Percentile rank (0..100) of `value` within the sample, the inverse of
/// `percentile`. None when the sample has fewer than two entries.
fn percentile_rank(values: &[f64], value: f64) -> Option<f64> {
    if values.len() < 2 || !value.is_finite() {
        return None;
    }
    let below = values.iter().filter(|v| **v < value).count();
    Some(100.0 * below as f64 / (values.len() - 1) as f64)
}
