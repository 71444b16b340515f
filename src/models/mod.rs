use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a futures position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Sign applied to a raw price return when converting to realized PnL
    pub fn pnl_sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-length OHLCV window for one symbol at one bar interval
#[derive(Debug, Clone, Default)]
pub struct KlineWindow {
    pub closes: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl KlineWindow {
    /// Number of bars, or 0 if the four series disagree in length
    pub fn len(&self) -> usize {
        let n = self.closes.len();
        if self.highs.len() == n && self.lows.len() == n && self.volumes.len() == n {
            n
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One row of the 24h ticker snapshot used for candidate ranking
#[derive(Debug, Clone)]
pub struct TickerEntry {
    pub symbol: String,
    pub pct_change: f64,
    pub last_price: f64,
    pub quote_volume: f64,
}

/// Exchange precision rules for one symbol
#[derive(Debug, Clone, Default)]
pub struct SymbolRule {
    pub price_precision: u32,
    pub qty_precision: u32,
    pub tick_size: Option<Decimal>,
    pub step_size: Option<Decimal>,
    pub min_notional: Option<Decimal>,
}

/// A single taker trade from the aggregated-trade stream
#[derive(Debug, Clone, Copy)]
pub struct AggTrade {
    pub ts_ms: i64,
    pub price: f64,
    pub qty: f64,
    pub is_taker_buy: bool,
}

/// An open bracketed position. At most one exists at a time; it is owned
/// by the executor and mutated only through it.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_order_id: Option<i64>,
    pub tp_order_id: Option<i64>,
    pub sl_order_id: Option<i64>,
}

/// Why a position was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    /// Market close requested before either bracket leg filled
    Forced(String),
}

/// Result of a position being closed, reported back to the control loop
#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub exit_price: f64,
    /// Realized return relative to entry, sign-flipped for shorts
    pub realized_pct: f64,
    pub reason: ExitReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_pnl_sign() {
        assert_eq!(Side::Long.pnl_sign(), 1.0);
        assert_eq!(Side::Short.pnl_sign(), -1.0);
    }

    #[test]
    fn test_kline_window_len_mismatch() {
        let w = KlineWindow {
            closes: vec![1.0, 2.0],
            highs: vec![1.0, 2.0],
            lows: vec![1.0],
            volumes: vec![1.0, 2.0],
        };
        assert_eq!(w.len(), 0);
        assert!(w.is_empty());
    }

    #[test]
    fn test_closed_trade_reason() {
        let trade = ClosedTrade {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            exit_price: 106.0,
            realized_pct: 0.06,
            reason: ExitReason::TakeProfit,
        };
        assert_eq!(trade.reason, ExitReason::TakeProfit);
    }
}
