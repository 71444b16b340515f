use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::models::Side;

/// Rounding direction for exchange tick alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDirection {
    Nearest,
    Down,
    Up,
}

/// Floor a quantity down to the nearest lot step. Never rounds up, so a
/// rounded order can never exceed the margin the raw size was computed for.
pub fn floor_step(qty: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return qty;
    }
    (qty / step).floor() * step
}

/// Align a price to the exchange tick grid in the given direction.
pub fn round_tick(price: Decimal, tick: Decimal, direction: TickDirection) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let ratio = price / tick;
    let ticks = match direction {
        TickDirection::Nearest => ratio.round(),
        TickDirection::Down => ratio.floor(),
        TickDirection::Up => ratio.ceil(),
    };
    ticks * tick
}

/// Converts an account-risk fraction, an ATR estimate and an entry price
/// into a position notional and a stop/take-profit pair. All internal
/// arithmetic is decimal; f64 only at the boundary.
#[derive(Debug, Clone)]
pub struct BracketCalculator {
    per_trade_risk: Decimal,
    sl_multiplier: Decimal,
    tp_multiplier: Decimal,
}

impl BracketCalculator {
    pub fn new(per_trade_risk: f64, sl_multiplier: f64, tp_multiplier: f64) -> Self {
        Self {
            per_trade_risk: Decimal::from_f64(per_trade_risk).unwrap_or_default(),
            sl_multiplier: Decimal::from_f64(sl_multiplier).unwrap_or_default(),
            tp_multiplier: Decimal::from_f64(tp_multiplier).unwrap_or_default(),
        }
    }

    /// Risk-based position notional:
    /// `equity * risk_fraction / (atr * sl_mult / entry)`.
    ///
    /// Returns 0 (do not trade) for non-positive/non-finite inputs or a
    /// non-positive stop fraction.
    pub fn position_size_notional(&self, equity: f64, entry_price: f64, atr: f64) -> f64 {
        if !equity.is_finite() || !entry_price.is_finite() || !atr.is_finite() {
            tracing::warn!(equity, entry_price, atr, "Invalid sizing inputs");
            return 0.0;
        }
        if entry_price <= 0.0 || atr <= 0.0 || equity <= 0.0 {
            return 0.0;
        }

        let (equity, entry, atr) = match (
            Decimal::from_f64(equity),
            Decimal::from_f64(entry_price),
            Decimal::from_f64(atr),
        ) {
            (Some(e), Some(p), Some(a)) => (e, p, a),
            _ => return 0.0,
        };

        let risk_amount = equity * self.per_trade_risk;
        let stop_distance = atr * self.sl_multiplier;
        let stop_fraction = stop_distance / entry;
        if stop_fraction <= Decimal::ZERO {
            return 0.0;
        }

        let notional = risk_amount / stop_fraction;
        notional.to_f64().unwrap_or(0.0).max(0.0)
    }

    /// ATR-offset stop-loss / take-profit pair for the given side.
    ///
    /// Returns None for invalid ATR or when the resulting prices would not
    /// keep the stop on the losing side and the target on the winning side
    /// of the entry. The ordering check is a correctness invariant: an
    /// inverted bracket must never reach the exchange.
    pub fn compute_bracket(&self, entry_price: f64, side: Side, atr: f64) -> Option<(f64, f64)> {
        if !entry_price.is_finite() || !atr.is_finite() || entry_price <= 0.0 || atr <= 0.0 {
            tracing::warn!(entry_price, atr, "Cannot compute bracket from invalid inputs");
            return None;
        }

        let entry = Decimal::from_f64(entry_price)?;
        let atr = Decimal::from_f64(atr)?;

        let sl_offset = atr * self.sl_multiplier;
        let tp_offset = atr * self.tp_multiplier;

        let (sl, tp) = match side {
            Side::Long => (entry - sl_offset, entry + tp_offset),
            Side::Short => (entry + sl_offset, entry - tp_offset),
        };

        let ordered = match side {
            Side::Long => sl < entry && entry < tp,
            Side::Short => tp < entry && entry < sl,
        };
        if !ordered {
            tracing::warn!(%entry, %sl, %tp, side = %side, "Rejecting inverted bracket");
            return None;
        }

        Some((sl.to_f64()?, tp.to_f64()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> BracketCalculator {
        // Defaults from the daily-gainer risk frame
        BracketCalculator::new(0.0075, 1.5, 3.0)
    }

    #[test]
    fn test_sizing_reference_scenario() {
        // equity=10000, entry=100, atr=2 -> stop distance 3, stop fraction
        // 0.03, risk amount 75, notional 2500
        let notional = calc().position_size_notional(10_000.0, 100.0, 2.0);
        assert!((notional - 2500.0).abs() < 1e-9);
    }

    #[test]
    fn test_bracket_reference_scenario() {
        let (sl, tp) = calc().compute_bracket(100.0, Side::Long, 2.0).unwrap();
        assert!((sl - 97.0).abs() < 1e-9);
        assert!((tp - 106.0).abs() < 1e-9);

        let (sl, tp) = calc().compute_bracket(100.0, Side::Short, 2.0).unwrap();
        assert!((sl - 103.0).abs() < 1e-9);
        assert!((tp - 94.0).abs() < 1e-9);
    }

    #[test]
    fn test_sizing_zero_for_bad_inputs() {
        let c = calc();
        assert_eq!(c.position_size_notional(10_000.0, 0.0, 2.0), 0.0);
        assert_eq!(c.position_size_notional(10_000.0, 100.0, 0.0), 0.0);
        assert_eq!(c.position_size_notional(10_000.0, 100.0, -1.0), 0.0);
        assert_eq!(c.position_size_notional(10_000.0, f64::NAN, 2.0), 0.0);
        assert_eq!(c.position_size_notional(10_000.0, 100.0, f64::INFINITY), 0.0);
    }

    #[test]
    fn test_sizing_monotonicity() {
        let c = calc();
        let base = c.position_size_notional(10_000.0, 100.0, 2.0);

        // Non-decreasing in equity
        assert!(c.position_size_notional(20_000.0, 100.0, 2.0) >= base);
        // Non-increasing in ATR
        assert!(c.position_size_notional(10_000.0, 100.0, 4.0) <= base);
    }

    #[test]
    fn test_bracket_invalid_atr() {
        let c = calc();
        assert!(c.compute_bracket(100.0, Side::Long, 0.0).is_none());
        assert!(c.compute_bracket(100.0, Side::Long, f64::NAN).is_none());
    }

    #[test]
    fn test_bracket_ordering_invariant() {
        // Zero multipliers would put SL/TP on top of the entry
        let degenerate = BracketCalculator::new(0.0075, 0.0, 0.0);
        assert!(degenerate.compute_bracket(100.0, Side::Long, 2.0).is_none());
        assert!(degenerate.compute_bracket(100.0, Side::Short, 2.0).is_none());
    }

    #[test]
    fn test_floor_step_never_rounds_up() {
        let qty = Decimal::new(25003, 4); // 2.5003
        let step = Decimal::new(1, 3); // 0.001
        assert_eq!(floor_step(qty, step), Decimal::new(2500, 3));

        let qty = Decimal::new(199, 4); // 0.0199
        let step = Decimal::new(1, 2); // 0.01
        assert_eq!(floor_step(qty, step), Decimal::new(1, 2));
    }

    #[test]
    fn test_round_tick_idempotent() {
        let tick = Decimal::new(5, 2); // 0.05
        let price = Decimal::new(10123, 2); // 101.23

        for dir in [TickDirection::Nearest, TickDirection::Down, TickDirection::Up] {
            let once = round_tick(price, tick, dir);
            let twice = round_tick(once, tick, dir);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_round_tick_directions() {
        let tick = Decimal::new(1, 1); // 0.1
        let price = Decimal::new(10013, 2); // 100.13

        assert_eq!(round_tick(price, tick, TickDirection::Down), Decimal::new(1001, 1));
        assert_eq!(round_tick(price, tick, TickDirection::Up), Decimal::new(1002, 1));
        assert_eq!(round_tick(price, tick, TickDirection::Nearest), Decimal::new(1001, 1));
    }
}
