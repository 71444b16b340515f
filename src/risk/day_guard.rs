use chrono::Utc;

/// Per-day trading ledger. Replaced wholesale on date rollover and
/// mutated only through `DayGuard::on_trade_close`.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date_key: String,
    pub pnl_pct: f64,
    pub trades: u32,
    pub halted: bool,
}

impl DayState {
    fn fresh(date_key: String) -> Self {
        Self {
            date_key,
            pnl_pct: 0.0,
            trades: 0,
            halted: false,
        }
    }
}

/// Daily PnL guard. Once `halted` is set it stays set until a new
/// calendar date is observed by `rollover`.
pub struct DayGuard {
    state: DayState,
    target_pct: f64,
    loss_cap_pct: f64,
}

impl DayGuard {
    pub fn new(target_pct: f64, loss_cap_pct: f64) -> Self {
        Self {
            state: DayState::fresh(Self::today_key()),
            target_pct,
            loss_cap_pct,
        }
    }

    fn today_key() -> String {
        Utc::now().date_naive().to_string()
    }

    pub fn state(&self) -> &DayState {
        &self.state
    }

    /// Replace the day state if the wall-clock date changed. Idempotent
    /// within the same day; must run at least once per loop iteration.
    pub fn rollover(&mut self) {
        self.rollover_to(Self::today_key());
    }

    fn rollover_to(&mut self, key: String) {
        if key != self.state.date_key {
            tracing::info!(
                old = %self.state.date_key,
                new = %key,
                "Day rollover, resetting daily state"
            );
            self.state = DayState::fresh(key);
        }
    }

    pub fn can_trade(&self) -> bool {
        !self.state.halted
    }

    /// Latch the halt flag for the rest of the day (operator hotkey).
    pub fn halt_today(&mut self) {
        self.state.halted = true;
    }

    /// Record a closed trade's realized percentage. No-op once halted.
    /// Non-finite inputs are rejected so a poisoned PnL value can never
    /// corrupt the ledger.
    pub fn on_trade_close(&mut self, realized_pct: f64) {
        if self.state.halted {
            return;
        }
        if !realized_pct.is_finite() {
            tracing::warn!(pct = realized_pct, "Ignoring non-finite realized PnL");
            return;
        }

        self.state.trades += 1;
        self.state.pnl_pct += realized_pct;

        if self.state.pnl_pct >= self.target_pct || self.state.pnl_pct <= self.loss_cap_pct {
            tracing::info!(
                day_pnl_pct = self.state.pnl_pct,
                trades = self.state.trades,
                "Daily limit reached, halting for the day"
            );
            self.state.halted = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> DayGuard {
        DayGuard::new(0.015, -0.02)
    }

    #[test]
    fn test_halts_on_target() {
        let mut g = guard();
        g.on_trade_close(0.01);
        assert!(g.can_trade());
        g.on_trade_close(0.006);
        assert!(!g.can_trade());
        assert_eq!(g.state().trades, 2);
    }

    #[test]
    fn test_halts_on_loss_cap() {
        let mut g = guard();
        g.on_trade_close(-0.012);
        g.on_trade_close(-0.009);
        assert!(!g.can_trade());
    }

    #[test]
    fn test_halt_latches_until_rollover() {
        let mut g = guard();
        g.on_trade_close(0.02);
        assert!(!g.can_trade());

        // Further closes are ignored while halted
        g.on_trade_close(-0.05);
        assert_eq!(g.state().trades, 1);
        assert_eq!(g.state().pnl_pct, 0.02);

        // Same-day rollover keeps the halt
        g.rollover();
        assert!(!g.can_trade());

        // New date resets everything
        g.rollover_to("1999-01-01".to_string());
        assert!(g.can_trade());
        assert_eq!(g.state().trades, 0);
        assert_eq!(g.state().pnl_pct, 0.0);
    }

    #[test]
    fn test_nan_pnl_rejected() {
        let mut g = guard();
        g.on_trade_close(f64::NAN);
        g.on_trade_close(f64::INFINITY);
        assert_eq!(g.state().trades, 0);
        assert_eq!(g.state().pnl_pct, 0.0);
        assert!(g.can_trade());
    }

    #[test]
    fn test_manual_halt() {
        let mut g = guard();
        g.halt_today();
        assert!(!g.can_trade());
    }

    #[test]
    fn test_cumulative_sequence_crossing_cap() {
        let mut g = guard();
        for _ in 0..3 {
            g.on_trade_close(-0.007);
        }
        // -0.021 <= -0.02 after the third close
        assert!(!g.can_trade());
        assert_eq!(g.state().trades, 3);
    }
}
