// Control loop. One tick: operator commands, date rollover, then either
// position monitoring (early exit, bracket poll, post-close bookkeeping)
// or the scan/entry path. Exchange access stays behind `MarketGateway`
// and `OrderExecutor`; this module owns all session state.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};

use crate::config::Settings;
use crate::execution::{EntryOutcome, OrderExecutor};
use crate::gateway::MarketGateway;
use crate::models::{Side, SymbolRule, TickerEntry};
use crate::risk::{floor_step, round_tick, BracketCalculator, DayGuard, TickDirection};
use crate::signal::{
    evaluate_long, evaluate_short, BreakoutParams, OrderFlowParams, OrderFlowSignal,
};
use crate::stream::MarketStream;

const TICK_INTERVAL: Duration = Duration::from_millis(800);
const RULES_REFRESH: Duration = Duration::from_secs(3600);
/// Pause between per-symbol kline fetches during a scan
const KLINE_FETCH_GAP: Duration = Duration::from_millis(300);

/// Operator commands, delivered from the hotkey task over a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Toggle the candidate scan on and off
    TogglePause,
    /// Market-close the open position now
    ForceClose,
    /// Stop trading until the next day rollover
    HaltToday,
}

/// Cached signal evaluation for one scanned symbol
#[derive(Debug, Clone, Copy, Default)]
struct CachedSignal {
    long: bool,
    short: bool,
    atr: Option<f64>,
}

#[derive(Debug, Clone)]
struct Candidate {
    symbol: String,
    entry_price: f64,
    side: Side,
    atr: f64,
}

pub struct Engine {
    settings: Settings,
    gateway: Arc<dyn MarketGateway>,
    stream: Arc<MarketStream>,
    executor: Arc<dyn OrderExecutor>,
    commands: mpsc::Receiver<Command>,

    day: DayGuard,
    bracket: BracketCalculator,
    breakout_params: BreakoutParams,
    flow: OrderFlowSignal,

    equity: f64,
    start_equity: f64,
    paused: bool,

    rules: HashMap<String, SymbolRule>,
    last_rules_refresh: Option<Instant>,
    last_scan: Option<Instant>,
    cooldown_until: Option<Instant>,
    symbol_locks: HashMap<String, Instant>,

    gainers: Vec<TickerEntry>,
    losers: Vec<TickerEntry>,
    signal_cache: HashMap<String, CachedSignal>,
}

impl Engine {
    pub fn new(
        settings: Settings,
        gateway: Arc<dyn MarketGateway>,
        stream: Arc<MarketStream>,
        executor: Arc<dyn OrderExecutor>,
        commands: mpsc::Receiver<Command>,
        initial_equity: f64,
    ) -> Self {
        let day = DayGuard::new(settings.daily_target_pct, settings.daily_loss_cap_pct);
        let bracket = BracketCalculator::new(
            settings.per_trade_risk,
            settings.sl_atr_mult,
            settings.tp_atr_mult,
        );
        let breakout_params = BreakoutParams {
            lookback: settings.lookback,
            overextension_cap: settings.overextension_cap,
            vol_base_window: settings.vol_base_window,
            vol_spike_mult: settings.vol_spike_mult,
            vol_confirm_bars: settings.vol_confirm_bars,
            ema_fast: settings.ema_fast,
            ema_slow: settings.ema_slow,
            atr_period: settings.atr_period,
        };
        let flow = OrderFlowSignal::new(OrderFlowParams {
            merge_window_s: settings.flow_merge_window_s,
            buy_percentile: settings.flow_buy_percentile,
            sell_percentile: settings.flow_sell_percentile,
            anchor_drift: settings.flow_anchor_drift,
            ..OrderFlowParams::default()
        });

        Self {
            settings,
            gateway,
            stream,
            executor,
            commands,
            day,
            bracket,
            breakout_params,
            flow,
            equity: initial_equity,
            start_equity: initial_equity,
            paused: false,
            rules: HashMap::new(),
            last_rules_refresh: None,
            last_scan: None,
            cooldown_until: None,
            symbol_locks: HashMap::new(),
            gainers: Vec::new(),
            losers: Vec::new(),
            signal_cache: HashMap::new(),
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        tracing::info!(
            equity = self.equity,
            live = self.settings.live_trading,
            "Control loop started"
        );
        loop {
            self.tick().await;
            sleep(TICK_INTERVAL).await;
        }
    }

    async fn tick(&mut self) {
        self.drain_commands().await;
        self.day.rollover();
        self.refresh_rules_if_due().await;

        if self.executor.has_open() {
            self.monitor_position().await;
        } else if self.day.can_trade() {
            self.scan_if_due().await;
            if !self.in_cooldown() {
                if let Some(candidate) = self.pick_candidate() {
                    self.try_enter(candidate).await;
                }
            }
        }
    }

    async fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::TogglePause => {
                    self.paused = !self.paused;
                    tracing::info!(paused = self.paused, "Scan toggled");
                }
                Command::HaltToday => {
                    self.day.halt_today();
                    tracing::warn!("Manual halt for the rest of the day");
                }
                Command::ForceClose => {
                    if !self.executor.has_open() {
                        tracing::info!("Force close requested but no position is open");
                        continue;
                    }
                    match self.executor.force_close("operator").await {
                        Ok(Some(trade)) => self.after_close(&trade.symbol, trade.realized_pct).await,
                        Ok(None) => {}
                        Err(e) => tracing::error!("Operator force close failed: {e}"),
                    }
                }
            }
        }
    }

    async fn refresh_rules_if_due(&mut self) {
        let due = self
            .last_rules_refresh
            .map(|t| t.elapsed() >= RULES_REFRESH)
            .unwrap_or(true);
        if !due {
            return;
        }
        match self.gateway.exchange_rules().await {
            Ok(rules) => {
                tracing::info!(symbols = rules.len(), "Exchange rules refreshed");
                self.rules = rules;
            }
            Err(e) => tracing::warn!("Exchange rule refresh failed: {e}"),
        }
        // Failed refreshes also wait out the interval instead of hammering
        self.last_rules_refresh = Some(Instant::now());
    }

    // ----- position monitoring -----

    async fn monitor_position(&mut self) {
        let pos = match self.executor.open_position() {
            Some(p) => p,
            None => return,
        };

        if self.opposing_flow_exit(&pos.symbol, pos.side) {
            match self.executor.force_close("opposing_flow").await {
                Ok(Some(trade)) => {
                    self.after_close(&trade.symbol, trade.realized_pct).await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    // Position stays open; the bracket poll below still runs
                    tracing::warn!(symbol = %pos.symbol, "Early exit close failed, will retry: {e}");
                }
            }
        }

        match self.executor.poll_and_close_if_hit().await {
            Ok(Some(trade)) => self.after_close(&trade.symbol, trade.realized_pct).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(symbol = %pos.symbol, "Bracket poll failed: {e}"),
        }
    }

    /// Heavy opposing taker flow near its own anchor while we are
    /// positioned the other way ends the trade before the stop does.
    fn opposing_flow_exit(&mut self, symbol: &str, side: Side) -> bool {
        let price = match self.stream.best_price(symbol) {
            Some(p) => p,
            None => return false,
        };
        let window = self.settings.flow_merge_window_s + 2;
        let trades = self.stream.recent_trades(symbol, window);
        let snap = self
            .flow
            .evaluate(symbol, &trades, Utc::now().timestamp_millis());
        let threshold = self.settings.flow_early_exit_pct;

        let (rank, anchor) = match side {
            Side::Long => (snap.sell_pct_rank, snap.sell_anchor),
            Side::Short => (snap.buy_pct_rank, snap.buy_anchor),
        };
        match rank {
            Some(r) if r >= threshold && self.flow.near_anchor_ok(price, anchor) => {
                tracing::info!(
                    symbol,
                    side = %side,
                    rank = r,
                    threshold,
                    "Opposing flow early exit triggered"
                );
                true
            }
            _ => false,
        }
    }

    async fn after_close(&mut self, symbol: &str, realized_pct: f64) {
        self.day.on_trade_close(realized_pct);
        let state = self.day.state();
        tracing::info!(
            symbol,
            trade_pct = format!("{:+.2}%", realized_pct * 100.0),
            day_pct = format!("{:+.2}%", state.pnl_pct * 100.0),
            trades = state.trades,
            "Trade closed"
        );

        let now = Instant::now();
        self.cooldown_until = Some(now + Duration::from_secs(self.settings.cooldown_s));
        self.symbol_locks.insert(
            symbol.to_string(),
            now + Duration::from_secs(self.settings.reentry_block_s),
        );

        self.refresh_equity().await;
    }

    async fn refresh_equity(&mut self) {
        let marked = self.start_equity * (1.0 + self.day.state().pnl_pct);
        if self.settings.live_trading {
            match self.gateway.balance_usdt().await {
                Ok(balance) => {
                    self.equity = balance;
                    tracing::info!(balance, "Balance updated");
                    return;
                }
                Err(e) => tracing::warn!("Balance update failed, marking from PnL: {e}"),
            }
        }
        self.equity = marked;
    }

    // ----- scan path -----

    fn in_cooldown(&self) -> bool {
        self.paused
            || self
                .cooldown_until
                .map(|t| Instant::now() < t)
                .unwrap_or(false)
    }

    fn symbol_locked(&self, symbol: &str) -> bool {
        self.symbol_locks
            .get(symbol)
            .map(|t| Instant::now() < *t)
            .unwrap_or(false)
    }

    async fn scan_if_due(&mut self) {
        if self.paused {
            return;
        }
        let due = self
            .last_scan
            .map(|t| t.elapsed().as_secs() >= self.settings.scan_interval_s)
            .unwrap_or(true);
        if !due {
            return;
        }

        let snapshot = match self.gateway.ticker_snapshot().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Ticker snapshot failed: {e}");
                self.last_scan = Some(Instant::now());
                return;
            }
        };
        self.last_scan = Some(Instant::now());

        let (gainers, losers) = rank_candidates(
            &snapshot,
            &self.settings.symbol_blacklist,
            self.settings.min_quote_volume,
            self.settings.scan_top_n,
        );
        let losers = if self.settings.allow_short {
            losers
        } else {
            Vec::new()
        };

        let mut symbols: HashSet<String> = HashSet::new();
        for t in gainers.iter().chain(losers.iter()) {
            symbols.insert(t.symbol.clone());
        }

        let mut cache = HashMap::new();
        for symbol in &symbols {
            let mut entry = CachedSignal::default();
            match self
                .gateway
                .klines(symbol, &self.settings.kline_interval, self.settings.kline_limit)
                .await
            {
                Ok(window) => {
                    let long = evaluate_long(&self.breakout_params, &window);
                    let short = if self.settings.allow_short {
                        evaluate_short(&self.breakout_params, &window)
                    } else {
                        crate::signal::SignalResult {
                            triggered: false,
                            atr: None,
                        }
                    };
                    entry.long = long.triggered;
                    entry.short = short.triggered;
                    entry.atr = long.atr.or(short.atr).filter(|a| *a > 0.0);
                }
                Err(e) => tracing::warn!(symbol, "Kline fetch failed during scan: {e}"),
            }
            cache.insert(symbol.clone(), entry);
            sleep(KLINE_FETCH_GAP).await;
        }

        tracing::info!(
            gainers = gainers.len(),
            losers = losers.len(),
            evaluated = cache.len(),
            "Scan complete"
        );
        self.gainers = gainers;
        self.losers = losers;
        self.signal_cache = cache;
        self.stream.ensure_subscribed(&symbols).await;
    }

    /// First long candidate from the gainers, then (when enabled) first
    /// short from the losers. Either the breakout or confirmed order flow
    /// qualifies, but a valid ATR is always required for sizing.
    fn pick_candidate(&mut self) -> Option<Candidate> {
        let now_ms = Utc::now().timestamp_millis();
        let window = self.settings.flow_merge_window_s + 2;

        let gainers = self.gainers.clone();
        for t in &gainers {
            if self.symbol_locked(&t.symbol) {
                continue;
            }
            let cached = match self.signal_cache.get(&t.symbol) {
                Some(c) => *c,
                None => continue,
            };
            let atr = match cached.atr {
                Some(a) => a,
                None => continue,
            };

            let trades = self.stream.recent_trades(&t.symbol, window);
            let snap = self.flow.evaluate(&t.symbol, &trades, now_ms);
            let live_price = self.stream.best_price(&t.symbol).unwrap_or(t.last_price);
            let flow_ok = snap.buy_signal && self.flow.near_anchor_ok(live_price, snap.buy_anchor);

            if cached.long || flow_ok {
                let entry_price = if flow_ok { live_price } else { t.last_price };
                tracing::info!(
                    symbol = %t.symbol,
                    breakout = cached.long,
                    flow = flow_ok,
                    atr,
                    entry_price,
                    "Long signal"
                );
                return Some(Candidate {
                    symbol: t.symbol.clone(),
                    entry_price,
                    side: Side::Long,
                    atr,
                });
            }
        }

        if !self.settings.allow_short {
            return None;
        }

        let losers = self.losers.clone();
        for t in &losers {
            if self.symbol_locked(&t.symbol) {
                continue;
            }
            let cached = match self.signal_cache.get(&t.symbol) {
                Some(c) => *c,
                None => continue,
            };
            let atr = match cached.atr {
                Some(a) => a,
                None => continue,
            };

            let trades = self.stream.recent_trades(&t.symbol, window);
            let snap = self.flow.evaluate(&t.symbol, &trades, now_ms);
            let live_price = self.stream.best_price(&t.symbol).unwrap_or(t.last_price);
            let flow_ok =
                snap.sell_signal && self.flow.near_anchor_ok(live_price, snap.sell_anchor);

            if cached.short || flow_ok {
                let entry_price = if flow_ok { live_price } else { t.last_price };
                tracing::info!(
                    symbol = %t.symbol,
                    breakout = cached.short,
                    flow = flow_ok,
                    atr,
                    entry_price,
                    "Short signal"
                );
                return Some(Candidate {
                    symbol: t.symbol.clone(),
                    entry_price,
                    side: Side::Short,
                    atr,
                });
            }
        }

        None
    }

    // ----- order placement -----

    async fn rule_for(&mut self, symbol: &str, entry: f64) -> SymbolRule {
        if let Some(rule) = self.rules.get(symbol) {
            return rule.clone();
        }

        // Freshly listed symbols can be missing from the hourly cache
        tracing::info!(symbol, "No cached exchange rule, refreshing on demand");
        if let Ok(rules) = self.gateway.exchange_rules().await {
            self.rules = rules;
            self.last_rules_refresh = Some(Instant::now());
            if let Some(rule) = self.rules.get(symbol) {
                return rule.clone();
            }
        }

        tracing::warn!(symbol, "Symbol absent from exchange rules, using fallback precision");
        fallback_rule(entry, self.settings.min_notional_fallback)
    }

    async fn try_enter(&mut self, candidate: Candidate) {
        let rule = self.rule_for(&candidate.symbol, candidate.entry_price).await;

        let plan = match plan_order(
            &self.bracket,
            self.equity,
            candidate.entry_price,
            candidate.side,
            candidate.atr,
            &rule,
            self.settings.min_notional_fallback,
        ) {
            Some(p) => p,
            None => {
                tracing::info!(symbol = %candidate.symbol, "Candidate did not survive sizing");
                // Brief pause so the same rejection is not retried every tick
                self.cooldown_until = Some(Instant::now() + Duration::from_secs(1));
                return;
            }
        };

        tracing::info!(
            symbol = %candidate.symbol,
            side = %candidate.side,
            quantity = plan.quantity,
            entry = plan.entry,
            stop_loss = plan.stop_loss,
            take_profit = plan.take_profit,
            "Submitting bracket order"
        );
        match self
            .executor
            .place_bracket(
                &candidate.symbol,
                candidate.side,
                plan.quantity,
                plan.entry,
                plan.stop_loss,
                plan.take_profit,
            )
            .await
        {
            Ok(EntryOutcome::Filled) => {
                self.cooldown_until =
                    Some(Instant::now() + Duration::from_secs(self.settings.cooldown_s));
            }
            Ok(EntryOutcome::TimedOut) => {
                tracing::warn!(symbol = %candidate.symbol, "Entry timed out and was canceled");
                self.cooldown_until =
                    Some(Instant::now() + Duration::from_secs(self.settings.cooldown_s));
            }
            Ok(EntryOutcome::Rejected(reason)) => {
                tracing::error!(symbol = %candidate.symbol, reason, "Entry rejected");
                self.cooldown_until =
                    Some(Instant::now() + Duration::from_secs(self.settings.cooldown_s));
            }
            Err(e) => tracing::error!(symbol = %candidate.symbol, "Order placement failed: {e}"),
        }
    }
}

/// Final order numbers after sizing, lot rounding and tick alignment
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct OrderPlan {
    pub quantity: f64,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Filter and rank a ticker snapshot into top gainers and top losers.
/// Blacklisted, thin and non-finite entries are dropped first.
fn rank_candidates(
    tickers: &[TickerEntry],
    blacklist: &[String],
    min_quote_volume: f64,
    top_n: usize,
) -> (Vec<TickerEntry>, Vec<TickerEntry>) {
    let mut eligible: Vec<TickerEntry> = tickers
        .iter()
        .filter(|t| {
            t.pct_change.is_finite()
                && t.last_price.is_finite()
                && t.last_price > 0.0
                && t.quote_volume >= min_quote_volume
                && !blacklist.iter().any(|b| b == &t.symbol)
        })
        .cloned()
        .collect();

    eligible.sort_by(|a, b| {
        b.pct_change
            .partial_cmp(&a.pct_change)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let gainers: Vec<TickerEntry> = eligible.iter().take(top_n).cloned().collect();
    let losers: Vec<TickerEntry> = eligible.iter().rev().take(top_n).cloned().collect();
    (gainers, losers)
}

/// Conservative precision guess for a symbol with no exchange rule: three
/// significant decimals past the first non-zero one, capped at eight.
fn fallback_rule(entry: f64, min_notional_fallback: f64) -> SymbolRule {
    let formatted = format!("{entry:.15}");
    let price_precision = match formatted.split_once('.') {
        Some((_, frac)) => {
            let first_nonzero = frac.bytes().position(|b| b != b'0');
            match first_nonzero {
                Some(idx) => ((idx + 3) as u32).min(8),
                None => 4,
            }
        }
        None => 0,
    };

    SymbolRule {
        price_precision,
        qty_precision: 0,
        tick_size: (price_precision > 0).then(|| Decimal::new(1, price_precision)),
        step_size: Some(Decimal::ONE),
        min_notional: Decimal::from_f64(min_notional_fallback),
    }
}

/// Turn a sized candidate into exchange-ready numbers, or None when any
/// stage says the trade is not viable. SL rounds away from the entry on
/// the losing side and TP on the winning side, so rounding can only widen
/// the bracket, never cross it.
fn plan_order(
    bracket: &BracketCalculator,
    equity: f64,
    entry_price: f64,
    side: Side,
    atr: f64,
    rule: &SymbolRule,
    min_notional_fallback: f64,
) -> Option<OrderPlan> {
    let notional = bracket.position_size_notional(equity, entry_price, atr);
    if notional <= 0.0 {
        return None;
    }

    let entry_dec = Decimal::from_f64(entry_price)?;
    let notional_dec = Decimal::from_f64(notional)?;
    if entry_dec <= Decimal::ZERO {
        return None;
    }

    let step = rule
        .step_size
        .filter(|s| *s > Decimal::ZERO)
        .unwrap_or_else(|| Decimal::new(1, rule.qty_precision));
    let qty = floor_step(notional_dec / entry_dec, step);
    if qty <= Decimal::ZERO {
        return None;
    }

    let min_notional = rule
        .min_notional
        .filter(|m| *m > Decimal::ZERO)
        .or_else(|| Decimal::from_f64(min_notional_fallback))?;
    if qty * entry_dec < min_notional {
        tracing::info!(
            notional = %(qty * entry_dec),
            min = %min_notional,
            "Order below minimum notional"
        );
        return None;
    }

    let (sl_raw, tp_raw) = bracket.compute_bracket(entry_price, side, atr)?;
    let sl_dec = Decimal::from_f64(sl_raw)?;
    let tp_dec = Decimal::from_f64(tp_raw)?;

    let tick = rule
        .tick_size
        .filter(|t| *t > Decimal::ZERO)
        .unwrap_or_else(|| Decimal::new(1, rule.price_precision));
    let (sl_dir, tp_dir) = match side {
        Side::Long => (TickDirection::Down, TickDirection::Up),
        Side::Short => (TickDirection::Up, TickDirection::Down),
    };
    let sl = round_tick(sl_dec, tick, sl_dir);
    let tp = round_tick(tp_dec, tick, tp_dir);
    let entry_aligned = round_tick(entry_dec, tick, TickDirection::Nearest);

    // Tick alignment can collapse a sub-tick ATR offset onto the entry;
    // the bracket must still strictly straddle the aligned entry
    let ordered = match side {
        Side::Long => sl < entry_aligned && entry_aligned < tp,
        Side::Short => tp < entry_aligned && entry_aligned < sl,
    };
    if !ordered {
        tracing::warn!(
            %sl,
            %entry_aligned,
            %tp,
            "Bracket collapsed by tick alignment, skipping entry"
        );
        return None;
    }

    let plan = OrderPlan {
        quantity: qty.to_f64()?,
        entry: entry_aligned.to_f64()?,
        stop_loss: sl.to_f64()?,
        take_profit: tp.to_f64()?,
    };
    let finite = plan.quantity.is_finite()
        && plan.quantity > 0.0
        && plan.entry.is_finite()
        && plan.stop_loss.is_finite()
        && plan.take_profit.is_finite();
    finite.then_some(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str, pct: f64, vol: f64) -> TickerEntry {
        TickerEntry {
            symbol: symbol.to_string(),
            pct_change: pct,
            last_price: 100.0,
            quote_volume: vol,
        }
    }

    #[test]
    fn test_rank_candidates_orders_and_filters() {
        let tickers = vec![
            ticker("AUSDT", 5.0, 10_000_000.0),
            ticker("BUSDT", 12.0, 10_000_000.0),
            ticker("CUSDT", -8.0, 10_000_000.0),
            ticker("DUSDT", 20.0, 100.0),        // too thin
            ticker("EUSDT", -3.0, 10_000_000.0),
            ticker("FUSDT", f64::NAN, 10_000_000.0),
        ];
        let blacklist = vec!["AUSDT".to_string()];

        let (gainers, losers) = rank_candidates(&tickers, &blacklist, 1_000_000.0, 2);

        let g: Vec<&str> = gainers.iter().map(|t| t.symbol.as_str()).collect();
        let l: Vec<&str> = losers.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(g, ["BUSDT", "EUSDT"]);
        assert_eq!(l, ["CUSDT", "EUSDT"]);
    }

    #[test]
    fn test_fallback_rule_precision_guess() {
        // 0.004567 -> first non-zero decimal at index 2 -> precision 5
        let rule = fallback_rule(0.004567, 5.0);
        assert_eq!(rule.price_precision, 5);
        assert_eq!(rule.tick_size, Some(Decimal::new(1, 5)));
        assert_eq!(rule.step_size, Some(Decimal::ONE));

        // 0.15 -> first non-zero at index 0 -> precision 3
        assert_eq!(fallback_rule(0.15, 5.0).price_precision, 3);

        // Deep fractions are capped
        assert_eq!(fallback_rule(0.000_000_000_9, 5.0).price_precision, 8);
    }

    fn calc() -> BracketCalculator {
        BracketCalculator::new(0.0075, 1.5, 3.0)
    }

    fn rule(tick: Decimal, step: Decimal, min_notional: f64) -> SymbolRule {
        SymbolRule {
            price_precision: 2,
            qty_precision: 3,
            tick_size: Some(tick),
            step_size: Some(step),
            min_notional: Decimal::from_f64(min_notional),
        }
    }

    #[test]
    fn test_plan_order_reference_scenario() {
        // equity 10000, entry 100, atr 2 -> notional 2500, qty 25
        let r = rule(Decimal::new(1, 1), Decimal::new(1, 3), 5.0);
        let plan = plan_order(&calc(), 10_000.0, 100.0, Side::Long, 2.0, &r, 5.0).unwrap();

        assert_eq!(plan.quantity, 25.0);
        assert_eq!(plan.entry, 100.0);
        assert_eq!(plan.stop_loss, 97.0);
        assert_eq!(plan.take_profit, 106.0);
    }

    #[test]
    fn test_plan_order_rounds_away_from_entry() {
        // entry 100.13, atr 2: raw SL 97.13, raw TP 106.13, tick 0.1
        let r = rule(Decimal::new(1, 1), Decimal::new(1, 3), 5.0);
        let plan = plan_order(&calc(), 10_000.0, 100.13, Side::Long, 2.0, &r, 5.0).unwrap();

        assert_eq!(plan.entry, 100.1);
        assert_eq!(plan.stop_loss, 97.1);
        assert_eq!(plan.take_profit, 106.2);
        assert!(plan.stop_loss < plan.entry && plan.entry < plan.take_profit);

        let plan = plan_order(&calc(), 10_000.0, 100.13, Side::Short, 2.0, &r, 5.0).unwrap();
        // Short mirror: SL above rounds up, TP below rounds down
        assert_eq!(plan.stop_loss, 103.2);
        assert_eq!(plan.take_profit, 94.1);
        assert!(plan.take_profit < plan.entry && plan.entry < plan.stop_loss);
    }

    #[test]
    fn test_plan_order_rejects_bracket_collapsed_by_tick() {
        // ATR offset (1.5 * 0.006 = 0.009) is smaller than the 0.1 tick:
        // SL floors onto the same tick the entry rounds to
        let r = rule(Decimal::new(1, 1), Decimal::new(1, 3), 5.0);
        assert!(plan_order(&calc(), 10_000.0, 100.04, Side::Long, 0.006, &r, 5.0).is_none());

        // Short mirror: TP floors onto the aligned entry
        assert!(plan_order(&calc(), 10_000.0, 100.04, Side::Short, 0.006, &r, 5.0).is_none());

        // A wide enough offset on the same tick grid still goes through
        let plan = plan_order(&calc(), 10_000.0, 100.04, Side::Long, 2.0, &r, 5.0).unwrap();
        assert!(plan.stop_loss < plan.entry && plan.entry < plan.take_profit);
    }

    #[test]
    fn test_plan_order_respects_min_notional() {
        let r = rule(Decimal::new(1, 1), Decimal::new(1, 3), 5_000.0);
        // Notional 2500 < 5000 minimum
        assert!(plan_order(&calc(), 10_000.0, 100.0, Side::Long, 2.0, &r, 5.0).is_none());
    }

    #[test]
    fn test_plan_order_zero_qty_after_floor() {
        // Whole-coin step with a notional worth less than one coin
        let r = rule(Decimal::new(1, 1), Decimal::ONE, 5.0);
        assert!(plan_order(&calc(), 10.0, 100.0, Side::Long, 2.0, &r, 5.0).is_none());
    }

    #[test]
    fn test_plan_order_invalid_inputs() {
        let r = rule(Decimal::new(1, 1), Decimal::new(1, 3), 5.0);
        assert!(plan_order(&calc(), 10_000.0, 100.0, Side::Long, 0.0, &r, 5.0).is_none());
        assert!(plan_order(&calc(), 10_000.0, f64::NAN, Side::Long, 2.0, &r, 5.0).is_none());
        assert!(plan_order(&calc(), 0.0, 100.0, Side::Long, 2.0, &r, 5.0).is_none());
    }

    #[test]
    fn test_plan_order_uses_precision_when_rule_lacks_filters() {
        let r = SymbolRule {
            price_precision: 2,
            qty_precision: 1,
            tick_size: None,
            step_size: None,
            min_notional: None,
        };
        let plan = plan_order(&calc(), 10_000.0, 100.13, Side::Long, 2.0, &r, 5.0).unwrap();

        // Derived step 0.1 and tick 0.01; raw quantity is exactly
        // equity * risk / (atr * sl_mult) = 25
        assert_eq!(plan.quantity, 25.0);
        assert_eq!(plan.entry, 100.13);
        assert_eq!(plan.stop_loss, 97.13);
        assert_eq!(plan.take_profit, 106.13);
    }

    // ----- post-close bookkeeping -----

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::gateway::{GatewayError, OrderAck, OrderRequest, OrderStatus};
    use crate::models::{ClosedTrade, ExitReason, KlineWindow, Position};

    struct SilentGateway;

    #[async_trait]
    impl MarketGateway for SilentGateway {
        async fn ticker_snapshot(&self) -> Result<Vec<TickerEntry>, GatewayError> {
            Ok(Vec::new())
        }

        async fn klines(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: u32,
        ) -> Result<KlineWindow, GatewayError> {
            Ok(KlineWindow::default())
        }

        async fn exchange_rules(&self) -> Result<HashMap<String, SymbolRule>, GatewayError> {
            Ok(HashMap::new())
        }

        async fn balance_usdt(&self) -> Result<f64, GatewayError> {
            Ok(0.0)
        }

        async fn best_price(&self, _symbol: &str) -> Result<f64, GatewayError> {
            Err(GatewayError::Transient("offline".into()))
        }

        async fn place_order(&self, _req: &OrderRequest) -> Result<OrderAck, GatewayError> {
            Err(GatewayError::Rejected("offline".into()))
        }

        async fn query_order(
            &self,
            _symbol: &str,
            _order_id: i64,
        ) -> Result<OrderStatus, GatewayError> {
            Err(GatewayError::Transient("offline".into()))
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: i64) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn cancel_all(&self, _symbol: &str) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    /// Holds one open position and settles it on the first bracket poll.
    struct OneCloseExecutor {
        position: Mutex<Option<Position>>,
        pending: Mutex<Option<ClosedTrade>>,
    }

    impl OneCloseExecutor {
        fn new(symbol: &str, realized_pct: f64) -> Self {
            let position = Position {
                symbol: symbol.to_string(),
                side: Side::Long,
                quantity: 1.0,
                entry_price: 100.0,
                stop_loss: 97.0,
                take_profit: 106.0,
                entry_order_id: None,
                tp_order_id: None,
                sl_order_id: None,
            };
            let trade = ClosedTrade {
                symbol: symbol.to_string(),
                side: Side::Long,
                exit_price: 100.0 * (1.0 + realized_pct),
                realized_pct,
                reason: ExitReason::TakeProfit,
            };
            Self {
                position: Mutex::new(Some(position)),
                pending: Mutex::new(Some(trade)),
            }
        }
    }

    #[async_trait]
    impl OrderExecutor for OneCloseExecutor {
        fn open_position(&self) -> Option<Position> {
            self.position.lock().unwrap().clone()
        }

        async fn place_bracket(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: f64,
            _entry: f64,
            _stop_loss: f64,
            _take_profit: f64,
        ) -> anyhow::Result<EntryOutcome> {
            Ok(EntryOutcome::Rejected("not under test".into()))
        }

        async fn poll_and_close_if_hit(&self) -> anyhow::Result<Option<ClosedTrade>> {
            let trade = self.pending.lock().unwrap().take();
            if trade.is_some() {
                *self.position.lock().unwrap() = None;
            }
            Ok(trade)
        }

        async fn force_close(&self, _reason: &str) -> anyhow::Result<Option<ClosedTrade>> {
            Ok(None)
        }
    }

    fn engine_with(executor: Arc<dyn OrderExecutor>) -> Engine {
        let (_tx, rx) = mpsc::channel(4);
        let settings = Settings::default();
        Engine::new(
            settings,
            Arc::new(SilentGateway),
            Arc::new(MarketStream::new(false)),
            executor,
            rx,
            10_000.0,
        )
    }

    #[tokio::test]
    async fn test_close_books_day_cooldown_and_symbol_lock() {
        let executor = Arc::new(OneCloseExecutor::new("BTCUSDT", 0.006));
        let mut engine = engine_with(executor.clone());

        engine.monitor_position().await;

        // The closed trade reaches the daily ledger exactly once
        let state = engine.day.state();
        assert_eq!(state.trades, 1);
        assert!((state.pnl_pct - 0.006).abs() < 1e-12);
        assert!(engine.day.can_trade());

        // Cooldown and per-symbol re-entry lock are armed
        assert!(engine.cooldown_until.expect("cooldown set") > Instant::now());
        assert!(engine.symbol_locked("BTCUSDT"));
        assert!(!engine.symbol_locked("ETHUSDT"));

        // Simulated equity is marked from the ledger
        assert!((engine.equity - 10_060.0).abs() < 1e-6);

        // Flat now; another pass must not double-book
        assert!(!executor.has_open());
        engine.monitor_position().await;
        assert_eq!(engine.day.state().trades, 1);
    }
}
