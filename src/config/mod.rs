// Runtime settings. Everything has a default; the environment (with a
// `BOT_` prefix, optionally via .env) overrides field by field. Loaded
// once at startup and passed around immutably.
use config::{Config, Environment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Place real orders instead of simulating fills
    #[serde(default)]
    pub live_trading: bool,
    /// Use the futures testnet hosts in live mode
    #[serde(default = "default_true")]
    pub testnet: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Starting equity in simulation, USDT
    #[serde(default = "default_start_equity")]
    pub start_equity: f64,

    // Daily risk frame
    #[serde(default = "default_daily_target_pct")]
    pub daily_target_pct: f64,
    #[serde(default = "default_daily_loss_cap_pct")]
    pub daily_loss_cap_pct: f64,
    #[serde(default = "default_per_trade_risk")]
    pub per_trade_risk: f64,
    #[serde(default = "default_sl_atr_mult")]
    pub sl_atr_mult: f64,
    #[serde(default = "default_tp_atr_mult")]
    pub tp_atr_mult: f64,

    // Candidate scan
    #[serde(default = "default_scan_interval_s")]
    pub scan_interval_s: u64,
    #[serde(default = "default_scan_top_n")]
    pub scan_top_n: usize,
    #[serde(default)]
    pub allow_short: bool,
    #[serde(default = "default_min_quote_volume")]
    pub min_quote_volume: f64,
    /// Symbols never traded, comma-separated in the environment
    #[serde(default)]
    pub symbol_blacklist: Vec<String>,

    // Breakout signal
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
    #[serde(default = "default_kline_limit")]
    pub kline_limit: u32,
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_overextension_cap")]
    pub overextension_cap: f64,
    #[serde(default = "default_vol_base_window")]
    pub vol_base_window: usize,
    #[serde(default = "default_vol_spike_mult")]
    pub vol_spike_mult: f64,
    #[serde(default = "default_vol_confirm_bars")]
    pub vol_confirm_bars: usize,
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    // Order flow
    #[serde(default = "default_flow_merge_window_s")]
    pub flow_merge_window_s: u64,
    #[serde(default = "default_flow_percentile")]
    pub flow_buy_percentile: f64,
    #[serde(default = "default_flow_percentile")]
    pub flow_sell_percentile: f64,
    #[serde(default = "default_flow_anchor_drift")]
    pub flow_anchor_drift: f64,
    /// Opposing-flow percentile rank that force-closes an open position
    #[serde(default = "default_flow_early_exit_pct")]
    pub flow_early_exit_pct: f64,

    // Lifecycle timing
    #[serde(default = "default_order_timeout_s")]
    pub order_timeout_s: u64,
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: u64,
    #[serde(default = "default_reentry_block_s")]
    pub reentry_block_s: u64,

    /// Minimum order notional when the exchange rule is unavailable
    #[serde(default = "default_min_notional_fallback")]
    pub min_notional_fallback: f64,
}

fn default_true() -> bool {
    true
}
fn default_start_equity() -> f64 {
    10_000.0
}
fn default_daily_target_pct() -> f64 {
    0.015
}
fn default_daily_loss_cap_pct() -> f64 {
    -0.02
}
fn default_per_trade_risk() -> f64 {
    0.0075
}
fn default_sl_atr_mult() -> f64 {
    1.5
}
fn default_tp_atr_mult() -> f64 {
    3.0
}
fn default_scan_interval_s() -> u64 {
    25
}
fn default_scan_top_n() -> usize {
    10
}
fn default_min_quote_volume() -> f64 {
    5_000_000.0
}
fn default_kline_interval() -> String {
    "5m".to_string()
}
fn default_kline_limit() -> u32 {
    120
}
fn default_lookback() -> usize {
    96
}
fn default_overextension_cap() -> f64 {
    0.02
}
fn default_vol_base_window() -> usize {
    48
}
fn default_vol_spike_mult() -> f64 {
    2.0
}
fn default_vol_confirm_bars() -> usize {
    3
}
fn default_ema_fast() -> usize {
    20
}
fn default_ema_slow() -> usize {
    50
}
fn default_atr_period() -> usize {
    14
}
fn default_flow_merge_window_s() -> u64 {
    10
}
fn default_flow_percentile() -> f64 {
    90.0
}
fn default_flow_anchor_drift() -> f64 {
    0.003
}
fn default_flow_early_exit_pct() -> f64 {
    90.0
}
fn default_order_timeout_s() -> u64 {
    90
}
fn default_cooldown_s() -> u64 {
    3
}
fn default_reentry_block_s() -> u64 {
    45
}
fn default_min_notional_fallback() -> f64 {
    5.0
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            live_trading: false,
            testnet: default_true(),
            api_key: String::new(),
            api_secret: String::new(),
            start_equity: default_start_equity(),
            daily_target_pct: default_daily_target_pct(),
            daily_loss_cap_pct: default_daily_loss_cap_pct(),
            per_trade_risk: default_per_trade_risk(),
            sl_atr_mult: default_sl_atr_mult(),
            tp_atr_mult: default_tp_atr_mult(),
            scan_interval_s: default_scan_interval_s(),
            scan_top_n: default_scan_top_n(),
            allow_short: false,
            min_quote_volume: default_min_quote_volume(),
            symbol_blacklist: Vec::new(),
            kline_interval: default_kline_interval(),
            kline_limit: default_kline_limit(),
            lookback: default_lookback(),
            overextension_cap: default_overextension_cap(),
            vol_base_window: default_vol_base_window(),
            vol_spike_mult: default_vol_spike_mult(),
            vol_confirm_bars: default_vol_confirm_bars(),
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            atr_period: default_atr_period(),
            flow_merge_window_s: default_flow_merge_window_s(),
            flow_buy_percentile: default_flow_percentile(),
            flow_sell_percentile: default_flow_percentile(),
            flow_anchor_drift: default_flow_anchor_drift(),
            flow_early_exit_pct: default_flow_early_exit_pct(),
            order_timeout_s: default_order_timeout_s(),
            cooldown_s: default_cooldown_s(),
            reentry_block_s: default_reentry_block_s(),
            min_notional_fallback: default_min_notional_fallback(),
        }
    }
}

impl Settings {
    /// Environment variables win over defaults: `BOT_DAILY_TARGET_PCT`,
    /// `BOT_LIVE_TRADING`, `BOT_SYMBOL_BLACKLIST=AUSDT,BUSDT`, ...
    pub fn load() -> anyhow::Result<Self> {
        let cfg = Config::builder()
            .add_source(
                Environment::with_prefix("BOT")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("symbol_blacklist"),
            )
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.daily_target_pct > 0.0,
            "daily_target_pct must be positive"
        );
        anyhow::ensure!(
            self.daily_loss_cap_pct < 0.0,
            "daily_loss_cap_pct must be negative"
        );
        anyhow::ensure!(
            self.per_trade_risk > 0.0 && self.per_trade_risk < 1.0,
            "per_trade_risk must be a fraction in (0, 1)"
        );
        anyhow::ensure!(
            self.sl_atr_mult > 0.0 && self.tp_atr_mult > 0.0,
            "ATR multipliers must be positive"
        );
        anyhow::ensure!(self.scan_top_n > 0, "scan_top_n must be at least 1");
        if self.live_trading {
            anyhow::ensure!(
                !self.api_key.is_empty() && !self.api_secret.is_empty(),
                "live trading requires api_key and api_secret"
            );
        }
        Ok(())
    }
}
