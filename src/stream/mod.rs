// Streaming market-data cache. One background task per subscription set
// keeps best prices and recent taker trades fresh; the control loop only
// ever does non-blocking reads and must tolerate missing entries.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::models::AggTrade;

const MAINNET_WS: &str = "wss://fstream.binance.com/stream?streams=";
const TESTNET_WS: &str = "wss://stream.binancefuture.com/stream?streams=";

/// Resubscribe only when the symbol set moved by more than this many
/// entries, to avoid churning the connection on every scan
const RELOAD_THRESHOLD: usize = 5;

/// Hard cap per symbol so a burst cannot grow the trade cache unbounded
const TRADE_CACHE_MAX: usize = 2048;
/// Writer-side retention; readers apply their own (shorter) window
const TRADE_RETENTION_MS: i64 = 120_000;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Default)]
struct StreamCaches {
    prices: RwLock<HashMap<String, f64>>,
    trades: RwLock<HashMap<String, VecDeque<AggTrade>>>,
}

struct Generation {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owned, injectable market stream with explicit lifecycle. Reads are
/// cheap and lock-free of the network; staleness is acceptable, blocking
/// is not.
pub struct MarketStream {
    caches: Arc<StreamCaches>,
    ws_base: String,
    current: tokio::sync::Mutex<Option<Generation>>,
    subscribed: std::sync::Mutex<HashSet<String>>,
}

impl MarketStream {
    pub fn new(testnet: bool) -> Self {
        let ws_base = if testnet { TESTNET_WS } else { MAINNET_WS };
        Self {
            caches: Arc::new(StreamCaches::default()),
            ws_base: ws_base.to_string(),
            current: tokio::sync::Mutex::new(None),
            subscribed: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Latest streamed price, or None if the symbol has not ticked yet
    pub fn best_price(&self, symbol: &str) -> Option<f64> {
        self.caches
            .prices
            .read()
            .ok()?
            .get(symbol)
            .copied()
            .filter(|p| p.is_finite() && *p > 0.0)
    }

    /// Trades within the last `window_s` seconds. Entries older than the
    /// window are dropped lazily here, not in the writer path.
    pub fn recent_trades(&self, symbol: &str, window_s: u64) -> Vec<AggTrade> {
        let cutoff = Utc::now().timestamp_millis() - window_s as i64 * 1000;
        match self.caches.trades.read() {
            Ok(map) => map
                .get(symbol)
                .map(|dq| dq.iter().filter(|t| t.ts_ms >= cutoff).copied().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Writer path for the socket task; also used directly by tests and
    /// the simulated executor.
    pub fn record_price(&self, symbol: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        if let Ok(mut map) = self.caches.prices.write() {
            map.insert(symbol.to_string(), price);
        }
    }

    pub fn record_trade(&self, symbol: &str, trade: AggTrade) {
        if let Ok(mut map) = self.caches.trades.write() {
            let dq = map.entry(symbol.to_string()).or_default();
            dq.push_back(trade);

            let retention_cutoff = trade.ts_ms - TRADE_RETENTION_MS;
            while let Some(front) = dq.front() {
                if dq.len() > TRADE_CACHE_MAX || front.ts_ms < retention_cutoff {
                    dq.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Start or update the subscription set. The connection is only
    /// restarted on the first subscribe or when the set moved past the
    /// reload threshold.
    pub async fn ensure_subscribed(&self, symbols: &HashSet<String>) {
        if symbols.is_empty() {
            return;
        }

        let restart = {
            let mut current = self.subscribed.lock().unwrap_or_else(|e| e.into_inner());
            if needs_restart(&current, symbols) {
                *current = symbols.clone();
                true
            } else {
                false
            }
        };
        if !restart {
            return;
        }

        let mut sorted: Vec<&String> = symbols.iter().collect();
        sorted.sort();
        let streams: Vec<String> = sorted
            .iter()
            .flat_map(|s| {
                let lower = s.to_lowercase();
                [format!("{lower}@ticker"), format!("{lower}@aggTrade")]
            })
            .collect();
        let url = format!("{}{}", self.ws_base, streams.join("/"));

        tracing::info!(symbols = symbols.len(), "Restarting market stream");
        self.stop_task().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let caches = self.caches.clone();
        let handle = tokio::spawn(async move {
            run_connection(url, caches, stop_rx).await;
        });

        let mut current = self.current.lock().await;
        *current = Some(Generation { stop_tx, handle });
    }

    async fn stop_task(&self) {
        let gen = self.current.lock().await.take();
        if let Some(gen) = gen {
            let _ = gen.stop_tx.send(true);
            let _ = gen.handle.await;
        }
    }

    /// Cooperative shutdown: halt the reconnect loop and clear both caches
    pub async fn stop(&self) {
        self.stop_task().await;
        if let Ok(mut map) = self.caches.prices.write() {
            map.clear();
        }
        if let Ok(mut map) = self.caches.trades.write() {
            map.clear();
        }
        if let Ok(mut set) = self.subscribed.lock() {
            set.clear();
        }
    }
}

fn needs_restart(current: &HashSet<String>, next: &HashSet<String>) -> bool {
    if current.is_empty() {
        return true;
    }
    let changed = current.symmetric_difference(next).count();
    changed > RELOAD_THRESHOLD
}

async fn run_connection(
    url: String,
    caches: Arc<StreamCaches>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            return;
        }

        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                tracing::debug!("Market stream connected");
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                        msg = ws.next() => match msg {
                            Some(Ok(Message::Text(txt))) => handle_message(&caches, &txt),
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("Market stream error: {e}");
                                break;
                            }
                            None => {
                                tracing::warn!("Market stream closed by peer");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("Market stream connect failed: {e}"),
        }

        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }
}

fn handle_message(caches: &StreamCaches, raw: &str) {
    let parsed: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return,
    };
    // Multiplexed streams wrap the payload in a "data" field
    let data = parsed.get("data").unwrap_or(&parsed);

    let symbol = match data.get("s").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return,
    };

    match data.get("e").and_then(|v| v.as_str()) {
        Some("aggTrade") => {
            let price = data.get("p").and_then(str_as_f64);
            let qty = data.get("q").and_then(str_as_f64);
            let ts = data.get("T").and_then(|v| v.as_i64());
            // "m" is buyer-is-maker: the taker bought when it is false
            let maker = data.get("m").and_then(|v| v.as_bool());

            if let (Some(price), Some(qty), Some(ts_ms), Some(maker)) = (price, qty, ts, maker) {
                record_trade_into(caches, symbol, AggTrade {
                    ts_ms,
                    price,
                    qty,
                    is_taker_buy: !maker,
                });
            }
        }
        _ => {
            // 24h ticker carries the last price in "c"
            if let Some(price) = data.get("c").and_then(str_as_f64) {
                if price.is_finite() && price > 0.0 {
                    if let Ok(mut map) = caches.prices.write() {
                        map.insert(symbol.to_string(), price);
                    }
                }
            }
        }
    }
}

fn record_trade_into(caches: &StreamCaches, symbol: &str, trade: AggTrade) {
    if let Ok(mut map) = caches.trades.write() {
        let dq = map.entry(symbol.to_string()).or_default();
        dq.push_back(trade);
        let retention_cutoff = trade.ts_ms - TRADE_RETENTION_MS;
        while let Some(front) = dq.front() {
            if dq.len() > TRADE_CACHE_MAX || front.ts_ms < retention_cutoff {
                dq.pop_front();
            } else {
                break;
            }
        }
    }
}

fn str_as_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
