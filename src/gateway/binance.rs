use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio::time::{sleep, Duration};

use super::{
    GatewayError, MarketGateway, OrderAck, OrderRequest, OrderState, OrderStatus, OrderType,
};
use crate::models::{KlineWindow, SymbolRule, TickerEntry};

const MAINNET_HOSTS: &[&str] = &[
    "https://fapi.binance.com",
    "https://fapi1.binance.com",
    "https://fapi2.binance.com",
];
const TESTNET_HOSTS: &[&str] = &["https://testnet.binancefuture.com"];

const MAX_TRIES: u32 = 3;
const BACKOFF_MS: u64 = 300;

/// How long a server-time offset stays fresh before the next signed
/// request re-syncs it
const TIME_SYNC_INTERVAL_MS: i64 = 1_800_000;

/// Symbols excluded from the ticker snapshot: leveraged tokens and quote
/// assets the strategy does not trade
const EXCLUDE_KEYWORDS: &[&str] = &["UPUSDT", "DOWNUSDT", "BULLUSDT", "BEARUSDT", "BUSD"];

type HmacSha256 = Hmac<Sha256>;

/// Binance USDT-M futures REST gateway with multi-host rotation and
/// backoff on transient failures.
pub struct BinanceFuturesGateway {
    client: Client,
    hosts: Vec<String>,
    api_key: String,
    api_secret: String,
    /// Server clock minus local clock, in milliseconds. Signed request
    /// timestamps carry this so a drifted local clock stays inside the
    /// exchange's recvWindow.
    time_offset_ms: AtomicI64,
    last_time_sync_ms: AtomicI64,
}

impl BinanceFuturesGateway {
    pub fn new(testnet: bool, api_key: String, api_secret: String) -> Self {
        let hosts = if testnet { TESTNET_HOSTS } else { MAINNET_HOSTS };
        Self::with_hosts(
            hosts.iter().map(|h| h.to_string()).collect(),
            api_key,
            api_secret,
        )
    }

    /// Explicit host list, used by tests to point at a local server
    pub fn with_hosts(hosts: Vec<String>, api_key: String, api_secret: String) -> Self {
        Self {
            client: Client::new(),
            hosts,
            api_key,
            api_secret,
            time_offset_ms: AtomicI64::new(0),
            last_time_sync_ms: AtomicI64::new(0),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Local time adjusted by the last known server offset, re-syncing
    /// first when the offset has gone stale. A failed sync keeps the
    /// previous offset.
    async fn timestamp_ms(&self) -> i64 {
        let now = Self::now_ms();
        let last = self.last_time_sync_ms.load(Ordering::Relaxed);
        if now - last >= TIME_SYNC_INTERVAL_MS {
            // Stamp before the fetch so a failing endpoint is not hit on
            // every signed request
            self.last_time_sync_ms.store(now, Ordering::Relaxed);
            self.sync_server_time().await;
        }
        Self::now_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    async fn sync_server_time(&self) {
        match self.get_json("/fapi/v1/time", &[]).await {
            Ok(v) => {
                if let Some(server_ms) = v.get("serverTime").and_then(Value::as_i64) {
                    let offset = server_ms - Self::now_ms();
                    self.time_offset_ms.store(offset, Ordering::Relaxed);
                    tracing::debug!(offset_ms = offset, "Server time offset synced");
                } else {
                    tracing::warn!("Server time response missing serverTime field");
                }
            }
            Err(e) => tracing::warn!("Server time sync failed, keeping previous offset: {e}"),
        }
    }

    fn sign(&self, query: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| GatewayError::Rejected(format!("bad API secret: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> GatewayError {
        if status.as_u16() == 429 || status.as_u16() == 418 {
            GatewayError::Transient(format!("rate limited ({status})"))
        } else if status.is_server_error() {
            GatewayError::Transient(format!("server error {status}: {body}"))
        } else {
            GatewayError::Rejected(format!("{status}: {body}"))
        }
    }

    /// GET a public endpoint, rotating across hosts with backoff between
    /// rounds. Permanent rejections abort immediately.
    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, GatewayError> {
        let mut last_err = GatewayError::Transient("no hosts configured".to_string());

        for round in 0..MAX_TRIES {
            for host in &self.hosts {
                let url = format!("{host}{path}");
                let result = self.client.get(&url).query(params).send().await;

                match result {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return resp
                                .json::<Value>()
                                .await
                                .map_err(|e| GatewayError::Parse(e.to_string()));
                        }
                        let body = resp.text().await.unwrap_or_default();
                        let err = Self::classify_status(status, &body);
                        if !err.is_transient() {
                            return Err(err);
                        }
                        last_err = err;
                    }
                    Err(e) => last_err = GatewayError::Transient(e.to_string()),
                }
            }
            if round + 1 < MAX_TRIES {
                sleep(Duration::from_millis(BACKOFF_MS * (round as u64 + 1))).await;
            }
        }

        Err(last_err)
    }

    /// Send a signed request (order placement, balance). Signed calls are
    /// not rotated across hosts: replaying an order against a second host
    /// could double-submit it.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let host = self
            .hosts
            .first()
            .ok_or_else(|| GatewayError::Transient("no hosts configured".to_string()))?;

        let mut query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        query.push(format!("timestamp={}", self.timestamp_ms().await));
        let query = query.join("&");
        let signature = self.sign(&query)?;
        let url = format!("{host}{path}?{query}&signature={signature}");

        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

fn f64_field(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn decimal_field(v: &Value, key: &str) -> Option<Decimal> {
    str_field(v, key).and_then(|s| Decimal::from_str(s).ok())
}

fn parse_order_state(status: &str) -> OrderState {
    match status {
        "NEW" => OrderState::New,
        "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
        "FILLED" => OrderState::Filled,
        "CANCELED" => OrderState::Canceled,
        "REJECTED" => OrderState::Rejected,
        _ => OrderState::Expired,
    }
}

fn is_excluded_symbol(symbol: &str) -> bool {
    !symbol.ends_with("USDT") || EXCLUDE_KEYWORDS.iter().any(|k| symbol.contains(k))
}

#[async_trait]
impl MarketGateway for BinanceFuturesGateway {
    async fn ticker_snapshot(&self) -> Result<Vec<TickerEntry>, GatewayError> {
        let rows = self.get_json("/fapi/v1/ticker/24hr", &[]).await?;
        let rows = rows
            .as_array()
            .ok_or_else(|| GatewayError::Parse("ticker snapshot is not an array".to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            let symbol = match str_field(row, "symbol") {
                Some(s) if !is_excluded_symbol(s) => s.to_string(),
                _ => continue,
            };
            let (pct_change, last_price, quote_volume) = match (
                f64_field(row, "priceChangePercent"),
                f64_field(row, "lastPrice"),
                f64_field(row, "quoteVolume"),
            ) {
                (Some(p), Some(l), Some(q)) => (p, l, q),
                _ => continue,
            };
            if last_price <= 0.0 || quote_volume <= 0.0 {
                continue;
            }
            entries.push(TickerEntry {
                symbol,
                pct_change,
                last_price,
                quote_volume,
            });
        }
        Ok(entries)
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<KlineWindow, GatewayError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let rows = self.get_json("/fapi/v1/klines", &params).await?;
        let rows = rows
            .as_array()
            .ok_or_else(|| GatewayError::Parse("klines response is not an array".to_string()))?;

        let mut window = KlineWindow::default();
        for row in rows {
            let bar = row
                .as_array()
                .ok_or_else(|| GatewayError::Parse("kline bar is not an array".to_string()))?;
            let field = |idx: usize| -> Result<f64, GatewayError> {
                bar.get(idx)
                    .and_then(|v| match v {
                        Value::String(s) => s.parse().ok(),
                        Value::Number(n) => n.as_f64(),
                        _ => None,
                    })
                    .ok_or_else(|| GatewayError::Parse(format!("bad kline field {idx}")))
            };
            window.highs.push(field(2)?);
            window.lows.push(field(3)?);
            window.closes.push(field(4)?);
            window.volumes.push(field(5)?);
        }
        Ok(window)
    }

    async fn exchange_rules(&self) -> Result<HashMap<String, SymbolRule>, GatewayError> {
        let info = self.get_json("/fapi/v1/exchangeInfo", &[]).await?;
        let symbols = info
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::Parse("exchangeInfo missing symbols".to_string()))?;

        let mut rules = HashMap::new();
        for s in symbols {
            if str_field(s, "contractType") != Some("PERPETUAL")
                || str_field(s, "status") != Some("TRADING")
            {
                continue;
            }
            let symbol = match str_field(s, "symbol") {
                Some(sym) => sym.to_string(),
                None => continue,
            };

            let mut rule = SymbolRule {
                price_precision: s.get("pricePrecision").and_then(Value::as_u64).unwrap_or(8)
                    as u32,
                qty_precision: s
                    .get("quantityPrecision")
                    .and_then(Value::as_u64)
                    .unwrap_or(8) as u32,
                ..SymbolRule::default()
            };

            if let Some(filters) = s.get("filters").and_then(Value::as_array) {
                for f in filters {
                    match str_field(f, "filterType") {
                        Some("PRICE_FILTER") => rule.tick_size = decimal_field(f, "tickSize"),
                        Some("LOT_SIZE") => rule.step_size = decimal_field(f, "stepSize"),
                        Some("MIN_NOTIONAL") => {
                            rule.min_notional = decimal_field(f, "notional")
                        }
                        _ => {}
                    }
                }
            }
            rules.insert(symbol, rule);
        }
        Ok(rules)
    }

    async fn balance_usdt(&self) -> Result<f64, GatewayError> {
        let rows = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/balance", &[])
            .await?;
        let rows = rows
            .as_array()
            .ok_or_else(|| GatewayError::Parse("balance response is not an array".to_string()))?;

        rows.iter()
            .find(|r| str_field(r, "asset") == Some("USDT"))
            .and_then(|r| f64_field(r, "availableBalance"))
            .ok_or_else(|| GatewayError::Parse("no USDT balance in response".to_string()))
    }

    async fn best_price(&self, symbol: &str) -> Result<f64, GatewayError> {
        let params = [("symbol", symbol.to_string())];
        let v = self.get_json("/fapi/v1/ticker/price", &params).await?;
        f64_field(&v, "price")
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| GatewayError::Parse("missing price field".to_string()))
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", req.symbol.clone()),
            ("side", req.side.as_str().to_string()),
        ];

        match &req.order_type {
            OrderType::Limit { price } => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", price.to_string()));
            }
            OrderType::Market => params.push(("type", "MARKET".to_string())),
            OrderType::TakeProfitMarket { stop_price } => {
                params.push(("type", "TAKE_PROFIT_MARKET".to_string()));
                params.push(("stopPrice", stop_price.to_string()));
            }
            OrderType::StopMarket { stop_price } => {
                params.push(("type", "STOP_MARKET".to_string()));
                params.push(("stopPrice", stop_price.to_string()));
            }
        }

        if let Some(qty) = req.quantity {
            params.push(("quantity", qty.to_string()));
        }
        if req.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if req.close_position {
            params.push(("closePosition", "true".to_string()));
        }
        if let Some(id) = &req.client_order_id {
            params.push(("newClientOrderId", id.clone()));
        }

        let v = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        let order_id = v
            .get("orderId")
            .and_then(Value::as_i64)
            .ok_or_else(|| GatewayError::Parse("order ack missing orderId".to_string()))?;
        Ok(OrderAck { order_id })
    }

    async fn query_order(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<OrderStatus, GatewayError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let v = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/order", &params)
            .await?;

        let state = str_field(&v, "status")
            .map(parse_order_state)
            .ok_or_else(|| GatewayError::Parse("order missing status".to_string()))?;
        let avg_price = f64_field(&v, "avgPrice").filter(|p| *p > 0.0);
        let executed_qty = f64_field(&v, "executedQty").unwrap_or(0.0);

        Ok(OrderStatus {
            state,
            avg_price,
            executed_qty,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), GatewayError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str) -> Result<(), GatewayError> {
        let params = [("symbol", symbol.to_string())];
        self.signed_request(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await?;
        Ok(())
    }
}
