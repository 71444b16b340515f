// Narrow REST interface to the exchange. Everything above this layer sees
// either a successful result or a classified failure; retries/backoff and
// host rotation stay inside the implementation.
pub mod binance;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{KlineWindow, SymbolRule, TickerEntry};

/// Gateway failure taxonomy. Callers branch on `is_transient` to decide
/// retry vs. abort; everything else is carried for logging.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network failure, 5xx, or rate limiting that survived the retries
    #[error("transient gateway failure: {0}")]
    Transient(String),
    /// The exchange understood the request and refused it
    #[error("rejected by exchange: {0}")]
    Rejected(String),
    /// Response did not have the expected shape
    #[error("malformed response: {0}")]
    Parse(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderType {
    /// GTC limit order at the given price
    Limit { price: f64 },
    Market,
    /// Conditional market order triggered at the stop price
    TakeProfitMarket { stop_price: f64 },
    StopMarket { stop_price: f64 },
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// None for close-position conditional orders
    pub quantity: Option<f64>,
    pub reduce_only: bool,
    /// Close the entire position when triggered (bracket legs)
    pub close_position: bool,
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct OrderAck {
    pub order_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy)]
pub struct OrderStatus {
    pub state: OrderState,
    pub avg_price: Option<f64>,
    pub executed_qty: f64,
}

/// The narrow market/order interface the engine and executors depend on.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    async fn ticker_snapshot(&self) -> Result<Vec<TickerEntry>, GatewayError>;

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<KlineWindow, GatewayError>;

    async fn exchange_rules(&self) -> Result<HashMap<String, SymbolRule>, GatewayError>;

    async fn balance_usdt(&self) -> Result<f64, GatewayError>;

    async fn best_price(&self, symbol: &str) -> Result<f64, GatewayError>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn query_order(&self, symbol: &str, order_id: i64)
        -> Result<OrderStatus, GatewayError>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), GatewayError>;

    async fn cancel_all(&self, symbol: &str) -> Result<(), GatewayError>;
}

pub use binance::BinanceFuturesGateway;
