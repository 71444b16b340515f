// Live executor: GTC limit entry, then two close-position conditional
// orders as the protective bracket. Every path out of `place_bracket`
// other than `Filled` leaves the account flat with no resting orders.
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

use crate::gateway::{MarketGateway, OrderRequest, OrderSide, OrderState, OrderType};
use crate::models::{ClosedTrade, ExitReason, Position, Side};

use super::{EntryOutcome, OrderExecutor};

const DEFAULT_ENTRY_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct LiveExecutor {
    gateway: Arc<dyn MarketGateway>,
    position: Mutex<Option<Position>>,
    entry_timeout: Duration,
    poll_interval: Duration,
}

impl LiveExecutor {
    pub fn new(gateway: Arc<dyn MarketGateway>) -> Self {
        Self::with_timing(gateway, DEFAULT_ENTRY_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_timing(
        gateway: Arc<dyn MarketGateway>,
        entry_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gateway,
            position: Mutex::new(None),
            entry_timeout,
            poll_interval,
        }
    }

    fn set_position(&self, pos: Option<Position>) {
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = pos;
    }

    fn client_id() -> String {
        format!("gb-{}", Uuid::new_v4().simple())
    }

    fn entry_side(side: Side) -> OrderSide {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    fn exit_side(side: Side) -> OrderSide {
        match side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// Wait for the entry order to fill. Ok(Some(price)) on fill,
    /// Ok(None) on timeout, Err when the exchange killed the order.
    async fn await_entry_fill(
        &self,
        symbol: &str,
        order_id: i64,
        limit_price: f64,
    ) -> anyhow::Result<Option<f64>> {
        let deadline = Instant::now() + self.entry_timeout;
        loop {
            sleep(self.poll_interval).await;

            match self.gateway.query_order(symbol, order_id).await {
                Ok(status) => match status.state {
                    OrderState::Filled => {
                        let price = status
                            .avg_price
                            .filter(|p| p.is_finite() && *p > 0.0)
                            .unwrap_or(limit_price);
                        return Ok(Some(price));
                    }
                    OrderState::Canceled | OrderState::Rejected | OrderState::Expired => {
                        anyhow::bail!("entry order {order_id} ended as {:?}", status.state);
                    }
                    OrderState::New | OrderState::PartiallyFilled => {}
                },
                Err(e) => tracing::warn!(symbol, order_id, "Entry poll failed: {e}"),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Place one close-position conditional leg and return its order id
    async fn place_protective_leg(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
    ) -> anyhow::Result<i64> {
        let ack = self
            .gateway
            .place_order(&OrderRequest {
                symbol: symbol.to_string(),
                side: Self::exit_side(side),
                order_type,
                quantity: None,
                reduce_only: false,
                close_position: true,
                client_order_id: Some(Self::client_id()),
            })
            .await?;
        Ok(ack.order_id)
    }

    /// Flatten after a partial setup failed: drop all resting orders and
    /// market out of whatever filled.
    async fn emergency_flatten(&self, symbol: &str, side: Side, quantity: f64) {
        if let Err(e) = self.gateway.cancel_all(symbol).await {
            tracing::warn!(symbol, "Emergency cancel-all failed: {e}");
        }
        let close = OrderRequest {
            symbol: symbol.to_string(),
            side: Self::exit_side(side),
            order_type: OrderType::Market,
            quantity: Some(quantity),
            reduce_only: true,
            close_position: false,
            client_order_id: Some(Self::client_id()),
        };
        if let Err(e) = self.gateway.place_order(&close).await {
            tracing::error!(symbol, "Emergency market close failed, manual action needed: {e}");
        }
    }

    fn realized(pos: &Position, exit_price: f64) -> f64 {
        (exit_price - pos.entry_price) / pos.entry_price * pos.side.pnl_sign()
    }

    /// One bracket leg filled: settle against it and drop the sibling
    async fn settle_leg(
        &self,
        pos: &Position,
        filled_avg: Option<f64>,
        level: f64,
        sibling_id: Option<i64>,
        reason: ExitReason,
    ) -> ClosedTrade {
        if let Some(id) = sibling_id {
            if let Err(e) = self.gateway.cancel_order(&pos.symbol, id).await {
                tracing::warn!(symbol = %pos.symbol, order_id = id, "Sibling cancel failed: {e}");
            }
        }

        let exit_price = filled_avg.filter(|p| p.is_finite() && *p > 0.0).unwrap_or(level);
        let realized_pct = Self::realized(pos, exit_price);
        tracing::info!(
            symbol = %pos.symbol,
            side = %pos.side,
            exit_price,
            realized_pct = format!("{:+.4}%", realized_pct * 100.0),
            reason = ?reason,
            "Position closed"
        );

        self.set_position(None);
        ClosedTrade {
            symbol: pos.symbol.clone(),
            side: pos.side,
            exit_price,
            realized_pct,
            reason,
        }
    }
}

#[async_trait]
impl OrderExecutor for LiveExecutor {
    fn open_position(&self) -> Option<Position> {
        self.position.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn place_bracket(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> anyhow::Result<EntryOutcome> {
        if self.has_open() {
            anyhow::bail!("a position is already open");
        }

        let ack = self
            .gateway
            .place_order(&OrderRequest {
                symbol: symbol.to_string(),
                side: Self::entry_side(side),
                order_type: OrderType::Limit { price: entry },
                quantity: Some(quantity),
                reduce_only: false,
                close_position: false,
                client_order_id: Some(Self::client_id()),
            })
            .await?;
        tracing::info!(symbol, side = %side, quantity, entry, order_id = ack.order_id, "Entry submitted");

        let fill_price = match self.await_entry_fill(symbol, ack.order_id, entry).await {
            Ok(Some(price)) => price,
            Ok(None) => {
                tracing::warn!(symbol, order_id = ack.order_id, "Entry timed out, canceling");
                if let Err(e) = self.gateway.cancel_order(symbol, ack.order_id).await {
                    tracing::warn!(symbol, order_id = ack.order_id, "Entry cancel failed: {e}");
                }
                return Ok(EntryOutcome::TimedOut);
            }
            Err(e) => return Ok(EntryOutcome::Rejected(e.to_string())),
        };

        let tp_id = match self
            .place_protective_leg(symbol, side, OrderType::TakeProfitMarket { stop_price: take_profit })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(symbol, "Take-profit leg failed, flattening: {e}");
                self.emergency_flatten(symbol, side, quantity).await;
                return Ok(EntryOutcome::Rejected(format!("take-profit leg: {e}")));
            }
        };
        let sl_id = match self
            .place_protective_leg(symbol, side, OrderType::StopMarket { stop_price: stop_loss })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(symbol, "Stop-loss leg failed, flattening: {e}");
                self.emergency_flatten(symbol, side, quantity).await;
                return Ok(EntryOutcome::Rejected(format!("stop-loss leg: {e}")));
            }
        };

        tracing::info!(symbol, fill_price, tp_id, sl_id, "Bracket armed");
        self.set_position(Some(Position {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: fill_price,
            stop_loss,
            take_profit,
            entry_order_id: Some(ack.order_id),
            tp_order_id: Some(tp_id),
            sl_order_id: Some(sl_id),
        }));
        Ok(EntryOutcome::Filled)
    }

    async fn poll_and_close_if_hit(&self) -> anyhow::Result<Option<ClosedTrade>> {
        let pos = match self.open_position() {
            Some(p) => p,
            None => return Ok(None),
        };

        if let Some(tp_id) = pos.tp_order_id {
            match self.gateway.query_order(&pos.symbol, tp_id).await {
                Ok(status) if status.state == OrderState::Filled => {
                    let trade = self
                        .settle_leg(
                            &pos,
                            status.avg_price,
                            pos.take_profit,
                            pos.sl_order_id,
                            ExitReason::TakeProfit,
                        )
                        .await;
                    return Ok(Some(trade));
                }
                Ok(status)
                    if matches!(
                        status.state,
                        OrderState::Canceled | OrderState::Rejected | OrderState::Expired
                    ) =>
                {
                    tracing::warn!(symbol = %pos.symbol, order_id = tp_id, state = ?status.state, "Take-profit leg gone");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(symbol = %pos.symbol, "Take-profit poll failed: {e}"),
            }
        }

        if let Some(sl_id) = pos.sl_order_id {
            match self.gateway.query_order(&pos.symbol, sl_id).await {
                Ok(status) if status.state == OrderState::Filled => {
                    let trade = self
                        .settle_leg(
                            &pos,
                            status.avg_price,
                            pos.stop_loss,
                            pos.tp_order_id,
                            ExitReason::StopLoss,
                        )
                        .await;
                    return Ok(Some(trade));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(symbol = %pos.symbol, "Stop-loss poll failed: {e}"),
            }
        }

        Ok(None)
    }

    async fn force_close(&self, reason: &str) -> anyhow::Result<Option<ClosedTrade>> {
        let pos = match self.open_position() {
            Some(p) => p,
            None => return Ok(None),
        };

        let exit_price = self.gateway.best_price(&pos.symbol).await?;

        if let Err(e) = self.gateway.cancel_all(&pos.symbol).await {
            tracing::warn!(symbol = %pos.symbol, "Cancel-all before force close failed: {e}");
        }

        // A failed market close keeps the position so the caller can retry
        self.gateway
            .place_order(&OrderRequest {
                symbol: pos.symbol.clone(),
                side: Self::exit_side(pos.side),
                order_type: OrderType::Market,
                quantity: Some(pos.quantity),
                reduce_only: true,
                close_position: false,
                client_order_id: Some(Self::client_id()),
            })
            .await?;

        let realized_pct = Self::realized(&pos, exit_price);
        tracing::info!(
            symbol = %pos.symbol,
            exit_price,
            realized_pct = format!("{:+.4}%", realized_pct * 100.0),
            reason,
            "Position force-closed"
        );
        self.set_position(None);
        Ok(Some(ClosedTrade {
            symbol: pos.symbol,
            side: pos.side,
            exit_price,
            realized_pct,
            reason: ExitReason::Forced(reason.to_string()),
        }))
    }
}
