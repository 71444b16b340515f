// Paper-trading executor. Entries fill instantly at the requested price;
// exits trigger off the streamed price and settle at the bracket level,
// mirroring how the conditional orders would fire on the exchange.
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::gateway::MarketGateway;
use crate::models::{ClosedTrade, ExitReason, Position, Side};
use crate::stream::MarketStream;

use super::{EntryOutcome, OrderExecutor};

pub struct SimulatedExecutor {
    stream: Arc<MarketStream>,
    gateway: Arc<dyn MarketGateway>,
    position: Mutex<Option<Position>>,
}

impl SimulatedExecutor {
    pub fn new(stream: Arc<MarketStream>, gateway: Arc<dyn MarketGateway>) -> Self {
        Self {
            stream,
            gateway,
            position: Mutex::new(None),
        }
    }

    /// Streamed price first, REST fallback when the stream has not ticked
    async fn current_price(&self, symbol: &str) -> Option<f64> {
        if let Some(p) = self.stream.best_price(symbol) {
            return Some(p);
        }
        match self.gateway.best_price(symbol).await {
            Ok(p) if p.is_finite() && p > 0.0 => Some(p),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(symbol, "Price lookup failed in simulation: {e}");
                None
            }
        }
    }

    fn settle(&self, pos: &Position, exit_price: f64, reason: ExitReason) -> ClosedTrade {
        let realized_pct =
            (exit_price - pos.entry_price) / pos.entry_price * pos.side.pnl_sign();
        tracing::info!(
            symbol = %pos.symbol,
            side = %pos.side,
            exit_price,
            realized_pct = format!("{:+.4}%", realized_pct * 100.0),
            reason = ?reason,
            "[SIM] Position closed"
        );
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
impl OrderExecutor for SimulatedExecutor {
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
        let mut guard = self.position.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            anyhow::bail!("a position is already open");
        }

        tracing::info!(
            symbol,
            side = %side,
            quantity,
            entry,
            stop_loss,
            take_profit,
            "[SIM] Entry filled"
        );
        *guard = Some(Position {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: entry,
            stop_loss,
            take_profit,
            entry_order_id: None,
            tp_order_id: None,
            sl_order_id: None,
        });
        Ok(EntryOutcome::Filled)
    }

    async fn poll_and_close_if_hit(&self) -> anyhow::Result<Option<ClosedTrade>> {
        let pos = match self.open_position() {
            Some(p) => p,
            None => return Ok(None),
        };

        let price = match self.current_price(&pos.symbol).await {
            Some(p) => p,
            None => return Ok(None),
        };

        // Stop checked first: on a bar that gapped through both levels the
        // conservative outcome wins
        let hit = match pos.side {
            Side::Long if price <= pos.stop_loss => Some((pos.stop_loss, ExitReason::StopLoss)),
            Side::Long if price >= pos.take_profit => {
                Some((pos.take_profit, ExitReason::TakeProfit))
            }
            Side::Short if price >= pos.stop_loss => Some((pos.stop_loss, ExitReason::StopLoss)),
            Side::Short if price <= pos.take_profit => {
                Some((pos.take_profit, ExitReason::TakeProfit))
            }
            _ => None,
        };

        match hit {
            Some((exit_price, reason)) => {
                let trade = self.settle(&pos, exit_price, reason);
                *self.position.lock().unwrap_or_else(|e| e.into_inner()) = None;
                Ok(Some(trade))
            }
            None => Ok(None),
        }
    }

    async fn force_close(&self, reason: &str) -> anyhow::Result<Option<ClosedTrade>> {
        let pos = match self.open_position() {
            Some(p) => p,
            None => return Ok(None),
        };

        let price = self
            .current_price(&pos.symbol)
            .await
            .ok_or_else(|| anyhow::anyhow!("no price available to close {}", pos.symbol))?;

        let trade = self.settle(&pos, price, ExitReason::Forced(reason.to_string()));
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(Some(trade))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::gateway::{
        GatewayError, MarketGateway, OrderAck, OrderRequest, OrderStatus,
    };
    use crate::models::{KlineWindow, SymbolRule, TickerEntry};

    use super::*;

    struct NoopGateway;

    #[async_trait]
    impl MarketGateway for NoopGateway {
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
            Ok(10_000.0)
        }
        async fn best_price(&self, _symbol: &str) -> Result<f64, GatewayError> {
            Err(GatewayError::Transient("offline".to_string()))
        }
        async fn place_order(&self, _req: &OrderRequest) -> Result<OrderAck, GatewayError> {
            Err(GatewayError::Rejected("not supported".to_string()))
        }
        async fn query_order(
            &self,
            _symbol: &str,
            _order_id: i64,
        ) -> Result<OrderStatus, GatewayError> {
            Err(GatewayError::Rejected("not supported".to_string()))
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: i64) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn cancel_all(&self, _symbol: &str) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    fn executor() -> (Arc<MarketStream>, SimulatedExecutor) {
        let stream = Arc::new(MarketStream::new(false));
        let exec = SimulatedExecutor::new(stream.clone(), Arc::new(NoopGateway));
        (stream, exec)
    }

    #[tokio::test]
    async fn test_entry_fills_immediately() {
        let (_stream, exec) = executor();
        let outcome = exec
            .place_bracket("BTCUSDT", Side::Long, 25.0, 100.0, 97.0, 106.0)
            .await
            .unwrap();
        assert_eq!(outcome, EntryOutcome::Filled);

        let pos = exec.open_position().unwrap();
        assert_eq!(pos.entry_price, 100.0);
        assert_eq!(pos.stop_loss, 97.0);
        assert_eq!(pos.take_profit, 106.0);
    }

    #[tokio::test]
    async fn test_second_entry_rejected_while_open() {
        let (_stream, exec) = executor();
        exec.place_bracket("BTCUSDT", Side::Long, 25.0, 100.0, 97.0, 106.0)
            .await
            .unwrap();
        assert!(exec
            .place_bracket("ETHUSDT", Side::Short, 1.0, 50.0, 52.0, 47.0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_take_profit_settles_at_level() {
        let (stream, exec) = executor();
        exec.place_bracket("BTCUSDT", Side::Long, 25.0, 100.0, 97.0, 106.0)
            .await
            .unwrap();

        stream.record_price("BTCUSDT", 104.0);
        assert!(exec.poll_and_close_if_hit().await.unwrap().is_none());

        stream.record_price("BTCUSDT", 106.5);
        let trade = exec.poll_and_close_if_hit().await.unwrap().unwrap();
        assert_eq!(trade.reason, ExitReason::TakeProfit);
        assert_eq!(trade.exit_price, 106.0);
        assert!((trade.realized_pct - 0.06).abs() < 1e-9);
        assert!(!exec.has_open());

        // Settles exactly once
        assert!(exec.poll_and_close_if_hit().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_stop_loss() {
        let (stream, exec) = executor();
        exec.place_bracket("ETHUSDT", Side::Short, 1.0, 100.0, 103.0, 94.0)
            .await
            .unwrap();

        stream.record_price("ETHUSDT", 103.5);
        let trade = exec.poll_and_close_if_hit().await.unwrap().unwrap();
        assert_eq!(trade.reason, ExitReason::StopLoss);
        assert!((trade.realized_pct - (-0.03)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_force_close_uses_live_price() {
        let (stream, exec) = executor();
        exec.place_bracket("BTCUSDT", Side::Long, 25.0, 100.0, 97.0, 106.0)
            .await
            .unwrap();

        stream.record_price("BTCUSDT", 101.0);
        let trade = exec.force_close("manual").await.unwrap().unwrap();
        assert_eq!(trade.reason, ExitReason::Forced("manual".to_string()));
        assert!((trade.realized_pct - 0.01).abs() < 1e-9);
        assert!(!exec.has_open());
    }

    #[tokio::test]
    async fn test_force_close_without_price_keeps_position() {
        let (_stream, exec) = executor();
        exec.place_bracket("BTCUSDT", Side::Long, 25.0, 100.0, 97.0, 106.0)
            .await
            .unwrap();

        // No streamed price and the gateway is offline
        assert!(exec.force_close("manual").await.is_err());
        assert!(exec.has_open());
    }

    #[tokio::test]
    async fn test_force_close_noop_when_flat() {
        let (_stream, exec) = executor();
        assert!(exec.force_close("manual").await.unwrap().is_none());
    }
}
