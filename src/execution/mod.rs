// Order lifecycle: entry fill, protective bracket, exit detection. The
// control loop talks to this layer only through `OrderExecutor`, so the
// simulated and live paths are interchangeable.
pub mod live;
pub mod simulated;

use async_trait::async_trait;

use crate::models::{ClosedTrade, Position, Side};

/// How an entry attempt ended. `TimedOut` and `Rejected` both guarantee
/// no position and no resting bracket orders remain.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Filled,
    /// Entry did not fill within the timeout and was canceled
    TimedOut,
    Rejected(String),
}

/// Single-position order executor. At most one position is open at a
/// time; all mutation goes through these methods.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Snapshot of the currently open position, if any
    fn open_position(&self) -> Option<Position>;

    fn has_open(&self) -> bool {
        self.open_position().is_some()
    }

    /// Submit an entry at `entry` and, once filled, arm the protective
    /// stop/target pair. Prices must already be tick-aligned.
    async fn place_bracket(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> anyhow::Result<EntryOutcome>;

    /// Check whether either bracket leg has fired and, if so, settle the
    /// position. Returns the closed trade exactly once.
    async fn poll_and_close_if_hit(&self) -> anyhow::Result<Option<ClosedTrade>>;

    /// Market-close the open position immediately. On error the position
    /// is kept so the caller can retry.
    async fn force_close(&self, reason: &str) -> anyhow::Result<Option<ClosedTrade>>;
}

pub use live::LiveExecutor;
pub use simulated::SimulatedExecutor;
