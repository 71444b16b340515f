// Entry/exit signals: volume-breakout on klines, large-trade order flow
pub mod breakout;
pub mod order_flow;

pub use breakout::{evaluate_long, evaluate_short, BreakoutParams, SignalResult};
pub use order_flow::{FilterMode, FlowSnapshot, OrderFlowParams, OrderFlowSignal};
