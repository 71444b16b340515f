// Daily risk frame: halt state machine and volatility-based sizing
pub mod bracket;
pub mod day_guard;

pub use bracket::{floor_step, round_tick, BracketCalculator, TickDirection};
pub use day_guard::{DayGuard, DayState};
