// Pure indicator math used by the signal engine
pub mod atr;
pub mod moving_average;

pub use atr::calculate_atr;
pub use moving_average::{calculate_ema, calculate_sma, median};
