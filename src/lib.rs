// Core modules
pub mod config;
pub mod engine;
pub mod execution;
pub mod gateway;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod signal;
pub mod stream;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{Command, Engine};
pub use models::*;
