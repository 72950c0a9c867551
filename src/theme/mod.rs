pub mod config;
pub mod engine;
pub mod state;

pub use config::{DecisionConfig, DecisionConfigError};
pub use engine::ThemeDecisionEngine;
pub use state::{Theme, ThemeIntent};
