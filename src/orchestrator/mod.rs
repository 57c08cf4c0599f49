pub mod chart_data;
pub mod data;
pub mod engine;
pub mod export;
pub mod handlers;
pub mod indicators;
pub mod metrics;
pub mod optimizer;
pub mod plots;
pub mod service;
pub mod signals;
pub mod simulator;
pub mod types;

#[cfg(test)]
pub(crate) mod fixtures;

pub use engine::{BacktestEngine, EngineError, EngineOutput, PreparedSeries};
pub use optimizer::{optimize, OptimizationGrid, OptimizationReport, OptimizationRow};
pub use types::*;
