use super::engine::{EngineError, PreparedSeries};
use super::metrics::compute_metrics;
use super::simulator::Simulator;
use super::types::{BacktestParameters, RunControl};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Upper bound on simulated parameter combinations per request.
pub const MAX_GRID: usize = 1000;

/// Tick values to sweep. A trailing value of 0 runs that combination with the
/// trailing stop off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationGrid {
    pub tp_ticks: Vec<u32>,
    pub sl_ticks: Vec<u32>,
    #[serde(default = "no_trailing")]
    pub trailing_ticks: Vec<u32>,
}

fn no_trailing() -> Vec<u32> {
    vec![0]
}

impl OptimizationGrid {
    pub fn size(&self) -> usize {
        self.tp_ticks.len() * self.sl_ticks.len() * self.trailing_ticks.len()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.size() == 0 {
            return Err(EngineError::InvalidParameters(
                "tp_ticks, sl_ticks and trailing_ticks must not be empty".to_string(),
            ));
        }
        if self.size() > MAX_GRID {
            return Err(EngineError::InvalidParameters(format!(
                "grid has {} combinations, the limit is {}",
                self.size(),
                MAX_GRID
            )));
        }
        Ok(())
    }

    fn combinations(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        self.tp_ticks.iter().flat_map(move |&tp| {
            self.sl_ticks.iter().flat_map(move |&sl| {
                self.trailing_ticks.iter().map(move |&trailing| (tp, sl, trailing))
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRow {
    pub tp_ticks: u32,
    pub sl_ticks: u32,
    pub trailing_ticks: u32,
    pub total_profit: f64,
    pub win_rate: f64,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: f64,
    pub total_trades: usize,
    pub avg_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub best: Option<OptimizationRow>,
    pub results: Vec<OptimizationRow>,
    /// Combinations simulated, including those that produced no trades.
    pub evaluated: usize,
}

/// Simulate every grid point against one prepared series.
pub fn optimize(
    prepared: &PreparedSeries<'_>,
    base: &BacktestParameters,
    grid: &OptimizationGrid,
    control: Option<&RunControl>,
) -> Result<OptimizationReport, EngineError> {
    grid.validate()?;
    let total = grid.size();

    tracing::info!(
        "Optimizing over {} combinations ({} candles, {} signals)",
        total,
        prepared.candles.len(),
        prepared.signal_count()
    );

    let mut results = Vec::new();
    let mut evaluated = 0;

    for (tp, sl, trailing) in grid.combinations() {
        if control.is_some_and(|c| c.is_cancelled()) {
            return Err(EngineError::Cancelled);
        }

        let params = BacktestParameters {
            tp_ticks: tp,
            sl_ticks: sl,
            trailing_stop: trailing > 0,
            trailing_stop_ticks: if trailing > 0 {
                trailing
            } else {
                base.trailing_stop_ticks
            },
            ..base.clone()
        };
        params.validate().map_err(EngineError::InvalidParameters)?;

        let trades = Simulator::new(&params).run(prepared.candles, &prepared.signals, None)?;
        evaluated += 1;

        if let Some(control) = control {
            control.set_progress(evaluated as f64 / total as f64 * 100.0);
        }

        if trades.is_empty() {
            tracing::debug!("TP {} / SL {} / trailing {}: no trades", tp, sl, trailing);
            continue;
        }

        let metrics = compute_metrics(&trades, params.starting_balance);
        results.push(OptimizationRow {
            tp_ticks: tp,
            sl_ticks: sl,
            trailing_ticks: trailing,
            total_profit: metrics.total_pnl,
            win_rate: metrics.win_rate,
            sharpe_ratio: metrics.sharpe_ratio,
            max_drawdown: metrics.max_drawdown,
            total_trades: metrics.total_trades,
            avg_profit: metrics.avg_profit,
        });
    }

    results.sort_by(|a, b| by_sharpe_desc(a.sharpe_ratio, b.sharpe_ratio));
    let best = results.first().cloned();

    if let Some(best) = &best {
        tracing::info!(
            "Best: TP {} / SL {} / trailing {} -> Sharpe {:?}, profit {:.2}",
            best.tp_ticks,
            best.sl_ticks,
            best.trailing_ticks,
            best.sharpe_ratio,
            best.total_profit
        );
    } else {
        tracing::warn!("No parameter combination produced trades");
    }

    Ok(OptimizationReport {
        best,
        results,
        evaluated,
    })
}

fn by_sharpe_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
