pub mod handlers;

use crate::orchestrator::types::Metrics;
use crate::storage::BacktestRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// One row of the history list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSummary {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub parameters: Value,
    pub total_trades: usize,
    pub total_pnl: f64,
    pub win_rate: f64,
}

impl From<&BacktestRecord> for BacktestSummary {
    fn from(record: &BacktestRecord) -> Self {
        let metrics = &record.results.metrics;
        Self {
            id: record.id,
            date: record.created_at,
            parameters: record.parameters.clone(),
            total_trades: metrics.total_trades,
            total_pnl: metrics.total_pnl,
            win_rate: metrics.win_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparedRun {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub parameters: Value,
    pub metrics: Metrics,
}

impl From<&BacktestRecord> for ComparedRun {
    fn from(record: &BacktestRecord) -> Self {
        Self {
            id: record.id,
            date: record.created_at,
            parameters: record.parameters.clone(),
            metrics: record.results.metrics.clone(),
        }
    }
}

/// `base - other` for each compared metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDifferences {
    pub total_trades: i64,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub sharpe_ratio: Option<f64>,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub base: ComparedRun,
    pub other: ComparedRun,
    pub differences: MetricDifferences,
}

pub fn compare(base: &BacktestRecord, other: &BacktestRecord) -> Comparison {
    let (a, b) = (&base.results.metrics, &other.results.metrics);

    Comparison {
        base: base.into(),
        other: other.into(),
        differences: MetricDifferences {
            total_trades: a.total_trades as i64 - b.total_trades as i64,
            win_rate: a.win_rate - b.win_rate,
            total_pnl: a.total_pnl - b.total_pnl,
            sharpe_ratio: a.sharpe_ratio.zip(b.sharpe_ratio).map(|(x, y)| x - y),
            avg_win: a.avg_win - b.avg_win,
            avg_loss: a.avg_loss - b.avg_loss,
            best_trade: a.best_trade - b.best_trade,
            worst_trade: a.worst_trade - b.worst_trade,
            max_drawdown: a.max_drawdown - b.max_drawdown,
        },
    }
}
