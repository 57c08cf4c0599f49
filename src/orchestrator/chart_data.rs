use super::types::{ChartData, EquityPoint, MonthlyReturn, Trade};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Equity curve and per-month P&L for the results charts.
/// Months are keyed on the trade's exit time.
pub fn build_chart_data(trades: &[Trade], starting_balance: Decimal) -> ChartData {
    let mut balance = starting_balance;
    let mut equity_curve = Vec::with_capacity(trades.len());
    let mut monthly: BTreeMap<String, Decimal> = BTreeMap::new();

    for (idx, trade) in trades.iter().enumerate() {
        balance += trade.pnl;

        equity_curve.push(EquityPoint {
            trade_number: idx + 1,
            date: trade.exit_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            balance: round2(balance),
        });

        *monthly
            .entry(trade.exit_time.format("%Y-%m").to_string())
            .or_insert(Decimal::ZERO) += trade.pnl;
    }

    ChartData {
        equity_curve,
        monthly_returns: monthly
            .into_iter()
            .map(|(month, pnl)| MonthlyReturn {
                month,
                pnl: round2(pnl),
            })
            .collect(),
    }
}

fn round2(value: Decimal) -> f64 {
    value
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(0.0)
}
