use super::types::{Metrics, Trade};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Sharpe annualisation for minute bars: 252 sessions * 24h * 60m.
const PERIODS_PER_YEAR: f64 = 252.0 * 24.0 * 60.0;

pub fn compute_metrics(trades: &[Trade], starting_balance: Decimal) -> Metrics {
    let initial = starting_balance.to_f64().unwrap_or(0.0);

    if trades.is_empty() {
        return Metrics {
            ending_balance: initial,
            ..Metrics::default()
        };
    }

    let pnls: Vec<f64> = trades.iter().map(|t| t.pnl.to_f64().unwrap_or(0.0)).collect();
    let n = pnls.len() as f64;

    let total_pnl: f64 = pnls.iter().sum();
    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();

    Metrics {
        total_trades: pnls.len(),
        win_rate: wins.len() as f64 / n,
        avg_profit: total_pnl / n,
        total_pnl,
        profit_percentage: if initial != 0.0 {
            total_pnl / initial * 100.0
        } else {
            0.0
        },
        max_drawdown: max_drawdown(&pnls, initial),
        sharpe_ratio: if has_dispersion(trades) {
            sharpe_ratio(&pnls, initial)
        } else {
            None
        },
        avg_win: mean(&wins).unwrap_or(0.0),
        avg_loss: mean(&losses).unwrap_or(0.0),
        best_trade: pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        worst_trade: pnls.iter().copied().fold(f64::INFINITY, f64::min),
        ending_balance: initial + total_pnl,
    }
}

/// Largest peak-to-trough fall of the post-trade balance, in currency.
/// Peaks are taken from post-trade balances only.
fn max_drawdown(pnls: &[f64], initial: f64) -> f64 {
    let mut balance = initial;
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;

    for pnl in pnls {
        balance += pnl;
        peak = peak.max(balance);
        worst = worst.max(peak - balance);
    }

    worst
}

/// Whether the exact P&Ls differ at all. Identical f64 returns can still show a
/// rounding-sized deviation, so this is decided on the decimals.
fn has_dispersion(trades: &[Trade]) -> bool {
    trades.windows(2).any(|w| w[0].pnl != w[1].pnl)
}

/// Mean over sample standard deviation of per-trade returns on the starting
/// balance. `None` with fewer than two trades or no dispersion.
fn sharpe_ratio(pnls: &[f64], initial: f64) -> Option<f64> {
    if pnls.len() < 2 || initial == 0.0 {
        return None;
    }

    let returns: Vec<f64> = pnls.iter().map(|p| p / initial).collect();
    let mean = mean(&returns)?;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
        / (returns.len() as f64 - 1.0);
    let std_dev = variance.sqrt();

    if std_dev == 0.0 || !std_dev.is_finite() {
        return None;
    }

    Some(mean / std_dev * PERIODS_PER_YEAR.sqrt())
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::PositionSide;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn trade(pnl: Decimal) -> Trade {
        let time = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        Trade {
            position: PositionSide::Long,
            entry_time: time,
            exit_time: time,
            entry_price: dec!(100),
            exit_price: dec!(100),
            sl_price: dec!(95),
            tp_price: dec!(105),
            quantity: Decimal::ONE,
            pnl,
            exit_reason: "TP".to_string(),
            cumulative_pnl: Decimal::ZERO,
            balance_after: Decimal::ZERO,
        }
    }

    #[test]
    fn test_metrics_for_mixed_trades() {
        let trades = vec![trade(dec!(85)), trade(dec!(-115)), trade(dec!(85)), trade(dec!(-115))];
        let m = compute_metrics(&trades, dec!(100000));

        assert_eq!(m.total_trades, 4);
        assert_eq!(m.win_rate, 0.5);
        assert_eq!(m.total_pnl, -60.0);
        assert_eq!(m.avg_profit, -15.0);
        assert_eq!(m.avg_win, 85.0);
        assert_eq!(m.avg_loss, -115.0);
        assert_eq!(m.best_trade, 85.0);
        assert_eq!(m.worst_trade, -115.0);
        assert!((m.profit_percentage - -0.06).abs() < 1e-12);
        // balances: 100085, 99970, 100055, 99940 -> peak 100085, trough 99940
        assert!((m.max_drawdown - 145.0).abs() < 1e-9);
        assert_eq!(m.ending_balance, 99940.0);
        assert!(m.sharpe_ratio.unwrap() < 0.0);
    }

    #[test]
    fn test_drawdown_ignores_starting_balance_peak() {
        let trades = vec![trade(dec!(-100)), trade(dec!(-50))];
        let m = compute_metrics(&trades, dec!(1000));
        assert!((m.max_drawdown - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_undefined_for_single_trade_or_flat_returns() {
        let m = compute_metrics(&[trade(dec!(85))], dec!(100000));
        assert_eq!(m.sharpe_ratio, None);

        let m = compute_metrics(&[trade(dec!(85)), trade(dec!(85))], dec!(100000));
        assert_eq!(m.sharpe_ratio, None);
    }

    #[test]
    fn test_sharpe_undefined_for_many_identical_trades() {
        for n in [10, 100, 333] {
            let trades = vec![trade(dec!(85)); n];
            let m = compute_metrics(&trades, dec!(100000));
            assert_eq!(m.sharpe_ratio, None, "{} identical trades", n);
            assert_eq!(m.total_trades, n);
        }
    }

    #[test]
    fn test_sharpe_value() {
        let m = compute_metrics(&[trade(dec!(100)), trade(dec!(300))], dec!(100000));
        // returns 0.001, 0.003: mean 0.002, sample variance 2e-6
        let expected = 0.002 / (2.0e-6_f64).sqrt() * PERIODS_PER_YEAR.sqrt();
        assert!((m.sharpe_ratio.unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_no_trades() {
        let m = compute_metrics(&[], dec!(50000));
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.sharpe_ratio, None);
        assert_eq!(m.ending_balance, 50000.0);
    }
}
