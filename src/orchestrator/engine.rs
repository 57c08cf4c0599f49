use super::chart_data::build_chart_data;
use super::indicators::ema;
use super::metrics::compute_metrics;
use super::signals::{detect_signals, Signal};
use super::simulator::Simulator;
use super::types::*;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("backtest cancelled")]
    Cancelled,
    #[error("arithmetic overflow at {0}; prices or parameters are out of range")]
    Overflow(String),
}

/// Candles with the indicator and signal columns the simulator reads.
pub struct PreparedSeries<'a> {
    pub candles: &'a [Candle],
    pub ema: Vec<Decimal>,
    pub signals: Vec<Signal>,
}

impl<'a> PreparedSeries<'a> {
    pub fn new(candles: &'a [Candle], ema_span: usize) -> Self {
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        let ema = ema(&closes, ema_span);
        let signals = detect_signals(candles, &ema);
        Self {
            candles,
            ema,
            signals,
        }
    }

    pub fn signal_count(&self) -> usize {
        self.signals.iter().filter(|s| **s != Signal::Flat).count()
    }
}

#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub trades: Vec<Trade>,
    pub metrics: Metrics,
    pub chart_data: ChartData,
}

pub struct BacktestEngine {
    params: BacktestParameters,
}

impl BacktestEngine {
    pub fn new(params: BacktestParameters) -> Result<Self, EngineError> {
        params.validate().map_err(EngineError::InvalidParameters)?;
        Ok(Self { params })
    }

    pub fn parameters(&self) -> &BacktestParameters {
        &self.params
    }

    pub fn prepare<'a>(&self, series: &'a CandleSeries) -> PreparedSeries<'a> {
        PreparedSeries::new(&series.candles, self.params.ema_span)
    }

    /// Run the full pipeline: EMA, signals, simulation, metrics.
    pub fn run(
        &self,
        series: &CandleSeries,
        control: Option<&RunControl>,
    ) -> Result<EngineOutput, EngineError> {
        let prepared = self.prepare(series);
        self.run_prepared(&prepared, control)
    }

    pub fn run_prepared(
        &self,
        prepared: &PreparedSeries<'_>,
        control: Option<&RunControl>,
    ) -> Result<EngineOutput, EngineError> {
        tracing::info!(
            "Simulating {} candles with {} signals (TP {} / SL {} ticks, trailing {})",
            prepared.candles.len(),
            prepared.signal_count(),
            self.params.tp_ticks,
            self.params.sl_ticks,
            if self.params.trailing_stop {
                self.params.trailing_stop_ticks.to_string()
            } else {
                "off".to_string()
            }
        );

        let trades =
            Simulator::new(&self.params).run(prepared.candles, &prepared.signals, control)?;
        let metrics = compute_metrics(&trades, self.params.starting_balance);
        let chart_data = build_chart_data(&trades, self.params.starting_balance);

        tracing::info!(
            "Backtest complete: {} trades, win rate {:.2}%, P&L {:.2}",
            metrics.total_trades,
            metrics.win_rate * 100.0,
            metrics.total_pnl
        );

        Ok(EngineOutput {
            trades,
            metrics,
            chart_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::data::parse_csv;
    use crate::orchestrator::fixtures::PULLBACK_CSV;
    use rust_decimal_macros::dec;

    fn provenance() -> CandleSeriesProvenance {
        CandleSeriesProvenance {
            source: "inline".to_string(),
            trust_tier: CandleSeriesTrustTier::UserSupplied,
        }
    }

    #[test]
    fn test_pipeline_on_pullback_pattern() {
        let series = parse_csv(PULLBACK_CSV.as_bytes(), provenance()).unwrap();
        let engine = BacktestEngine::new(BacktestParameters::default()).unwrap();

        let prepared = engine.prepare(&series);
        assert_eq!(prepared.signals[4], Signal::Long);

        let output = engine.run_prepared(&prepared, None).unwrap();
        assert_eq!(output.trades.len(), 1);

        let trade = &output.trades[0];
        assert_eq!(trade.entry_price, dec!(101));
        assert_eq!(trade.exit_price, dec!(106));
        assert_eq!(trade.exit_reason, "TP");
        assert_eq!(output.metrics.total_trades, 1);
        assert_eq!(output.metrics.total_pnl, 85.0);
        assert_eq!(output.chart_data.equity_curve[0].balance, 100085.0);
    }

    #[test]
    fn test_invalid_parameters() {
        let params = BacktestParameters {
            sl_ticks: 0,
            ..Default::default()
        };
        assert!(matches!(
            BacktestEngine::new(params),
            Err(EngineError::InvalidParameters(_))
        ));
    }
}
