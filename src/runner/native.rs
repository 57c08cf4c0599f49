use super::{chart_url, local_input, BacktestJob, BacktestRunner, RunOutcome, RunnerError};
use crate::orchestrator::data::load_csv;
use crate::orchestrator::plots::write_trade_charts;
use crate::orchestrator::BacktestEngine;
use async_trait::async_trait;

/// Runs the in-process engine on the blocking pool.
pub struct NativeRunner {
    http: reqwest::Client,
}

impl NativeRunner {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl BacktestRunner for NativeRunner {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn run(&self, job: &BacktestJob) -> Result<RunOutcome, RunnerError> {
        let input = local_input(&self.http, &job.source, &job.run_dir, &job.download).await?;
        let params = job.parameters.clone();
        let control = job.control.clone();
        let run_dir = job.run_dir.clone();
        let run_id = job.run_id;

        tokio::task::spawn_blocking(move || -> Result<RunOutcome, RunnerError> {
            let engine = BacktestEngine::new(params)?;
            let series = load_csv(&input)?;
            tracing::info!(
                "Loaded {} candles from {} (cadence {:?}s)",
                series.len(),
                input.display(),
                series.capabilities.cadence_seconds
            );

            let prepared = engine.prepare(&series);
            let output = engine.run_prepared(&prepared, Some(&control))?;

            let chart_files = if engine.parameters().generate_plots {
                write_trade_charts(
                    prepared.candles,
                    &prepared.ema,
                    &output.trades,
                    engine.parameters().months_per_plot,
                    &run_dir,
                )?
                .iter()
                .map(|file| chart_url(run_id, file))
                .collect()
            } else {
                Vec::new()
            };

            Ok(RunOutcome {
                trades: output.trades,
                metrics: output.metrics,
                chart_data: Some(output.chart_data),
                chart_files,
            })
        })
        .await
        .map_err(|e| RunnerError::Join(e.to_string()))?
    }
}
