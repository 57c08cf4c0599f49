use super::{BacktestJob, BacktestRunner, DataSource, RunOutcome, RunnerError};
use crate::orchestrator::chart_data::build_chart_data;
use crate::orchestrator::types::{BacktestParameters, BacktestResults};
use crate::storage::FileLocation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
struct RunBacktestRequest<'a> {
    file_url: &'a str,
    parameters: &'a BacktestParameters,
}

#[derive(Deserialize)]
struct UploadResponse {
    filename: Option<String>,
    file_url: String,
    #[serde(default)]
    public_id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Delegates runs and file storage to the hosted backtest service.
pub struct RemoteRunner {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl RemoteRunner {
    pub fn new(base_url: impl Into<String>, timeout: Duration, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            http,
        }
    }

    async fn upstream_error(response: reqwest::Response) -> RunnerError {
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(ErrorBody { error: Some(error) }) => error,
            _ => format!("service returned {}", status),
        };
        RunnerError::Upstream(message)
    }
}

#[async_trait]
impl BacktestRunner for RemoteRunner {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn run(&self, job: &BacktestJob) -> Result<RunOutcome, RunnerError> {
        let file_url = match &job.source {
            DataSource::Remote(url) => url.clone(),
            DataSource::Local(path) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "data.csv".to_string());
                let bytes = tokio::fs::read(path).await?;
                match self.store_upload(&filename, &bytes).await? {
                    Some(FileLocation::Remote { url, .. }) => url,
                    _ => return Err(RunnerError::Upstream("upload returned no file URL".to_string())),
                }
            }
        };

        tracing::info!("Requesting remote backtest {} for {}", job.run_id, file_url);

        let request = self
            .http
            .post(format!("{}/run-backtest", self.base_url))
            .timeout(self.timeout)
            .json(&RunBacktestRequest {
                file_url: &file_url,
                parameters: &job.parameters,
            })
            .send();

        // The service cannot be interrupted; cancelling only stops waiting for it.
        let response = tokio::select! {
            response = request => response?,
            _ = wait_for_cancel(&job.control) => {
                return Err(crate::orchestrator::EngineError::Cancelled.into());
            }
        };

        if !response.status().is_success() {
            return Err(Self::upstream_error(response).await);
        }

        let results: BacktestResults = response
            .json()
            .await
            .map_err(|e| RunnerError::Upstream(format!("unexpected response body: {}", e)))?;

        let chart_data = match results.chart_data {
            Some(chart_data) => chart_data,
            None => {
                tracing::debug!("Service returned no chart data, building it from trades");
                build_chart_data(&results.trades, job.parameters.starting_balance)
            }
        };

        job.control.set_progress(100.0);

        Ok(RunOutcome {
            trades: results.trades,
            metrics: results.metrics,
            chart_data: Some(chart_data),
            chart_files: results.chart_files,
        })
    }

    async fn store_upload(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Option<FileLocation>, RunnerError> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str("text/csv")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/upload", self.base_url))
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::upstream_error(response).await);
        }

        let upload: UploadResponse = response
            .json()
            .await
            .map_err(|e| RunnerError::Upstream(format!("unexpected upload response: {}", e)))?;

        tracing::info!(
            "Forwarded {} to backtest service: {}",
            upload.filename.as_deref().unwrap_or(filename),
            upload.file_url
        );

        Ok(Some(FileLocation::Remote {
            url: upload.file_url,
            public_id: upload.public_id,
        }))
    }
}

async fn wait_for_cancel(control: &crate::orchestrator::types::RunControl) {
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    loop {
        poll.tick().await;
        if control.is_cancelled() {
            return;
        }
    }
}
