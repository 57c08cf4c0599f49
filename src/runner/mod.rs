pub mod native;
pub mod python;
pub mod remote;

pub use native::NativeRunner;
pub use python::PythonRunner;
pub use remote::RemoteRunner;

use crate::config::{host_allowed, Settings};
use crate::orchestrator::data::DataError;
use crate::orchestrator::types::{BacktestParameters, ChartData, Metrics, RunControl, Trade};
use crate::orchestrator::EngineError;
use crate::storage::FileLocation;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Name of the downloaded copy of a remote data file inside a run directory.
pub const DOWNLOADED_INPUT: &str = "input.csv";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("backtest service error: {0}")]
    Upstream(String),
    #[error("request to backtest service failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write report: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to encode job: {0}")]
    Json(#[from] serde_json::Error),
    #[error("backtest process failed: {0}")]
    Process(String),
    #[error("data file exceeds the {0} byte limit")]
    TooLarge(usize),
    #[error("backtest timed out after {0}s")]
    Timeout(u64),
    #[error("backtest task aborted: {0}")]
    Join(String),
}

/// Where the candle file for a job lives.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    Local(PathBuf),
    Remote(String),
}

impl DataSource {
    pub fn describe(&self) -> String {
        match self {
            DataSource::Local(path) => path.display().to_string(),
            DataSource::Remote(url) => url.clone(),
        }
    }
}

/// Bounds on data files fetched from a URL.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadLimits {
    pub max_bytes: usize,
    /// Empty allows any http(s) host.
    pub allowed_hosts: Vec<String>,
}

impl DownloadLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_bytes: settings.max_upload_bytes,
            allowed_hosts: settings.data_url_hosts.clone(),
        }
    }

    fn check_url(&self, raw: &str) -> Result<(), RunnerError> {
        let url = reqwest::Url::parse(raw)
            .map_err(|_| RunnerError::InvalidInput(format!("Invalid data URL: {}", raw)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RunnerError::InvalidInput(
                "fileUrl must be an http(s) URL".to_string(),
            ));
        }
        let host = url.host_str().unwrap_or_default();
        if !host_allowed(&self.allowed_hosts, host) {
            return Err(RunnerError::InvalidInput(format!("Host not allowed: {}", host)));
        }
        Ok(())
    }
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone)]
pub struct BacktestJob {
    pub run_id: Uuid,
    pub source: DataSource,
    pub parameters: BacktestParameters,
    /// Scratch and report directory for this run.
    pub run_dir: PathBuf,
    pub control: RunControl,
    pub download: DownloadLimits,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub trades: Vec<Trade>,
    pub metrics: Metrics,
    pub chart_data: Option<ChartData>,
    /// Chart URLs, either served by this API or absolute.
    pub chart_files: Vec<String>,
}

/// A way of turning a job into trades and metrics.
#[async_trait]
pub trait BacktestRunner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, job: &BacktestJob) -> Result<RunOutcome, RunnerError>;

    /// Hand an uploaded file to the runner's own storage. `None` keeps the
    /// file in the local upload directory.
    async fn store_upload(
        &self,
        _filename: &str,
        _bytes: &[u8],
    ) -> Result<Option<FileLocation>, RunnerError> {
        Ok(None)
    }
}

/// Local path of a job's data, downloading remote files into the run directory.
/// Downloads are streamed to disk and abandoned once they pass `limits.max_bytes`.
pub async fn local_input(
    client: &reqwest::Client,
    source: &DataSource,
    run_dir: &Path,
    limits: &DownloadLimits,
) -> Result<PathBuf, RunnerError> {
    let url = match source {
        DataSource::Local(path) => return Ok(path.clone()),
        DataSource::Remote(url) => url,
    };

    limits.check_url(url)?;
    tracing::info!("Downloading data file: {}", url);
    let mut response = client.get(url).send().await?.error_for_status()?;
    if response
        .content_length()
        .is_some_and(|len| len > limits.max_bytes as u64)
    {
        return Err(RunnerError::TooLarge(limits.max_bytes));
    }

    tokio::fs::create_dir_all(run_dir).await?;
    let path = run_dir.join(DOWNLOADED_INPUT);
    let mut file = tokio::fs::File::create(&path).await?;
    let mut written = 0usize;

    while let Some(chunk) = response.chunk().await? {
        written += chunk.len();
        if written > limits.max_bytes {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!("Failed to remove partial download {}: {}", path.display(), e);
            }
            return Err(RunnerError::TooLarge(limits.max_bytes));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    tracing::debug!("Saved {} bytes to {}", written, path.display());
    Ok(path)
}

/// URL under which the API serves a chart written into a run directory.
pub fn chart_url(run_id: Uuid, filename: &str) -> String {
    format!("/api/charts/{}/{}", run_id, filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_local_source_is_used_in_place() {
        let client = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();
        let source = DataSource::Local(PathBuf::from("/data/uploads/x.csv"));
        let resolved = local_input(&client, &source, dir.path(), &DownloadLimits::default())
            .await
            .unwrap();
        assert_eq!(resolved, PathBuf::from("/data/uploads/x.csv"));
    }

    #[tokio::test]
    async fn test_remote_source_is_downloaded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/nq.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("date_time,open,high,low,close\n"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();
        let source = DataSource::Remote(format!("{}/files/nq.csv", server.uri()));
        let resolved = local_input(&client, &source, dir.path(), &DownloadLimits::default())
            .await
            .unwrap();

        assert_eq!(resolved, dir.path().join(DOWNLOADED_INPUT));
        let content = std::fs::read_to_string(resolved).unwrap();
        assert!(content.starts_with("date_time"));
    }

    #[tokio::test]
    async fn test_remote_download_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();
        let source = DataSource::Remote(format!("{}/missing.csv", server.uri()));
        assert!(matches!(
            local_input(&client, &source, dir.path(), &DownloadLimits::default()).await,
            Err(RunnerError::Http(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_download_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();
        let source = DataSource::Remote(format!("{}/big.csv", server.uri()));
        let limits = DownloadLimits {
            max_bytes: 1024,
            allowed_hosts: Vec::new(),
        };

        let result = local_input(&client, &source, dir.path(), &limits).await;
        assert!(matches!(result, Err(RunnerError::TooLarge(1024))));
        assert!(!dir.path().join(DOWNLOADED_INPUT).exists());
    }

    #[tokio::test]
    async fn test_download_host_must_be_allowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("date_time,open\n"))
            .expect(0)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();
        let source = DataSource::Remote(format!("{}/nq.csv", server.uri()));
        let limits = DownloadLimits {
            max_bytes: 1024,
            allowed_hosts: vec!["files.example.com".to_string()],
        };

        match local_input(&client, &source, dir.path(), &limits).await {
            Err(RunnerError::InvalidInput(msg)) => assert!(msg.starts_with("Host not allowed")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
