use super::export::write_reports;
use super::types::{BacktestParameters, BacktestResults, DownloadLinks, RunControl};
use crate::error::ApiError;
use crate::runner::{BacktestJob, DataSource, DownloadLimits};
use crate::storage::{BacktestRecord, FileLocation};
use crate::AppState;
use chrono::Utc;
use uuid::Uuid;

/// Data file a run reads, with the identifiers recorded alongside its results.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub source: DataSource,
    pub file_id: Option<Uuid>,
    pub file_url: Option<String>,
}

/// Find the data for a run from an upload id or a direct http(s) URL. The
/// upload id wins when both are given.
pub async fn resolve_source(
    state: &AppState,
    file_id: Option<&str>,
    file_url: Option<&str>,
) -> Result<ResolvedSource, ApiError> {
    if let Some(raw) = file_id.filter(|s| !s.trim().is_empty()) {
        let id = Uuid::parse_str(raw.trim())
            .map_err(|_| ApiError::BadRequest("Invalid file ID".to_string()))?;
        let upload = state
            .repo
            .get_upload(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Upload not found".to_string()))?;

        let (source, file_url) = match upload.location {
            FileLocation::Local { path } => (DataSource::Local(path), None),
            FileLocation::Remote { url, .. } => (DataSource::Remote(url.clone()), Some(url)),
        };
        return Ok(ResolvedSource {
            source,
            file_id: Some(id),
            file_url,
        });
    }

    match file_url.map(str::trim).filter(|s| !s.is_empty()) {
        Some(url) if is_http_url(url) => Ok(ResolvedSource {
            source: DataSource::Remote(url.to_string()),
            file_id: None,
            file_url: Some(url.to_string()),
        }),
        Some(_) => Err(ApiError::BadRequest(
            "fileUrl must be an http(s) URL".to_string(),
        )),
        None => Err(ApiError::BadRequest(
            "fileId or fileUrl is required".to_string(),
        )),
    }
}

pub fn is_http_url(raw: &str) -> bool {
    reqwest::Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

/// Run a backtest with the configured runner, write its CSV reports and save
/// the record.
pub async fn execute_backtest(
    state: &AppState,
    run_id: Uuid,
    resolved: ResolvedSource,
    parameters: BacktestParameters,
    control: RunControl,
) -> Result<BacktestRecord, ApiError> {
    let run_dir = state.settings.results_dir().join(run_id.to_string());
    tokio::fs::create_dir_all(&run_dir)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to create run directory: {}", e)))?;

    tracing::info!(
        "Backtest {} on {} with {} runner",
        run_id,
        resolved.source.describe(),
        state.runner.name()
    );

    let job = BacktestJob {
        run_id,
        source: resolved.source,
        parameters,
        run_dir,
        control,
        download: DownloadLimits::from_settings(&state.settings),
    };
    let outcome = state.runner.run(&job).await?;

    let reports_dir = job.run_dir.clone();
    let (trades, metrics) = (outcome.trades, outcome.metrics);
    let (trades, metrics) = tokio::task::spawn_blocking(move || {
        write_reports(&reports_dir, &trades, &metrics).map(|_| (trades, metrics))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Report task failed: {}", e)))?
    .map_err(|e| ApiError::Internal(format!("Failed to write reports: {}", e)))?;

    let record = BacktestRecord {
        id: run_id,
        file_id: resolved.file_id,
        file_url: resolved.file_url,
        parameters: serde_json::to_value(&job.parameters)
            .map_err(|e| ApiError::Internal(e.to_string()))?,
        results: BacktestResults {
            metrics,
            trades,
            chart_data: outcome.chart_data,
            chart_files: outcome.chart_files,
            download_links: Some(DownloadLinks::for_run(run_id)),
        },
        runner: state.runner.name().to_string(),
        created_at: Utc::now(),
    };

    state.repo.insert_backtest(&record).await?;
    tracing::info!(
        "Backtest {} saved: {} trades, P&L {:.2}",
        run_id,
        record.results.metrics.total_trades,
        record.results.metrics.total_pnl
    );

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_url_check() {
        assert!(is_http_url("https://res.cloudinary.com/demo/raw/upload/nq.csv"));
        assert!(is_http_url("http://localhost:8000/files/a.csv"));
        assert!(!is_http_url("file:///etc/passwd"));
        assert!(!is_http_url("/data/uploads/a.csv"));
        assert!(!is_http_url("ftp://example.com/a.csv"));
    }
}
