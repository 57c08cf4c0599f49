use crate::config::host_allowed;
use crate::error::ApiError;
use crate::orchestrator::export::DOWNLOADABLE_FILES;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub id: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChartProxyQuery {
    pub url: Option<String>,
}

/// A report CSV from a run directory, as an attachment.
pub async fn download_report(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let file = query.file.unwrap_or_default();
    if !DOWNLOADABLE_FILES.contains(&file.as_str()) {
        return Err(ApiError::BadRequest("Invalid file requested".to_string()));
    }
    let id = parse_run_id(query.id.as_deref())?;

    let path = state.settings.results_dir().join(id.to_string()).join(&file);
    let content = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound("File not found".to_string()))?;

    tracing::info!("Serving {} for run {}", file, id);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file),
            ),
        ],
        content,
    ))
}

/// A generated HTML chart from a run directory.
pub async fn serve_chart(
    State(state): State<AppState>,
    Path((id, filename)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_run_id(Some(&id))?;
    if !is_chart_name(&filename) {
        return Err(ApiError::BadRequest("Invalid chart file".to_string()));
    }

    let path = state.settings.results_dir().join(id.to_string()).join(&filename);
    let html = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ApiError::NotFound("Chart not found".to_string()))?;

    Ok(([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html))
}

/// Fetch a chart hosted elsewhere so the results page can frame it.
pub async fn chart_proxy(
    State(state): State<AppState>,
    Query(query): Query<ChartProxyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let raw = query
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("URL parameter required".to_string()))?;

    let url = reqwest::Url::parse(raw.trim())
        .map_err(|_| ApiError::BadRequest("Invalid URL".to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::BadRequest("Only http(s) URLs can be proxied".to_string()));
    }
    let host = url.host_str().unwrap_or_default();
    if !host_allowed(&state.settings.chart_proxy_hosts, host) {
        return Err(ApiError::BadRequest(format!("Host not allowed: {}", host)));
    }

    tracing::info!("Proxying chart: {}", url);
    let response = state
        .http
        .get(url)
        .send()
        .await
        .map_err(|e| ApiError::Upstream(format!("Failed to fetch chart: {}", e)))?;
    if !response.status().is_success() {
        return Err(ApiError::Upstream(format!(
            "Failed to fetch chart: upstream returned {}",
            response.status()
        )));
    }
    let html = response
        .text()
        .await
        .map_err(|e| ApiError::Upstream(format!("Failed to fetch chart: {}", e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::X_FRAME_OPTIONS, "SAMEORIGIN"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        html,
    ))
}

fn parse_run_id(raw: Option<&str>) -> Result<Uuid, ApiError> {
    raw.and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or_else(|| ApiError::BadRequest("Invalid run ID".to_string()))
}

fn is_chart_name(filename: &str) -> bool {
    filename.ends_with(".html")
        && !filename.contains("..")
        && !filename.contains('/')
        && !filename.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_names() {
        assert!(is_chart_name("strategy_candles_001.html"));
        assert!(!is_chart_name("trades.csv"));
        assert!(!is_chart_name("..html"));
        assert!(!is_chart_name("a/b.html"));
    }
}
