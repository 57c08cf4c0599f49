use super::sanitize_filename;
use crate::error::ApiError;
use crate::orchestrator::data::parse_csv;
use crate::orchestrator::service::is_http_url;
use crate::orchestrator::types::{CandleSeriesProvenance, CandleSeriesTrustTier, DataQuality};
use crate::storage::{FileLocation, UploadRecord};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Multipart, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub file_id: Uuid,
    pub file_url: Option<String>,
    pub filename: String,
    pub rows: usize,
    pub quality: DataQuality,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUploadRequest {
    pub file_url: String,
    pub public_id: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUploadResponse {
    pub success: bool,
    pub file_id: Uuid,
}

/// Accept a CSV upload, check it parses, and store it with the configured runner
/// or under the data directory.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut parameters: Option<Value> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.csv").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?;
                file = Some((filename, bytes));
            }
            Some("parameters") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read parameters: {}", e)))?;
                if !text.trim().is_empty() {
                    parameters = Some(serde_json::from_str(&text).map_err(|e| {
                        ApiError::BadRequest(format!("Invalid parameters JSON: {}", e))
                    })?);
                }
            }
            _ => {}
        }
    }

    let Some((original_name, bytes)) = file.filter(|(_, bytes)| !bytes.is_empty()) else {
        return Err(ApiError::BadRequest("No file uploaded".to_string()));
    };
    let filename = sanitize_filename(&original_name);
    tracing::info!("Received upload {} ({} bytes)", filename, bytes.len());

    let csv = bytes.clone();
    let source = filename.clone();
    let series = tokio::task::spawn_blocking(move || {
        parse_csv(
            &csv[..],
            CandleSeriesProvenance {
                source,
                trust_tier: CandleSeriesTrustTier::UserSupplied,
            },
        )
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Validation task failed: {}", e)))??;
    let quality = series.quality();

    if !quality.capabilities.ohlc_sane {
        tracing::warn!("Upload {} has bars with inconsistent OHLC values", filename);
    }

    let id = Uuid::new_v4();
    let location = match state.runner.store_upload(&filename, &bytes).await? {
        Some(location) => location,
        None => {
            let dir = state.settings.uploads_dir();
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ApiError::Internal(format!("Failed to create upload directory: {}", e)))?;
            let path = dir.join(format!("{}_{}", id, filename));
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| ApiError::Internal(format!("Failed to store upload: {}", e)))?;
            FileLocation::Local { path }
        }
    };

    let record = UploadRecord {
        id,
        filename: filename.clone(),
        location,
        size: bytes.len() as u64,
        rows: Some(quality.rows),
        quality: Some(quality.clone()),
        parameters,
        uploaded_at: Utc::now(),
        status: "uploaded".to_string(),
    };
    state.repo.insert_upload(&record).await?;

    Ok(Json(UploadResponse {
        success: true,
        file_id: id,
        file_url: record.file_url().map(String::from),
        filename,
        rows: quality.rows,
        quality,
    }))
}

/// Record a file that was stored somewhere else.
pub async fn register_upload(
    State(state): State<AppState>,
    Json(payload): Json<RegisterUploadRequest>,
) -> Result<Json<RegisterUploadResponse>, ApiError> {
    if !is_http_url(&payload.file_url) {
        return Err(ApiError::BadRequest("fileUrl must be an http(s) URL".to_string()));
    }

    let record = UploadRecord {
        id: Uuid::new_v4(),
        filename: payload.filename,
        location: FileLocation::Remote {
            url: payload.file_url,
            public_id: payload.public_id,
        },
        size: payload.size,
        rows: None,
        quality: None,
        parameters: None,
        uploaded_at: Utc::now(),
        status: "uploaded".to_string(),
    };
    tracing::info!("Registering upload {} ({})", record.id, record.filename);
    state.repo.insert_upload(&record).await?;

    Ok(Json(RegisterUploadResponse {
        success: true,
        file_id: record.id,
    }))
}

pub async fn list_uploads(
    State(state): State<AppState>,
) -> Result<Json<Vec<UploadRecord>>, ApiError> {
    tracing::info!("Listing uploads");
    Ok(Json(state.repo.list_uploads().await?))
}
