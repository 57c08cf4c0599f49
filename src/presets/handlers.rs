use super::PresetInfo;
use crate::error::ApiError;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

pub async fn list_strategies(
    State(state): State<AppState>,
) -> Result<Json<Vec<PresetInfo>>, ApiError> {
    tracing::info!("Listing strategies");
    Ok(Json(state.presets.list().await?))
}

pub async fn get_strategy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!("Getting strategy: {}", name);
    let yaml = state.presets.get_raw(&name).await?;
    Ok(([(header::CONTENT_TYPE, "application/yaml")], yaml))
}

pub async fn save_strategy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!("Saving strategy: {}", name);
    state.presets.save(&name, &body).await?;
    Ok(StatusCode::OK)
}
