use super::{compare, BacktestSummary, Comparison};
use crate::error::ApiError;
use crate::storage::BacktestRecord;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub base: String,
    pub other: String,
}

pub async fn list_history(
    State(state): State<AppState>,
) -> Result<Json<Vec<BacktestSummary>>, ApiError> {
    tracing::info!("Listing backtest history");
    let records = state.repo.list_backtests().await?;
    Ok(Json(records.iter().map(BacktestSummary::from).collect()))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BacktestRecord>, ApiError> {
    tracing::info!("Getting backtest: {}", id);
    Ok(Json(load(&state, &id).await?))
}

pub async fn compare_backtests(
    State(state): State<AppState>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<Comparison>, ApiError> {
    tracing::info!("Comparing backtests {} and {}", query.base, query.other);
    let base = load(&state, &query.base).await?;
    let other = load(&state, &query.other).await?;
    Ok(Json(compare(&base, &other)))
}

async fn load(state: &AppState, raw_id: &str) -> Result<BacktestRecord, ApiError> {
    let id = Uuid::parse_str(raw_id.trim())
        .map_err(|_| ApiError::BadRequest("Invalid backtest ID".to_string()))?;
    state
        .repo
        .get_backtest(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Backtest not found".to_string()))
}
