use super::data::load_csv;
use super::export::{write_optimization, OPTIMIZATION_FILE};
use super::service::{execute_backtest, resolve_source, ResolvedSource};
use super::types::{
    BacktestParameters, BacktestRegistry, BacktestResults, BacktestState, RunControl, RunStatus,
};
use super::{optimize, BacktestEngine, OptimizationGrid, OptimizationRow};
use crate::error::ApiError;
use crate::runner::{local_input, DownloadLimits};
use crate::storage::BacktestRecord;
use crate::AppState;
use axum::{
    extract::{ws::Message, ws::WebSocket, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{self, Duration};
use uuid::Uuid;

/// How long a finished run stays in the registry. Completed runs are still
/// reported from storage afterwards.
const FINISHED_RUN_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBacktestRequest {
    pub file_id: Option<String>,
    pub file_url: Option<String>,
    /// Saved preset to use when `parameters` is omitted.
    pub preset: Option<String>,
    pub parameters: Option<BacktestParameters>,
}

#[derive(Debug, Serialize)]
pub struct BacktestRunResponse {
    pub id: Uuid,
    #[serde(flatten)]
    pub results: BacktestResults,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBacktestRequest {
    #[serde(default)]
    pub parameters: Value,
    pub results: BacktestResults,
    pub file_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SaveBacktestResponse {
    pub success: bool,
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct BacktestResponse {
    pub backtest_id: Uuid,
    pub status: RunStatus,
}

#[derive(Debug, Serialize)]
pub struct BacktestStatus {
    pub backtest_id: Uuid,
    pub status: RunStatus,
    pub progress: f64,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRequest {
    pub file_id: Option<String>,
    pub file_url: Option<String>,
    #[serde(default)]
    pub parameters: BacktestParameters,
    pub grid: OptimizationGrid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeResponse {
    pub id: Uuid,
    pub best: Option<OptimizationRow>,
    pub results: Vec<OptimizationRow>,
    pub evaluated: usize,
    pub download_link: String,
}

async fn prepare_run(
    state: &AppState,
    payload: &RunBacktestRequest,
) -> Result<(ResolvedSource, BacktestParameters), ApiError> {
    let parameters = match (&payload.parameters, &payload.preset) {
        (Some(parameters), _) => parameters.clone(),
        (None, Some(name)) => state.presets.get(name).await?.parameters,
        (None, None) => BacktestParameters::default(),
    };
    parameters.validate().map_err(ApiError::BadRequest)?;

    let resolved = resolve_source(
        state,
        payload.file_id.as_deref(),
        payload.file_url.as_deref(),
    )
    .await?;
    Ok((resolved, parameters))
}

/// Run a backtest and wait for its results.
pub async fn run_backtest_sync(
    State(state): State<AppState>,
    Json(payload): Json<RunBacktestRequest>,
) -> Result<Json<BacktestRunResponse>, ApiError> {
    tracing::info!("Running backtest (fileId: {:?})", payload.file_id);

    let (resolved, parameters) = prepare_run(&state, &payload).await?;
    let run_id = Uuid::new_v4();
    let record =
        execute_backtest(&state, run_id, resolved, parameters, RunControl::new()).await?;

    Ok(Json(BacktestRunResponse {
        id: record.id,
        results: record.results,
    }))
}

/// Store results computed elsewhere.
pub async fn save_backtest(
    State(state): State<AppState>,
    Json(payload): Json<SaveBacktestRequest>,
) -> Result<Json<SaveBacktestResponse>, ApiError> {
    let record = BacktestRecord {
        id: Uuid::new_v4(),
        file_id: None,
        file_url: payload.file_url,
        parameters: payload.parameters,
        results: payload.results,
        runner: "client".to_string(),
        created_at: Utc::now(),
    };
    tracing::info!("Saving backtest {}", record.id);

    state.repo.insert_backtest(&record).await?;

    Ok(Json(SaveBacktestResponse {
        success: true,
        id: record.id,
    }))
}

/// Start a backtest in the background and return its id.
pub async fn run_backtest(
    State(state): State<AppState>,
    Json(payload): Json<RunBacktestRequest>,
) -> Result<Json<BacktestResponse>, ApiError> {
    let (resolved, parameters) = prepare_run(&state, &payload).await?;

    let backtest_id = Uuid::new_v4();
    let control = RunControl::new();
    tracing::info!("Starting background backtest {}", backtest_id);

    state.backtests.write().await.insert(
        backtest_id,
        BacktestState {
            status: RunStatus::Running,
            error: None,
            control: control.clone(),
        },
    );

    tokio::spawn(async move {
        let result =
            execute_backtest(&state, backtest_id, resolved, parameters, control.clone()).await;

        {
            let mut registry = state.backtests.write().await;
            let Some(entry) = registry.get_mut(&backtest_id) else {
                return;
            };
            finish_run(backtest_id, entry, &control, result.map(|_| ()));
        }

        evict_after(&state.backtests, backtest_id, FINISHED_RUN_TTL).await;
    });

    Ok(Json(BacktestResponse {
        backtest_id,
        status: RunStatus::Running,
    }))
}

fn finish_run(
    backtest_id: Uuid,
    entry: &mut BacktestState,
    control: &RunControl,
    result: Result<(), ApiError>,
) {
    match result {
        Ok(()) => {
            entry.status = RunStatus::Completed;
            control.set_progress(100.0);
            tracing::info!("Backtest {} completed successfully", backtest_id);
        }
        Err(_) if control.is_cancelled() => {
            entry.status = RunStatus::Cancelled;
            tracing::info!("Backtest {} cancelled", backtest_id);
        }
        Err(e) => {
            tracing::error!("Backtest {} failed: {}", backtest_id, e);
            entry.status = RunStatus::Failed;
            entry.error = Some(e.to_string());
        }
    }
}

/// Drop a finished run from the registry once `ttl` has passed.
async fn evict_after(registry: &BacktestRegistry, backtest_id: Uuid, ttl: Duration) {
    time::sleep(ttl).await;
    let mut registry = registry.write().await;
    if registry
        .get(&backtest_id)
        .is_some_and(|entry| entry.status.is_terminal())
    {
        registry.remove(&backtest_id);
        tracing::debug!("Evicted finished backtest {}", backtest_id);
    }
}

pub async fn get_backtest_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BacktestStatus>, ApiError> {
    tracing::info!("Getting status for backtest: {}", id);

    if let Some(entry) = state.backtests.read().await.get(&id).cloned() {
        return Ok(Json(BacktestStatus {
            backtest_id: id,
            status: entry.status,
            progress: entry.control.progress(),
            error: entry.error,
        }));
    }

    // Evicted, or finished before a restart
    if state.repo.get_backtest(id).await?.is_some() {
        return Ok(Json(BacktestStatus {
            backtest_id: id,
            status: RunStatus::Completed,
            progress: 100.0,
            error: None,
        }));
    }

    Err(ApiError::NotFound("Backtest not found".to_string()))
}

pub async fn cancel_backtest(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    tracing::info!("Cancelling backtest: {}", id);

    let mut registry = state.backtests.write().await;
    if let Some(entry) = registry.get_mut(&id) {
        if !entry.status.is_terminal() {
            entry.status = RunStatus::Cancelling;
            entry.control.cancel();
        }
        return Ok(StatusCode::OK);
    }

    Err(StatusCode::NOT_FOUND)
}

pub async fn backtest_websocket(
    ws: WebSocketUpgrade,
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_backtest_socket(socket, id, state))
}

async fn handle_backtest_socket(mut socket: WebSocket, backtest_id: Uuid, state: AppState) {
    tracing::info!("WebSocket connected for backtest: {}", backtest_id);

    let mut interval = time::interval(Duration::from_millis(500));

    loop {
        interval.tick().await;

        let Some(entry) = state.backtests.read().await.get(&backtest_id).cloned() else {
            break;
        };

        let payload = serde_json::json!({
            "type": "progress",
            "backtest_id": backtest_id,
            "status": entry.status,
            "progress": entry.control.progress(),
            "error": entry.error,
        })
        .to_string();

        if let Err(e) = socket.send(Message::Text(payload)).await {
            tracing::error!("Failed to send WebSocket message: {}", e);
            break;
        }

        if entry.status.is_terminal() {
            break;
        }
    }
}

/// Grid search over TP / SL / trailing ticks with the in-process engine.
pub async fn optimize_parameters(
    State(state): State<AppState>,
    Json(payload): Json<OptimizeRequest>,
) -> Result<Json<OptimizeResponse>, ApiError> {
    payload.grid.validate()?;
    let engine = BacktestEngine::new(payload.parameters)?;
    let resolved = resolve_source(
        &state,
        payload.file_id.as_deref(),
        payload.file_url.as_deref(),
    )
    .await?;

    let id = Uuid::new_v4();
    let run_dir = state.settings.results_dir().join(id.to_string());
    tracing::info!(
        "Optimization {} over {} combinations",
        id,
        payload.grid.size()
    );

    let limits = DownloadLimits::from_settings(&state.settings);
    let input = local_input(&state.http, &resolved.source, &run_dir, &limits).await?;
    let grid = payload.grid;
    let dir = run_dir.clone();

    let report = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        let series = load_csv(&input)?;
        let prepared = engine.prepare(&series);
        let report = optimize(&prepared, engine.parameters(), &grid, None)?;

        std::fs::create_dir_all(&dir)
            .map_err(|e| ApiError::Internal(format!("Failed to create run directory: {}", e)))?;
        let file = std::fs::File::create(dir.join(OPTIMIZATION_FILE))
            .map_err(|e| ApiError::Internal(format!("Failed to write results: {}", e)))?;
        write_optimization(file, &report.results)
            .map_err(|e| ApiError::Internal(format!("Failed to write results: {}", e)))?;
        Ok(report)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Optimization task failed: {}", e)))??;

    Ok(Json(OptimizeResponse {
        id,
        best: report.best,
        results: report.results,
        evaluated: report.evaluated,
        download_link: format!("/api/download?id={}&file={}", id, OPTIMIZATION_FILE),
    }))
}
