use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod presets;
pub mod reports;
pub mod runner;
pub mod storage;
pub mod uploads;

use config::Settings;
use presets::PresetStore;
use runner::BacktestRunner;
use storage::Repository;

// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub repo: Repository,
    pub runner: Arc<dyn BacktestRunner>,
    pub backtests: orchestrator::BacktestRegistry,
    pub presets: PresetStore,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        settings: Settings,
        repo: Repository,
        runner: Arc<dyn BacktestRunner>,
        http: reqwest::Client,
    ) -> Self {
        let presets = PresetStore::new(settings.strategies_dir());
        Self {
            settings: Arc::new(settings),
            repo,
            runner,
            backtests: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            presets,
            http,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    runner: String,
    storage: String,
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runner: state.runner.name().to_string(),
        storage: state.repo.backend().to_string(),
    })
}

/// All API routes. CORS is applied by the binary.
pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.max_upload_bytes;

    Router::new()
        .route("/health", get(health_check))
        // Data files
        .route("/api/upload", post(uploads::handlers::upload_file))
        .route(
            "/api/uploads",
            get(uploads::handlers::list_uploads).post(uploads::handlers::register_upload),
        )
        // Backtests
        .route(
            "/api/backtest",
            post(orchestrator::handlers::run_backtest_sync),
        )
        .route(
            "/api/backtest/save",
            post(orchestrator::handlers::save_backtest),
        )
        .route(
            "/api/backtest/run",
            post(orchestrator::handlers::run_backtest),
        )
        .route(
            "/api/backtest/:id/status",
            get(orchestrator::handlers::get_backtest_status),
        )
        .route(
            "/api/backtest/:id/cancel",
            post(orchestrator::handlers::cancel_backtest),
        )
        .route(
            "/ws/backtest/:id",
            get(orchestrator::handlers::backtest_websocket),
        )
        .route(
            "/api/optimize",
            post(orchestrator::handlers::optimize_parameters),
        )
        // History
        .route("/api/history", get(history::handlers::list_history))
        .route("/api/history/:id", get(history::handlers::get_history))
        .route("/api/compare", get(history::handlers::compare_backtests))
        // Reports and charts
        .route("/api/download", get(reports::download_report))
        .route("/api/charts/:id/:filename", get(reports::serve_chart))
        .route("/api/chart-proxy", get(reports::chart_proxy))
        // Parameter presets
        .route(
            "/api/strategies",
            get(presets::handlers::list_strategies),
        )
        .route(
            "/api/strategies/:name",
            get(presets::handlers::get_strategy).post(presets::handlers::save_strategy),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
