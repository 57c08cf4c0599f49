use axum::http::{HeaderValue, Method};
use backtest_studio::config::{RunnerKind, Settings};
use backtest_studio::runner::{BacktestRunner, NativeRunner, PythonRunner, RemoteRunner};
use backtest_studio::storage::{DocumentStore, FileStore, PgStore, Repository};
use backtest_studio::{router, AppState};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backtest_studio=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Backtest Studio API server...");

    let settings = Settings::from_env()?;
    std::fs::create_dir_all(&settings.data_dir)?;
    info!("Data directory: {}", settings.data_dir.display());

    let store = open_store(&settings).await;
    let http = reqwest::Client::builder()
        .user_agent(concat!("backtest-studio/", env!("CARGO_PKG_VERSION")))
        .build()?;
    info!("Backtest runner: {}", settings.runner.as_str());
    let runner = build_runner(&settings, http.clone())?;

    let port = settings.port;
    let allowed_origins = settings.allowed_origins.clone();
    let state = AppState::new(settings, Repository::new(store), runner, http);

    // Configure CORS (lock to configured origins)
    let origin_values: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(origin_values)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = router(state).layer(cors);

    let addr = format!("0.0.0.0:{}", port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn open_store(settings: &Settings) -> Arc<dyn DocumentStore> {
    if let Some(database_url) = &settings.database_url {
        info!(
            "Attempting database connection: {}",
            database_url.split('@').last().unwrap_or("localhost")
        );

        match PgStore::connect(database_url).await {
            Ok(store) => {
                info!("Database connected successfully");
                return Arc::new(store);
            }
            Err(e) => {
                error!(
                    "Failed to connect to database: {}. Continuing without database...",
                    e
                );
            }
        }
    }

    let root = settings.db_dir();
    info!("Storing documents under {}", root.display());
    Arc::new(FileStore::new(root))
}

fn build_runner(
    settings: &Settings,
    http: reqwest::Client,
) -> anyhow::Result<Arc<dyn BacktestRunner>> {
    let runner: Arc<dyn BacktestRunner> = match settings.runner {
        RunnerKind::Native => Arc::new(NativeRunner::new(http)),
        RunnerKind::Python => {
            if !settings.python_script.exists() {
                warn!(
                    "Backtest script {} does not exist yet",
                    settings.python_script.display()
                );
            }
            Arc::new(PythonRunner::new(
                settings.python_bin.clone(),
                std::fs::canonicalize(&settings.python_script)
                    .unwrap_or_else(|_| settings.python_script.clone()),
                settings.runner_timeout,
                http,
            ))
        }
        RunnerKind::Remote => {
            let base_url = settings
                .backtest_api_url
                .clone()
                .ok_or_else(|| {
                    anyhow::anyhow!("BACKTEST_API_URL is required for the remote runner")
                })?;
            Arc::new(RemoteRunner::new(base_url, settings.runner_timeout, http))
        }
    };
    Ok(runner)
}
