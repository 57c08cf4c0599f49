use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{0} is required when BACKTEST_RUNNER={1}")]
    Missing(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Native,
    Python,
    Remote,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Native => "native",
            RunnerKind::Python => "python",
            RunnerKind::Remote => "remote",
        }
    }
}

impl FromStr for RunnerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(RunnerKind::Native),
            "python" => Ok(RunnerKind::Python),
            "remote" => Ok(RunnerKind::Remote),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub runner: RunnerKind,
    pub python_bin: String,
    pub python_script: PathBuf,
    pub backtest_api_url: Option<String>,
    pub runner_timeout: Duration,
    pub max_upload_bytes: usize,
    /// Hosts the chart proxy may fetch from. Empty allows any http(s) host.
    pub chart_proxy_hosts: Vec<String>,
    /// Hosts a run may download its data file from. Empty allows any http(s) host.
    pub data_url_hosts: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3001,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            data_dir: default_data_dir(),
            database_url: None,
            runner: RunnerKind::Native,
            python_bin: "python3".to_string(),
            python_script: PathBuf::from("trail_backtesting.py"),
            backtest_api_url: None,
            runner_timeout: Duration::from_secs(900),
            max_upload_bytes: 512 * 1024 * 1024,
            chart_proxy_hosts: Vec::new(),
            data_url_hosts: Vec::new(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment. Call `dotenvy::dotenv()` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let allowed_origins = var("ALLOWED_ORIGINS")
            .or_else(|| var("FRONTEND_URL"))
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.allowed_origins);

        let runner = match var("BACKTEST_RUNNER") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "BACKTEST_RUNNER",
                value: raw,
            })?,
            None => defaults.runner,
        };

        let backtest_api_url = var("BACKTEST_API_URL").map(|url| url.trim_end_matches('/').to_string());
        if runner == RunnerKind::Remote && backtest_api_url.is_none() {
            return Err(ConfigError::Missing("BACKTEST_API_URL", "remote"));
        }

        let max_upload_bytes = match var("MAX_UPLOAD_MB") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|mb| mb.checked_mul(1024 * 1024))
                .ok_or(ConfigError::Invalid {
                    name: "MAX_UPLOAD_MB",
                    value: raw,
                })?,
            None => defaults.max_upload_bytes,
        };

        Ok(Settings {
            port: parse_var(&var, "PORT")?.unwrap_or(defaults.port),
            allowed_origins,
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            database_url: var("DATABASE_URL"),
            runner,
            python_bin: var("PYTHON_BIN").unwrap_or(defaults.python_bin),
            python_script: var("PYTHON_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or(defaults.python_script),
            backtest_api_url,
            runner_timeout: parse_var(&var, "RUNNER_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.runner_timeout),
            max_upload_bytes,
            chart_proxy_hosts: var("CHART_PROXY_HOSTS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            data_url_hosts: var("DATA_URL_HOSTS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
        })
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn strategies_dir(&self) -> PathBuf {
        self.data_dir.join("strategies")
    }
}

/// Case-insensitive host allowlist check. An empty list allows every host.
pub fn host_allowed(allowed: &[String], host: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|h| h.eq_ignore_ascii_case(host))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("backtest-studio"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_var<T, F>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(None),
    }
}
