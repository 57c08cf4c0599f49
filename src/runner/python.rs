use super::{chart_url, local_input, BacktestJob, BacktestRunner, RunOutcome, RunnerError};
use crate::orchestrator::chart_data::build_chart_data;
use crate::orchestrator::export::{read_trades, TRADES_FILE};
use crate::orchestrator::metrics::compute_metrics;
use crate::orchestrator::types::BacktestParameters;
use crate::orchestrator::EngineError;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const CONFIG_FILE: &str = "backtest_config.json";
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Config file handed to the script: the strategy parameters plus the data path.
#[derive(Serialize)]
struct ScriptConfig<'a> {
    #[serde(flatten)]
    parameters: &'a BacktestParameters,
    filepath: &'a Path,
}

/// Runs the backtest script as a child process inside the run directory.
pub struct PythonRunner {
    python_bin: String,
    script: PathBuf,
    timeout: Duration,
    http: reqwest::Client,
}

impl PythonRunner {
    pub fn new(python_bin: String, script: PathBuf, timeout: Duration, http: reqwest::Client) -> Self {
        Self {
            python_bin,
            script,
            timeout,
            http,
        }
    }

    async fn execute(&self, job: &BacktestJob, config_path: &Path) -> Result<String, RunnerError> {
        let mut cmd = Command::new(&self.python_bin);
        cmd.arg(&self.script)
            .arg(config_path)
            .current_dir(&job.run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            "Running: {} {} {}",
            self.python_bin,
            self.script.display(),
            config_path.display()
        );

        let child = cmd
            .spawn()
            .map_err(|e| RunnerError::Process(format!("failed to start {}: {}", self.python_bin, e)))?;

        // Dropping the future drops the child, which kills it.
        let output = child.wait_with_output();
        tokio::pin!(output);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(CANCEL_POLL);

        let output = loop {
            tokio::select! {
                result = &mut output => break result?,
                _ = &mut deadline => {
                    tracing::error!("Backtest {} exceeded {:?}, killing process", job.run_id, self.timeout);
                    return Err(RunnerError::Timeout(self.timeout.as_secs()));
                }
                _ = poll.tick() => {
                    if job.control.is_cancelled() {
                        tracing::info!("Backtest {} cancelled, killing process", job.run_id);
                        return Err(EngineError::Cancelled.into());
                    }
                }
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                "Backtest script exited with {:?}: {}",
                output.status.code(),
                stderr
            );
            return Err(RunnerError::Process(last_lines(&stderr, 5)));
        }

        Ok(stdout)
    }
}

#[async_trait]
impl BacktestRunner for PythonRunner {
    fn name(&self) -> &'static str {
        "python"
    }

    async fn run(&self, job: &BacktestJob) -> Result<RunOutcome, RunnerError> {
        job.parameters.validate().map_err(EngineError::InvalidParameters)?;
        tokio::fs::create_dir_all(&job.run_dir).await?;

        let input = local_input(&self.http, &job.source, &job.run_dir, &job.download).await?;
        let canonical = tokio::fs::canonicalize(&input).await;
        let input = canonical.unwrap_or(input);

        let config = ScriptConfig {
            parameters: &job.parameters,
            filepath: &input,
        };
        let config_path = job.run_dir.join(CONFIG_FILE);
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config)?).await?;

        let stdout = self.execute(job, &config_path).await?;
        match final_stats(&stdout) {
            Some(stats) => tracing::info!("Script stats for {}: {}", job.run_id, stats),
            None => tracing::debug!("Script output: {}", stdout),
        }

        let trades_path = job.run_dir.join(TRADES_FILE);
        let report = tokio::fs::read(&trades_path).await.map_err(|e| {
            RunnerError::Process(format!("script did not write {}: {}", TRADES_FILE, e))
        })?;
        let trades = read_trades(&report[..], &job.parameters)
            .map_err(|e| RunnerError::Process(format!("unreadable {}: {}", TRADES_FILE, e)))?;

        let metrics = compute_metrics(&trades, job.parameters.starting_balance);
        let chart_data = build_chart_data(&trades, job.parameters.starting_balance);
        let chart_files = html_files(&job.run_dir)
            .await?
            .iter()
            .map(|file| chart_url(job.run_id, file))
            .collect();

        job.control.set_progress(100.0);

        Ok(RunOutcome {
            trades,
            metrics,
            chart_data: Some(chart_data),
            chart_files,
        })
    }
}

/// The last stdout line that parses as a JSON object.
fn final_stats(stdout: &str) -> Option<serde_json::Value> {
    stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .find(|value| value.is_object())
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "process exited with an error".to_string()
    } else {
        tail
    }
}

async fn html_files(dir: &Path) -> Result<Vec<String>, RunnerError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".html") {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_stats_picks_last_json_object() {
        let stdout = "Loading config from: c.json\nStarting backtest...\n{\"Total Trades\": 3}\nBacktest completed!\n";
        let stats = final_stats(stdout).unwrap();
        assert_eq!(stats["Total Trades"], 3);
        assert!(final_stats("no json here\n42\n").is_none());
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\n\nc\n", 2), "b\nc");
        assert_eq!(last_lines("", 3), "process exited with an error");
    }

    #[test]
    fn test_config_flattens_parameters() {
        let params = BacktestParameters::default();
        let config = ScriptConfig {
            parameters: &params,
            filepath: Path::new("/data/nq.csv"),
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["filepath"], "/data/nq.csv");
        assert_eq!(value["tp_ticks"], 20);
        assert_eq!(value["risk_percentage"], 1.0);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::orchestrator::types::RunControl;
        use crate::runner::{DataSource, DownloadLimits};
        use uuid::Uuid;

        /// Shell stand-in for the backtest script: writes a one-trade report.
        const FAKE_SCRIPT: &str = r#"
echo "Starting backtest..."
printf 'Entry Time,Exit Time,Type,Entry Price,Exit Price,Quantity,PNL,Outcome,Balance After Trade\n' > trades.csv
printf '2024-01-02 09:34:00,2024-01-02 09:36:00,long,101.0,106.0,1,85.0,TP,100085.0\n' >> trades.csv
echo '{"Total Trades": 1}'
"#;

        fn job(dir: &Path) -> BacktestJob {
            let data = dir.join("data.csv");
            std::fs::write(&data, "date_time,open,high,low,close\n").unwrap();
            BacktestJob {
                run_id: Uuid::new_v4(),
                source: DataSource::Local(data),
                parameters: BacktestParameters::default(),
                run_dir: dir.join("run"),
                control: RunControl::new(),
                download: DownloadLimits::default(),
            }
        }

        fn runner(script: PathBuf, timeout: Duration) -> PythonRunner {
            PythonRunner::new("sh".to_string(), script, timeout, reqwest::Client::new())
        }

        #[tokio::test]
        async fn test_reads_script_report() {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("fake.sh");
            std::fs::write(&script, FAKE_SCRIPT).unwrap();
            let job = job(dir.path());

            let outcome = runner(script, Duration::from_secs(30)).run(&job).await.unwrap();
            assert_eq!(outcome.trades.len(), 1);
            assert_eq!(outcome.metrics.total_pnl, 85.0);
            assert!(job.run_dir.join(CONFIG_FILE).exists());
        }

        #[tokio::test]
        async fn test_missing_trade_report_is_a_process_error() {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("quiet.sh");
            std::fs::write(&script, "echo 'Backtest completed!'\n").unwrap();

            let result = runner(script, Duration::from_secs(30)).run(&job(dir.path())).await;
            match result {
                Err(RunnerError::Process(msg)) => assert!(msg.contains(TRADES_FILE)),
                other => panic!("unexpected result: {:?}", other.map(|o| o.trades.len())),
            }
        }

        #[tokio::test]
        async fn test_failing_script_reports_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("fail.sh");
            std::fs::write(&script, "echo 'KeyError: close' >&2\nexit 3\n").unwrap();

            let result = runner(script, Duration::from_secs(30)).run(&job(dir.path())).await;
            match result {
                Err(RunnerError::Process(msg)) => assert!(msg.contains("KeyError: close")),
                other => panic!("unexpected result: {:?}", other.map(|o| o.trades.len())),
            }
        }

        #[tokio::test]
        async fn test_slow_script_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("slow.sh");
            std::fs::write(&script, "sleep 10\n").unwrap();

            let result = runner(script, Duration::from_millis(200)).run(&job(dir.path())).await;
            assert!(matches!(result, Err(RunnerError::Timeout(_))));
        }

        #[tokio::test]
        async fn test_cancel_kills_script() {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("slow.sh");
            std::fs::write(&script, "sleep 10\n").unwrap();
            let job = job(dir.path());
            job.control.cancel();

            let result = runner(script, Duration::from_secs(30)).run(&job).await;
            assert!(matches!(
                result,
                Err(RunnerError::Engine(EngineError::Cancelled))
            ));
        }
    }
}
