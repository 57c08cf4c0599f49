//! Command-line entry point for the backtest engine.
//!
//! ```bash
//! # Single run with default parameters, reports into ./results
//! backtest run --data es_1min.csv
//!
//! # Parameters from a JSON file, with candlestick charts
//! backtest run --data es_1min.csv --config params.json --out out/ --plots
//!
//! # Grid search
//! backtest optimize --data es_1min.csv --tp 10,20,30 --sl 10,20 --trailing 0,5
//! ```

use anyhow::Context;
use backtest_studio::orchestrator::data::load_csv;
use backtest_studio::orchestrator::export::{write_optimization, write_reports, OPTIMIZATION_FILE};
use backtest_studio::orchestrator::plots::write_trade_charts;
use backtest_studio::orchestrator::{optimize, BacktestEngine, BacktestParameters, OptimizationGrid};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "backtest")]
#[command(about = "EMA pullback backtester for futures OHLC data", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backtest and write trades.csv / metrics.csv
    Run {
        /// OHLC CSV file
        #[arg(short, long)]
        data: PathBuf,

        /// JSON file with strategy parameters (omitted fields use defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = "results")]
        out: PathBuf,

        /// Write candlestick charts
        #[arg(long)]
        plots: bool,
    },

    /// Grid search over take-profit / stop-loss / trailing ticks
    Optimize {
        /// OHLC CSV file
        #[arg(short, long)]
        data: PathBuf,

        /// JSON file with the base parameters
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Take-profit ticks (comma separated)
        #[arg(long, value_delimiter = ',', required = true)]
        tp: Vec<u32>,

        /// Stop-loss ticks (comma separated)
        #[arg(long, value_delimiter = ',', required = true)]
        sl: Vec<u32>,

        /// Trailing stop ticks, 0 = off (comma separated)
        #[arg(long, value_delimiter = ',', default_value = "0")]
        trailing: Vec<u32>,

        /// Output directory
        #[arg(short, long, default_value = "results")]
        out: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backtest_studio=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data,
            config,
            out,
            plots,
        } => {
            let mut params = load_parameters(config.as_deref())?;
            params.generate_plots |= plots;
            run(&data, params, &out)
        }
        Commands::Optimize {
            data,
            config,
            tp,
            sl,
            trailing,
            out,
        } => {
            let params = load_parameters(config.as_deref())?;
            let grid = OptimizationGrid {
                tp_ticks: tp,
                sl_ticks: sl,
                trailing_ticks: trailing,
            };
            run_optimization(&data, params, grid, &out)
        }
    }
}

fn load_parameters(path: Option<&Path>) -> anyhow::Result<BacktestParameters> {
    let Some(path) = path else {
        return Ok(BacktestParameters::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

fn run(data: &Path, params: BacktestParameters, out: &Path) -> anyhow::Result<()> {
    let engine = BacktestEngine::new(params)?;
    let series = load_csv(data).with_context(|| format!("Failed to load {}", data.display()))?;
    info!("Loaded {} candles from {}", series.len(), data.display());

    let prepared = engine.prepare(&series);
    let output = engine.run_prepared(&prepared, None)?;

    std::fs::create_dir_all(out)?;
    write_reports(out, &output.trades, &output.metrics)?;
    info!("Reports written to {}", out.display());

    if engine.parameters().generate_plots {
        let files = write_trade_charts(
            prepared.candles,
            &prepared.ema,
            &output.trades,
            engine.parameters().months_per_plot,
            out,
        )?;
        info!("{} charts written", files.len());
    }

    println!("{}", serde_json::to_string_pretty(&output.metrics)?);
    Ok(())
}

fn run_optimization(
    data: &Path,
    params: BacktestParameters,
    grid: OptimizationGrid,
    out: &Path,
) -> anyhow::Result<()> {
    grid.validate()?;
    let engine = BacktestEngine::new(params)?;
    let series = load_csv(data).with_context(|| format!("Failed to load {}", data.display()))?;
    info!(
        "Optimizing {} combinations over {} candles",
        grid.size(),
        series.len()
    );

    let prepared = engine.prepare(&series);
    let report = optimize(&prepared, engine.parameters(), &grid, None)?;

    std::fs::create_dir_all(out)?;
    let path = out.join(OPTIMIZATION_FILE);
    write_optimization(std::fs::File::create(&path)?, &report.results)?;
    info!(
        "{} of {} combinations traded, results in {}",
        report.results.len(),
        report.evaluated,
        path.display()
    );

    match &report.best {
        Some(best) => println!("{}", serde_json::to_string_pretty(best)?),
        None => println!("No combination produced trades"),
    }
    Ok(())
}
