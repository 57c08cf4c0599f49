use super::data::{parse_timestamp, DataError};
use super::optimizer::OptimizationRow;
use super::types::{BacktestParameters, Metrics, PositionSide, Trade};
use rust_decimal::Decimal;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

pub const TRADES_FILE: &str = "trades.csv";
pub const METRICS_FILE: &str = "metrics.csv";
pub const OPTIMIZATION_FILE: &str = "optimization_results.csv";

/// Report files a client may download for a run.
pub const DOWNLOADABLE_FILES: [&str; 3] = [TRADES_FILE, METRICS_FILE, OPTIMIZATION_FILE];

pub const TRADE_HEADERS: [&str; 9] = [
    "Entry Time",
    "Exit Time",
    "Type",
    "Entry Price",
    "Exit Price",
    "Quantity",
    "PNL",
    "Outcome",
    "Balance After Trade",
];

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn write_trades<W: Write>(writer: W, trades: &[Trade]) -> csv::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(TRADE_HEADERS)?;

    for trade in trades {
        wtr.write_record([
            trade.entry_time.format(TIME_FORMAT).to_string(),
            trade.exit_time.format(TIME_FORMAT).to_string(),
            trade.position.as_str().to_string(),
            trade.entry_price.to_string(),
            trade.exit_price.to_string(),
            trade.quantity.to_string(),
            trade.pnl.to_string(),
            trade.exit_reason.clone(),
            trade.balance_after.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

pub fn write_metrics<W: Write>(writer: W, metrics: &Metrics) -> csv::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record([
        "Total Trades",
        "Win Rate",
        "Average Profit per Trade",
        "Total Profit",
        "Profit Percentage",
        "Max Drawdown",
        "Sharpe Ratio",
        "Average Win",
        "Average Loss",
        "Best Trade",
        "Worst Trade",
        "Ending Balance",
    ])?;
    wtr.write_record([
        metrics.total_trades.to_string(),
        metrics.win_rate.to_string(),
        metrics.avg_profit.to_string(),
        metrics.total_pnl.to_string(),
        metrics.profit_percentage.to_string(),
        metrics.max_drawdown.to_string(),
        optional(metrics.sharpe_ratio),
        metrics.avg_win.to_string(),
        metrics.avg_loss.to_string(),
        metrics.best_trade.to_string(),
        metrics.worst_trade.to_string(),
        metrics.ending_balance.to_string(),
    ])?;
    wtr.flush()?;
    Ok(())
}

pub fn write_optimization<W: Write>(writer: W, rows: &[OptimizationRow]) -> csv::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record([
        "TP_Ticks",
        "SL_Ticks",
        "Trailing_Ticks",
        "Total Profit",
        "Win Rate",
        "Sharpe Ratio",
        "Max Drawdown",
        "Total Trades",
        "Average Profit per Trade",
    ])?;

    for row in rows {
        wtr.write_record([
            row.tp_ticks.to_string(),
            row.sl_ticks.to_string(),
            row.trailing_ticks.to_string(),
            row.total_profit.to_string(),
            row.win_rate.to_string(),
            optional(row.sharpe_ratio),
            row.max_drawdown.to_string(),
            row.total_trades.to_string(),
            row.avg_profit.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Write `trades.csv` and `metrics.csv` into `dir`.
pub fn write_reports(dir: &Path, trades: &[Trade], metrics: &Metrics) -> csv::Result<()> {
    std::fs::create_dir_all(dir)?;
    write_trades(std::fs::File::create(dir.join(TRADES_FILE))?, trades)?;
    write_metrics(std::fs::File::create(dir.join(METRICS_FILE))?, metrics)?;
    Ok(())
}

/// Read trades back from the `trades.csv` layout. Exit levels are not part of
/// the file, so `sl_price` and `tp_price` are the static levels implied by
/// `params`.
pub fn read_trades<R: Read>(reader: R, params: &BacktestParameters) -> Result<Vec<Trade>, DataError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    let index_of = |name: &'static str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or(DataError::MissingColumn(name))
    };

    let mut records = rdr.records().peekable();
    // An empty result set is written without a header row.
    if records.peek().is_none() && index_of("Entry Time").is_err() {
        return Ok(Vec::new());
    }

    let [entry_time, exit_time, side, entry_price, exit_price, quantity, pnl, outcome, balance] =
        TRADE_HEADERS.map(index_of);
    let (entry_time, exit_time, side, entry_price, exit_price) =
        (entry_time?, exit_time?, side?, entry_price?, exit_price?);
    let (quantity, pnl, outcome, balance) = (quantity?, pnl?, outcome?, balance?);

    let mut trades = Vec::new();
    let mut cumulative_pnl = Decimal::ZERO;

    for record in records {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let field = |idx: usize| record.get(idx).unwrap_or_default();
        let decimal = |idx: usize, column: &'static str| {
            Decimal::from_str(field(idx))
                .or_else(|_| Decimal::from_scientific(field(idx)))
                .map_err(|_| DataError::InvalidValue {
                    line,
                    column,
                    value: field(idx).to_string(),
                })
        };
        let time = |idx: usize| {
            parse_timestamp(field(idx)).ok_or_else(|| DataError::InvalidTimestamp {
                line,
                value: field(idx).to_string(),
            })
        };

        let position = match field(side).to_ascii_lowercase().as_str() {
            "long" => PositionSide::Long,
            "short" => PositionSide::Short,
            other => {
                return Err(DataError::InvalidValue {
                    line,
                    column: "Type",
                    value: other.to_string(),
                })
            }
        };

        let entry = decimal(entry_price, "Entry Price")?;
        let (sl_price, tp_price) = match position {
            PositionSide::Long => (entry - params.ticks(params.sl_ticks), entry + params.ticks(params.tp_ticks)),
            PositionSide::Short => (entry + params.ticks(params.sl_ticks), entry - params.ticks(params.tp_ticks)),
        };
        let trade_pnl = decimal(pnl, "PNL")?;
        cumulative_pnl += trade_pnl;

        trades.push(Trade {
            position,
            entry_time: time(entry_time)?,
            exit_time: time(exit_time)?,
            entry_price: entry,
            exit_price: decimal(exit_price, "Exit Price")?,
            sl_price,
            tp_price,
            quantity: decimal(quantity, "Quantity")?,
            pnl: trade_pnl,
            exit_reason: field(outcome).to_string(),
            cumulative_pnl,
            balance_after: decimal(balance, "Balance After Trade")?,
        });
    }

    Ok(trades)
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
