use super::types::{Candle, PositionSide, Trade};
use chrono::{Months, NaiveDateTime};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::path::Path;

const PLOTLY_CDN: &str = "https://cdn.plot.ly/plotly-2.35.2.min.js";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Write one candlestick chart per `months_per_plot` window, starting at the
/// first bar. Returns the file names written, in order.
pub fn write_trade_charts(
    candles: &[Candle],
    ema: &[Decimal],
    trades: &[Trade],
    months_per_plot: u32,
    output_dir: &Path,
) -> std::io::Result<Vec<String>> {
    let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
        return Ok(Vec::new());
    };

    std::fs::create_dir_all(output_dir)?;

    let months = Months::new(months_per_plot.max(1));
    let end = last.time;
    let mut window_start = first.time;
    let mut files = Vec::new();

    while window_start < end {
        let Some(window_end) = window_start.checked_add_months(months) else {
            break;
        };

        let filename = format!("strategy_candles_{:03}.html", files.len() + 1);
        let html = render_window(candles, ema, trades, window_start, window_end);
        std::fs::write(output_dir.join(&filename), html)?;
        tracing::debug!("Saved chart: {}", filename);

        files.push(filename);
        window_start = window_end;
    }

    tracing::info!("Wrote {} chart files to {}", files.len(), output_dir.display());
    Ok(files)
}

fn render_window(
    candles: &[Candle],
    ema: &[Decimal],
    trades: &[Trade],
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> String {
    let in_window = |t: NaiveDateTime| t >= start && t < end;

    let mut times = Vec::new();
    let (mut open, mut high, mut low, mut close, mut ema_line) =
        (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());

    for (candle, ema_value) in candles.iter().zip(ema) {
        if !in_window(candle.time) {
            continue;
        }
        times.push(candle.time.format(TIME_FORMAT).to_string());
        open.push(num(candle.open));
        high.push(num(candle.high));
        low.push(num(candle.low));
        close.push(num(candle.close));
        ema_line.push(num(*ema_value));
    }

    let window_trades: Vec<&Trade> = trades.iter().filter(|t| in_window(t.entry_time)).collect();

    let mut traces = vec![
        json!({
            "type": "candlestick",
            "name": "Candles",
            "x": times,
            "open": open,
            "high": high,
            "low": low,
            "close": close,
        }),
        json!({
            "type": "scatter",
            "mode": "lines",
            "name": "EMA",
            "x": times,
            "y": ema_line,
            "line": { "color": "orange", "width": 1 },
        }),
    ];

    for (side, color, symbol) in [
        (PositionSide::Long, "green", "arrow-up"),
        (PositionSide::Short, "red", "arrow-down"),
    ] {
        let entries: Vec<&&Trade> = window_trades.iter().filter(|t| t.position == side).collect();
        if entries.is_empty() {
            continue;
        }
        traces.push(json!({
            "type": "scatter",
            "mode": "markers",
            "name": format!("Entry ({})", side.as_str()),
            "x": entries.iter().map(|t| t.entry_time.format(TIME_FORMAT).to_string()).collect::<Vec<_>>(),
            "y": entries.iter().map(|t| num(t.entry_price)).collect::<Vec<_>>(),
            "marker": { "color": color, "size": 10, "symbol": symbol },
        }));
    }

    if !window_trades.is_empty() {
        traces.push(json!({
            "type": "scatter",
            "mode": "markers",
            "name": "Exit",
            "x": window_trades.iter().map(|t| t.exit_time.format(TIME_FORMAT).to_string()).collect::<Vec<_>>(),
            "y": window_trades.iter().map(|t| num(t.exit_price)).collect::<Vec<_>>(),
            "marker": { "color": "blue", "size": 8, "symbol": "x" },
        }));
    }

    let layout = json!({
        "title": format!(
            "Strategy Backtest ({} to {})",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ),
        "xaxis": { "title": "Time", "rangeslider": { "visible": false } },
        "yaxis": { "title": "Price" },
        "template": "plotly_dark",
        "paper_bgcolor": "#111111",
        "plot_bgcolor": "#111111",
        "font": { "color": "#f2f5fa" },
    });

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Strategy Backtest</title>
<script src="{cdn}"></script>
</head>
<body style="margin:0;background:#111111">
<div id="chart" style="width:100%;height:100vh"></div>
<script>
Plotly.newPlot("chart", {traces}, {layout}, {{"responsive": true}});
</script>
</body>
</html>
"#,
        cdn = PLOTLY_CDN,
        traces = script_json(&Value::Array(traces)),
        layout = script_json(&layout),
    )
}

/// JSON safe to inline inside a `<script>` element.
fn script_json(value: &Value) -> String {
    value.to_string().replace("</", "<\\/")
}

fn num(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}
