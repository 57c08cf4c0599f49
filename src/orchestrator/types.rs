use super::data::timestamp;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(with = "timestamp")]
    pub time: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapInformation {
    Unknown,
    KnownComplete,
    KnownWithGaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleSeriesTrustTier {
    UserSupplied,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSeriesProvenance {
    pub source: String,
    pub trust_tier: CandleSeriesTrustTier,
}

/// What the loader could establish about the rows it was given.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleSeriesCapabilities {
    /// Rows arrived in strictly increasing time order (before sorting).
    pub input_ordered: bool,
    /// Median spacing between bars, when the spacing is regular enough to call it one.
    pub cadence_seconds: Option<i64>,
    pub gap_information: GapInformation,
    pub ohlc_sane: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSeries {
    pub candles: Vec<Candle>,
    pub capabilities: CandleSeriesCapabilities,
    pub provenance: CandleSeriesProvenance,
}

impl CandleSeries {
    /// Builds a series from rows in file order. Rows are stably sorted by time
    /// after the ordering scan, so `input_ordered` describes the file, not the series.
    pub fn from_rows(mut candles: Vec<Candle>, provenance: CandleSeriesProvenance) -> Self {
        let input_ordered = Self::scan_ordering(&candles);
        if !input_ordered {
            candles.sort_by_key(|c| c.time);
        }

        let mut series = Self {
            candles,
            capabilities: CandleSeriesCapabilities {
                input_ordered,
                cadence_seconds: None,
                gap_information: GapInformation::Unknown,
                ohlc_sane: false,
            },
            provenance,
        };
        series.scan_cadence();
        series.scan_ohlc_sanity();
        series
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn quality(&self) -> DataQuality {
        DataQuality {
            rows: self.candles.len(),
            start: self.candles.first().map(|c| c.time),
            end: self.candles.last().map(|c| c.time),
            capabilities: self.capabilities,
            source: self.provenance.source.clone(),
            trust_tier: self.provenance.trust_tier,
        }
    }

    fn scan_ordering(candles: &[Candle]) -> bool {
        candles.windows(2).all(|w| w[1].time > w[0].time)
    }

    fn scan_cadence(&mut self) {
        if self.candles.len() < 2 {
            return;
        }

        let mut deltas: Vec<i64> = self
            .candles
            .windows(2)
            .filter_map(|w| {
                let delta = (w[1].time - w[0].time).num_seconds();
                if delta > 0 {
                    Some(delta)
                } else {
                    None
                }
            })
            .collect();

        if deltas.is_empty() {
            return;
        }

        deltas.sort_unstable();
        let median = deltas[deltas.len() / 2];

        let mut conforms = true;
        let mut gaps = false;
        let mut exact_matches = 0usize;
        let total = deltas.len();

        for delta in deltas {
            if delta % median != 0 {
                conforms = false;
                break;
            }
            if delta == median {
                exact_matches += 1;
            }
            if delta > median {
                gaps = true;
            }
        }

        if conforms && exact_matches * 2 > total {
            self.capabilities.cadence_seconds = Some(median);
            self.capabilities.gap_information = if gaps {
                GapInformation::KnownWithGaps
            } else {
                GapInformation::KnownComplete
            };
        }
    }

    fn scan_ohlc_sanity(&mut self) {
        self.capabilities.ohlc_sane = self.candles.iter().all(|candle| {
            let max_oc = candle.open.max(candle.close);
            let min_oc = candle.open.min(candle.close);
            candle.high >= max_oc && candle.low <= min_oc && candle.high >= candle.low
        });
    }
}

/// Upload-time summary of a candle file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataQuality {
    pub rows: usize,
    #[serde(default, with = "timestamp::option")]
    pub start: Option<NaiveDateTime>,
    #[serde(default, with = "timestamp::option")]
    pub end: Option<NaiveDateTime>,
    pub capabilities: CandleSeriesCapabilities,
    pub source: String,
    pub trust_tier: CandleSeriesTrustTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizing {
    /// One contract per trade.
    #[default]
    Fixed,
    /// Smaller of the margin-limited and risk-limited contract counts.
    RiskBased,
}

/// User-facing strategy configuration. Every field falls back to the
/// production defaults when omitted from a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestParameters {
    pub starting_balance: Decimal,
    /// Percent of balance risked per trade (1 = 1%).
    pub risk_percentage: Decimal,
    pub tick_size: Decimal,
    pub tick_value: Decimal,
    pub commission_per_trade: Decimal,
    pub slippage_ticks: Decimal,
    pub tp_ticks: u32,
    pub sl_ticks: u32,
    pub trailing_stop: bool,
    pub trailing_stop_ticks: u32,
    pub contract_margin: Decimal,
    pub ema_span: usize,
    pub position_sizing: PositionSizing,
    pub generate_plots: bool,
    pub months_per_plot: u32,
}

impl Default for BacktestParameters {
    fn default() -> Self {
        Self {
            starting_balance: dec!(100000),
            risk_percentage: dec!(1),
            tick_size: dec!(0.25),
            tick_value: dec!(5),
            commission_per_trade: dec!(5),
            slippage_ticks: dec!(1),
            tp_ticks: 20,
            sl_ticks: 20,
            trailing_stop: false,
            trailing_stop_ticks: 5,
            contract_margin: dec!(13000),
            ema_span: 9,
            position_sizing: PositionSizing::Fixed,
            generate_plots: false,
            months_per_plot: 3,
        }
    }
}

/// Ceiling on money amounts. Keeps sizing and P&L products well inside `Decimal`.
const MAX_AMOUNT: Decimal = dec!(1000000000000);
/// Ceiling on per-tick amounts and tick counts.
const MAX_TICK_AMOUNT: Decimal = dec!(1000000);

impl BacktestParameters {
    pub fn validate(&self) -> Result<(), String> {
        if self.starting_balance > MAX_AMOUNT || self.contract_margin > MAX_AMOUNT {
            return Err(format!(
                "starting_balance and contract_margin must not exceed {}",
                MAX_AMOUNT
            ));
        }
        if [
            self.tick_size,
            self.tick_value,
            self.commission_per_trade,
            self.slippage_ticks,
        ]
        .iter()
        .any(|v| *v > MAX_TICK_AMOUNT)
        {
            return Err(format!(
                "tick_size, tick_value, commission_per_trade and slippage_ticks must not exceed {}",
                MAX_TICK_AMOUNT
            ));
        }
        if self.starting_balance <= Decimal::ZERO {
            return Err("starting_balance must be positive".to_string());
        }
        if self.tick_size <= Decimal::ZERO {
            return Err("tick_size must be positive".to_string());
        }
        if self.tick_value <= Decimal::ZERO {
            return Err("tick_value must be positive".to_string());
        }
        if self.tp_ticks == 0 || self.sl_ticks == 0 {
            return Err("tp_ticks and sl_ticks must be at least 1".to_string());
        }
        if self.trailing_stop && self.trailing_stop_ticks == 0 {
            return Err("trailing_stop_ticks must be at least 1 when trailing_stop is on".to_string());
        }
        if self.commission_per_trade < Decimal::ZERO || self.slippage_ticks < Decimal::ZERO {
            return Err("commission_per_trade and slippage_ticks cannot be negative".to_string());
        }
        if self.risk_percentage <= Decimal::ZERO || self.risk_percentage > dec!(100) {
            return Err("risk_percentage must be in (0, 100]".to_string());
        }
        if self.contract_margin <= Decimal::ZERO {
            return Err("contract_margin must be positive".to_string());
        }
        if self.ema_span == 0 {
            return Err("ema_span must be at least 1".to_string());
        }
        if self.generate_plots && self.months_per_plot == 0 {
            return Err("months_per_plot must be at least 1".to_string());
        }
        Ok(())
    }

    /// Price distance of `ticks` ticks.
    pub fn ticks(&self, ticks: impl Into<Decimal>) -> Decimal {
        ticks.into() * self.tick_size
    }

    /// Commission plus round-trip slippage charged on every closed trade.
    pub fn round_trip_cost(&self) -> Decimal {
        self.commission_per_trade + self.slippage_ticks * self.tick_value * Decimal::TWO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub position: PositionSide,
    #[serde(with = "timestamp")]
    pub entry_time: NaiveDateTime,
    #[serde(with = "timestamp")]
    pub exit_time: NaiveDateTime,
    pub entry_price: Decimal,
    #[serde(default)]
    pub exit_price: Decimal,
    #[serde(default)]
    pub sl_price: Decimal,
    #[serde(default)]
    pub tp_price: Decimal,
    #[serde(default = "one_contract")]
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub exit_reason: String,
    #[serde(default)]
    pub cumulative_pnl: Decimal,
    #[serde(default)]
    pub balance_after: Decimal,
}

fn one_contract() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub total_trades: usize,
    pub win_rate: f64,
    pub avg_profit: f64,
    pub total_pnl: f64,
    pub profit_percentage: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: Option<f64>,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub ending_balance: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            total_trades: 0,
            win_rate: 0.0,
            avg_profit: 0.0,
            total_pnl: 0.0,
            profit_percentage: 0.0,
            max_drawdown: 0.0,
            sharpe_ratio: None,
            avg_win: 0.0,
            avg_loss: 0.0,
            best_trade: 0.0,
            worst_trade: 0.0,
            ending_balance: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub trade_number: usize,
    pub date: String,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReturn {
    pub month: String,
    pub pnl: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartData {
    pub equity_curve: Vec<EquityPoint>,
    pub monthly_returns: Vec<MonthlyReturn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadLinks {
    pub trades_csv: String,
    pub metrics_csv: String,
}

impl DownloadLinks {
    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            trades_csv: format!("/api/download?id={}&file=trades.csv", run_id),
            metrics_csv: format!("/api/download?id={}&file=metrics.csv", run_id),
        }
    }
}

/// Everything the results page renders for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestResults {
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub trades: Vec<Trade>,
    #[serde(default)]
    pub chart_data: Option<ChartData>,
    #[serde(default)]
    pub chart_files: Vec<String>,
    #[serde(rename = "downloadLinks", default, skip_serializing_if = "Option::is_none")]
    pub download_links: Option<DownloadLinks>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Cancellation flag and progress shared between a running job and the API.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel_flag: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// Percentage in 0.0 - 100.0.
    pub fn set_progress(&self, progress: f64) {
        self.progress
            .store(progress.clamp(0.0, 100.0).to_bits(), Ordering::Relaxed);
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct BacktestState {
    pub status: RunStatus,
    pub error: Option<String>,
    pub control: RunControl,
}

pub type BacktestRegistry = Arc<RwLock<HashMap<Uuid, BacktestState>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn candle(minute: u32, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            time: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(9, minute, 0)
                .unwrap(),
            open,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        }
    }

    fn provenance() -> CandleSeriesProvenance {
        CandleSeriesProvenance {
            source: "test".to_string(),
            trust_tier: CandleSeriesTrustTier::UserSupplied,
        }
    }

    #[test]
    fn test_unordered_rows_are_sorted_and_flagged() {
        let rows = vec![
            candle(2, dec!(10), dec!(11), dec!(9), dec!(10)),
            candle(0, dec!(10), dec!(11), dec!(9), dec!(10)),
            candle(1, dec!(10), dec!(11), dec!(9), dec!(10)),
        ];
        let series = CandleSeries::from_rows(rows, provenance());

        assert!(!series.capabilities.input_ordered);
        let minutes: Vec<_> = series.candles.iter().map(|c| c.time.format("%M").to_string()).collect();
        assert_eq!(minutes, vec!["00", "01", "02"]);
        assert_eq!(series.capabilities.cadence_seconds, Some(60));
        assert_eq!(series.capabilities.gap_information, GapInformation::KnownComplete);
    }

    #[test]
    fn test_cadence_detects_gaps() {
        let rows = vec![
            candle(0, dec!(10), dec!(11), dec!(9), dec!(10)),
            candle(1, dec!(10), dec!(11), dec!(9), dec!(10)),
            candle(2, dec!(10), dec!(11), dec!(9), dec!(10)),
            candle(5, dec!(10), dec!(11), dec!(9), dec!(10)),
        ];
        let series = CandleSeries::from_rows(rows, provenance());
        assert_eq!(series.capabilities.gap_information, GapInformation::KnownWithGaps);
    }

    #[test]
    fn test_ohlc_sanity() {
        let rows = vec![candle(0, dec!(10), dec!(9), dec!(8), dec!(10))];
        let series = CandleSeries::from_rows(rows, provenance());
        assert!(!series.capabilities.ohlc_sane);
    }

    #[test]
    fn test_default_parameters_are_valid() {
        let params = BacktestParameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.round_trip_cost(), dec!(15));
        assert_eq!(params.ticks(20u32), dec!(5));
    }

    #[test]
    fn test_partial_parameters_use_defaults() {
        let params: BacktestParameters =
            serde_json::from_str(r#"{"tp_ticks": 40, "tick_size": 0.5}"#).unwrap();
        assert_eq!(params.tp_ticks, 40);
        assert_eq!(params.tick_size, dec!(0.5));
        assert_eq!(params.sl_ticks, 20);
        assert_eq!(params.starting_balance, dec!(100000));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let params = BacktestParameters {
            tick_size: Decimal::ZERO,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_out_of_range_amounts_rejected() {
        let params = BacktestParameters {
            starting_balance: Decimal::MAX,
            ..Default::default()
        };
        assert!(params.validate().unwrap_err().contains("starting_balance"));

        let params = BacktestParameters {
            tick_value: dec!(10000000),
            ..Default::default()
        };
        assert!(params.validate().unwrap_err().contains("tick_value"));

        let params = BacktestParameters {
            starting_balance: dec!(1000000000000),
            ..Default::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_run_control_progress() {
        let control = RunControl::new();
        assert_eq!(control.progress(), 0.0);
        control.set_progress(42.5);
        assert_eq!(control.progress(), 42.5);
        control.set_progress(250.0);
        assert_eq!(control.progress(), 100.0);
        assert!(!control.is_cancelled());
        control.cancel();
        assert!(control.clone().is_cancelled());
    }
}
