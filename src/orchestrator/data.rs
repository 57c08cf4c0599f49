use super::types::{Candle, CandleSeries, CandleSeriesProvenance, CandleSeriesTrustTier};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Header names accepted for the bar timestamp, in priority order.
const TIME_COLUMNS: [&str; 5] = ["date_time", "datetime", "timestamp", "time", "date"];

const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to open {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("no time column found (expected one of date_time, datetime, timestamp, time, date)")]
    MissingTimeColumn,
    #[error("line {line}: invalid {column} value '{value}'")]
    InvalidValue {
        line: u64,
        column: &'static str,
        value: String,
    },
    #[error("line {line}: unrecognised timestamp '{value}'")]
    InvalidTimestamp { line: u64, value: String },
    #[error("file contains no data rows")]
    Empty,
}

struct Columns {
    time: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: Option<usize>,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self, DataError> {
        let index_of = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim_start_matches('\u{feff}').trim().eq_ignore_ascii_case(name))
        };

        let time = TIME_COLUMNS
            .iter()
            .find_map(|name| index_of(name))
            .ok_or(DataError::MissingTimeColumn)?;

        Ok(Self {
            time,
            open: index_of("open").ok_or(DataError::MissingColumn("open"))?,
            high: index_of("high").ok_or(DataError::MissingColumn("high"))?,
            low: index_of("low").ok_or(DataError::MissingColumn("low"))?,
            close: index_of("close").ok_or(DataError::MissingColumn("close"))?,
            volume: index_of("volume"),
        })
    }
}

/// Parse OHLC rows from CSV. Rows come back sorted by time.
pub fn parse_csv<R: Read>(
    reader: R,
    provenance: CandleSeriesProvenance,
) -> Result<CandleSeries, DataError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns = Columns::resolve(rdr.headers()?)?;
    let mut candles = Vec::new();

    for record in rdr.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        let raw_time = record.get(columns.time).unwrap_or_default();
        let time = parse_timestamp(raw_time).ok_or_else(|| DataError::InvalidTimestamp {
            line,
            value: raw_time.to_string(),
        })?;

        let volume = match columns.volume {
            Some(idx) if !record.get(idx).unwrap_or_default().is_empty() => {
                parse_decimal(&record, idx, "volume", line)?
            }
            _ => Decimal::ZERO,
        };

        candles.push(Candle {
            time,
            open: parse_decimal(&record, columns.open, "open", line)?,
            high: parse_decimal(&record, columns.high, "high", line)?,
            low: parse_decimal(&record, columns.low, "low", line)?,
            close: parse_decimal(&record, columns.close, "close", line)?,
            volume,
        });
    }

    if candles.is_empty() {
        return Err(DataError::Empty);
    }

    let series = CandleSeries::from_rows(candles, provenance);
    tracing::debug!(
        "Parsed {} candles from {} (ordered input: {})",
        series.len(),
        series.provenance.source,
        series.capabilities.input_ordered
    );
    Ok(series)
}

/// Load a user-supplied CSV file from disk.
pub fn load_csv(path: &Path) -> Result<CandleSeries, DataError> {
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.display().to_string(),
        source,
    })?;

    parse_csv(
        file,
        CandleSeriesProvenance {
            source: path.display().to_string(),
            trust_tier: CandleSeriesTrustTier::UserSupplied,
        },
    )
}

fn parse_decimal(
    record: &csv::StringRecord,
    idx: usize,
    column: &'static str,
    line: u64,
) -> Result<Decimal, DataError> {
    let raw = record.get(idx).unwrap_or_default();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| DataError::InvalidValue {
            line,
            column,
            value: raw.to_string(),
        })
}

/// Parse a bar timestamp. Offsets are dropped, keeping the wall-clock time
/// the exchange printed.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.naive_local());
    }
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc());
    }

    None
}

/// Serde adapter writing bar times as `YYYY-MM-DD HH:MM:SS`.
pub mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(time: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp '{}'", raw)))
    }

    pub mod option {
        use chrono::NaiveDateTime;
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            time: &Option<NaiveDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(time) => serializer.collect_str(&time.format(super::FORMAT)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveDateTime>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::super::parse_timestamp(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid timestamp '{}'", raw))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn provenance() -> CandleSeriesProvenance {
        CandleSeriesProvenance {
            source: "inline".to_string(),
            trust_tier: CandleSeriesTrustTier::UserSupplied,
        }
    }

    #[test]
    fn test_parse_minute_export() {
        let csv = "date_time,open,high,low,close,volume\n\
                   2024-01-02 09:31:00-05:00,16800.25,16805.00,16799.50,16804.75,120\n\
                   2024-01-02 09:30:00-05:00,16798.00,16801.00,16797.25,16800.25,300\n";

        let series = parse_csv(csv.as_bytes(), provenance()).unwrap();
        assert_eq!(series.len(), 2);
        assert!(!series.capabilities.input_ordered);
        assert_eq!(
            series.candles[0].time.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2024-01-02 09:30:00"
        );
        assert_eq!(series.candles[1].close, dec!(16804.75));
        assert_eq!(series.candles[0].volume, dec!(300));
    }

    #[test]
    fn test_headers_are_case_insensitive_and_volume_optional() {
        let csv = "Datetime,Open,High,Low,Close\n2024-01-02T09:30:00,1,2,0.5,1.5\n";
        let series = parse_csv(csv.as_bytes(), provenance()).unwrap();
        assert_eq!(series.candles[0].volume, Decimal::ZERO);
        assert_eq!(series.candles[0].high, dec!(2));
    }

    #[test]
    fn test_missing_close_column() {
        let csv = "date_time,open,high,low\n2024-01-02 09:30:00,1,2,0.5\n";
        let err = parse_csv(csv.as_bytes(), provenance()).unwrap_err();
        assert!(matches!(err, DataError::MissingColumn("close")));
    }

    #[test]
    fn test_missing_time_column() {
        let csv = "open,high,low,close\n1,2,0.5,1.5\n";
        let err = parse_csv(csv.as_bytes(), provenance()).unwrap_err();
        assert!(matches!(err, DataError::MissingTimeColumn));
    }

    #[test]
    fn test_invalid_price_reports_line() {
        let csv = "date_time,open,high,low,close\n\
                   2024-01-02 09:30:00,1,2,0.5,1.5\n\
                   2024-01-02 09:31:00,1,abc,0.5,1.5\n";
        let err = parse_csv(csv.as_bytes(), provenance()).unwrap_err();
        match err {
            DataError::InvalidValue { line, column, .. } => {
                assert_eq!(line, 3);
                assert_eq!(column, "high");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_file() {
        let csv = "date_time,open,high,low,close\n";
        assert!(matches!(
            parse_csv(csv.as_bytes(), provenance()),
            Err(DataError::Empty)
        ));
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(14, 5, 0)
            .unwrap();

        for raw in [
            "2024-03-04 14:05:00",
            "2024-03-04T14:05:00",
            "2024-03-04 14:05",
            "2024-03-04T14:05:00+02:00",
            "2024-03-04 14:05:00+0200",
            "2024/03/04 14:05:00",
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected), "format {raw}");
        }

        assert_eq!(
            parse_timestamp("1709561100"),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp("2024-03-04"),
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
