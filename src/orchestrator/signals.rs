use super::types::Candle;
use rust_decimal::Decimal;
use serde::Serialize;

/// Bars that must line up before a reversal bar can trigger.
pub const SETUP_BARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Flat,
    Long,
    Short,
}

/// EMA pullback detector.
///
/// A long fires on bar `i` when the three bars before it all closed red and
/// below their EMA, and bar `i` closes back above its EMA. Shorts are the
/// mirror image: three green bars closing above the EMA, then a close below.
pub fn detect_signals(candles: &[Candle], ema: &[Decimal]) -> Vec<Signal> {
    debug_assert_eq!(candles.len(), ema.len());

    let mut signals = vec![Signal::Flat; candles.len()];

    for i in SETUP_BARS..candles.len() {
        let current = &candles[i];

        let bearish_setup =
            (i - SETUP_BARS..i).all(|j| candles[j].is_bearish() && candles[j].close < ema[j]);
        if bearish_setup && current.close > ema[i] {
            signals[i] = Signal::Long;
        }

        let bullish_setup =
            (i - SETUP_BARS..i).all(|j| candles[j].is_bullish() && candles[j].close > ema[j]);
        if bullish_setup && current.close < ema[i] {
            signals[i] = Signal::Short;
        }
    }

    signals
}
