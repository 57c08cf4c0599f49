use super::engine::EngineError;
use super::signals::Signal;
use super::types::{BacktestParameters, Candle, PositionSide, PositionSizing, RunControl, Trade};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;

/// The first bar on which trades may be opened or managed.
pub const FIRST_TRADABLE_BAR: usize = 4;

const PROGRESS_INTERVAL: usize = 1000;

#[derive(Debug, Clone)]
struct OpenTrade {
    side: PositionSide,
    entry_time: NaiveDateTime,
    entry_price: Decimal,
    quantity: Decimal,
    max_price: Decimal,
    min_price: Decimal,
}

struct Exit {
    price: Decimal,
    reason: &'static str,
    sl_price: Decimal,
    tp_price: Decimal,
}

/// Single-position, tick-based trade simulator.
pub struct Simulator<'a> {
    params: &'a BacktestParameters,
}

impl<'a> Simulator<'a> {
    pub fn new(params: &'a BacktestParameters) -> Self {
        Self { params }
    }

    /// Walk the bars once, opening on signals and closing on TP/SL.
    /// A trade still open after the last bar is dropped.
    pub fn run(
        &self,
        candles: &[Candle],
        signals: &[Signal],
        control: Option<&RunControl>,
    ) -> Result<Vec<Trade>, EngineError> {
        let mut balance = self.params.starting_balance;
        let mut cumulative_pnl = Decimal::ZERO;
        let mut open_trade: Option<OpenTrade> = None;
        let mut trades = Vec::new();

        for i in FIRST_TRADABLE_BAR..candles.len() {
            if i % PROGRESS_INTERVAL == 0 {
                if let Some(control) = control {
                    if control.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    control.set_progress(i as f64 / candles.len() as f64 * 100.0);
                }
            }

            let bar = &candles[i];

            if let Some(trade) = open_trade.as_mut() {
                let Some(exit) = self.check_exit(trade, bar) else {
                    continue;
                };

                let pnl = self
                    .trade_pnl(trade, exit.price)
                    .ok_or_else(|| EngineError::Overflow(bar.time.to_string()))?;
                balance = balance
                    .checked_add(pnl)
                    .ok_or_else(|| EngineError::Overflow(bar.time.to_string()))?;
                cumulative_pnl += pnl;

                tracing::debug!(
                    "Closing {} at {} -> {} ({}) | P&L: {}",
                    trade.side.as_str(),
                    trade.entry_price,
                    exit.price,
                    exit.reason,
                    pnl
                );

                trades.push(Trade {
                    position: trade.side,
                    entry_time: trade.entry_time,
                    exit_time: bar.time,
                    entry_price: trade.entry_price,
                    exit_price: exit.price,
                    sl_price: exit.sl_price,
                    tp_price: exit.tp_price,
                    quantity: trade.quantity,
                    pnl,
                    exit_reason: exit.reason.to_string(),
                    cumulative_pnl,
                    balance_after: balance,
                });
                open_trade = None;
            }

            let side = match signals[i] {
                Signal::Long => PositionSide::Long,
                Signal::Short => PositionSide::Short,
                Signal::Flat => continue,
            };

            let quantity = self.position_size(balance);
            if quantity < Decimal::ONE {
                tracing::debug!("Skipping {} signal at {}: size {}", side.as_str(), bar.time, quantity);
                continue;
            }

            open_trade = Some(OpenTrade {
                side,
                entry_time: bar.time,
                entry_price: bar.close,
                quantity,
                max_price: bar.close,
                min_price: bar.close,
            });
        }

        if let Some(control) = control {
            control.set_progress(100.0);
        }

        Ok(trades)
    }

    /// Contracts to trade at the current balance. Zero when the size cannot be
    /// represented.
    pub fn position_size(&self, balance: Decimal) -> Decimal {
        match self.params.position_sizing {
            PositionSizing::Fixed => Decimal::ONE,
            PositionSizing::RiskBased => self.risk_based_size(balance).unwrap_or(Decimal::ZERO),
        }
    }

    fn risk_based_size(&self, balance: Decimal) -> Option<Decimal> {
        let p = self.params;
        let by_margin = balance.checked_div(p.contract_margin)?.floor();
        let risk_budget = balance
            .checked_mul(p.risk_percentage)?
            .checked_div(Decimal::ONE_HUNDRED)?;
        let risk_per_contract = Decimal::from(p.sl_ticks).checked_mul(p.tick_value)?;
        let by_risk = risk_budget.checked_div(risk_per_contract)?.floor();
        Some(by_margin.min(by_risk))
    }

    /// TP is checked before SL on the same bar.
    fn check_exit(&self, trade: &mut OpenTrade, bar: &Candle) -> Option<Exit> {
        let p = self.params;
        let tp_distance = p.ticks(p.tp_ticks);
        let sl_distance = p.ticks(p.sl_ticks);
        let trail_distance = p.ticks(p.trailing_stop_ticks);

        match trade.side {
            PositionSide::Long => {
                let tp_price = trade.entry_price + tp_distance;
                let mut sl_price = trade.entry_price - sl_distance;

                if p.trailing_stop {
                    trade.max_price = trade.max_price.max(bar.high);
                    sl_price = sl_price.max(trade.max_price - trail_distance);
                }

                if bar.high >= tp_price {
                    Some(Exit { price: tp_price, reason: "TP", sl_price, tp_price })
                } else if bar.low <= sl_price {
                    Some(Exit { price: sl_price, reason: "SL", sl_price, tp_price })
                } else {
                    None
                }
            }
            PositionSide::Short => {
                let tp_price = trade.entry_price - tp_distance;
                let mut sl_price = trade.entry_price + sl_distance;

                if p.trailing_stop {
                    trade.min_price = trade.min_price.min(bar.low);
                    sl_price = sl_price.min(trade.min_price + trail_distance);
                }

                if bar.low <= tp_price {
                    Some(Exit { price: tp_price, reason: "TP", sl_price, tp_price })
                } else if bar.high >= sl_price {
                    Some(Exit { price: sl_price, reason: "SL", sl_price, tp_price })
                } else {
                    None
                }
            }
        }
    }

    /// `None` on overflow.
    fn trade_pnl(&self, trade: &OpenTrade, exit_price: Decimal) -> Option<Decimal> {
        let gross = exit_price
            .checked_sub(trade.entry_price)?
            .checked_mul(trade.quantity)?
            .checked_mul(self.params.tick_value)?
            .checked_div(self.params.tick_size)?;
        let gross = match trade.side {
            PositionSide::Long => gross,
            PositionSide::Short => -gross,
        };
        gross.checked_sub(self.params.round_trip_cost())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn bar(minute: u32, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            time: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(10, minute, 0)
                .unwrap(),
            open: close,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        }
    }

    /// Four warm-up bars, then the supplied bars.
    fn series(bars: Vec<(Decimal, Decimal, Decimal)>) -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..4)
            .map(|m| bar(m, dec!(100.5), dec!(99.5), dec!(100)))
            .collect();
        for (offset, (high, low, close)) in bars.into_iter().enumerate() {
            candles.push(bar(4 + offset as u32, high, low, close));
        }
        candles
    }

    fn signals_at(len: usize, at: &[(usize, Signal)]) -> Vec<Signal> {
        let mut signals = vec![Signal::Flat; len];
        for (idx, signal) in at {
            signals[*idx] = *signal;
        }
        signals
    }

    #[test]
    fn test_long_take_profit() {
        let params = BacktestParameters::default();
        // TP 20 ticks * 0.25 = 5 points
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(103), dec!(99), dec!(102)),
            (dec!(105.25), dec!(101), dec!(105)),
        ]);
        let signals = signals_at(candles.len(), &[(4, Signal::Long)]);

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        assert_eq!(trades.len(), 1);

        let trade = &trades[0];
        assert_eq!(trade.position, PositionSide::Long);
        assert_eq!(trade.exit_reason, "TP");
        assert_eq!(trade.exit_price, dec!(105));
        assert_eq!(trade.sl_price, dec!(95));
        // 5 points = 20 ticks * $5 = 100, minus 5 commission and 10 slippage
        assert_eq!(trade.pnl, dec!(85));
        assert_eq!(trade.balance_after, dec!(100085));
        assert_eq!(trade.cumulative_pnl, dec!(85));
    }

    #[test]
    fn test_short_stop_loss() {
        let params = BacktestParameters::default();
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(105), dec!(99), dec!(104)),
        ]);
        let signals = signals_at(candles.len(), &[(4, Signal::Short)]);

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "SL");
        assert_eq!(trades[0].exit_price, dec!(105));
        assert_eq!(trades[0].pnl, dec!(-115));
    }

    #[test]
    fn test_take_profit_wins_when_both_levels_touched() {
        let params = BacktestParameters::default();
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(106), dec!(94), dec!(100)),
        ]);
        let signals = signals_at(candles.len(), &[(4, Signal::Long)]);

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        assert_eq!(trades[0].exit_reason, "TP");
    }

    #[test]
    fn test_trailing_stop_ratchets_up() {
        let params = BacktestParameters {
            trailing_stop: true,
            trailing_stop_ticks: 8, // 2 points
            ..Default::default()
        };
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(104), dec!(102.5), dec!(103.5)),
            (dec!(103.5), dec!(101.5), dec!(102)),
        ]);
        let signals = signals_at(candles.len(), &[(4, Signal::Long)]);

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "SL");
        // max high 104 - 2 = 102
        assert_eq!(trades[0].exit_price, dec!(102));
        assert_eq!(trades[0].sl_price, dec!(102));
    }

    #[test]
    fn test_short_trailing_stop_ratchets_down() {
        let params = BacktestParameters {
            trailing_stop: true,
            trailing_stop_ticks: 8, // 2 points
            ..Default::default()
        };
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(97.5), dec!(96.5), dec!(97)),
            (dec!(98.75), dec!(97), dec!(98.5)),
        ]);
        let signals = signals_at(candles.len(), &[(4, Signal::Short)]);

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].position, PositionSide::Short);
        assert_eq!(trades[0].exit_reason, "SL");
        // min low 96.5 + 2 = 98.5, below the fixed stop at 105
        assert_eq!(trades[0].exit_price, dec!(98.5));
        assert_eq!(trades[0].sl_price, dec!(98.5));
        // 1.5 points = 6 ticks * $5 = 30, minus 15 costs
        assert_eq!(trades[0].pnl, dec!(15));
    }

    #[test]
    fn test_open_trade_at_end_is_dropped() {
        let params = BacktestParameters::default();
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(101), dec!(99), dec!(100)),
        ]);
        let signals = signals_at(candles.len(), &[(4, Signal::Long)]);

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        assert!(trades.is_empty());
    }

    #[test]
    fn test_signals_ignored_while_in_trade_and_reentry_on_exit_bar() {
        let params = BacktestParameters::default();
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(101), dec!(99), dec!(100)),
            (dec!(105), dec!(100), dec!(104)),
            (dec!(104.5), dec!(103.5), dec!(104)),
        ]);
        let signals = signals_at(
            candles.len(),
            &[(4, Signal::Long), (5, Signal::Short), (6, Signal::Short)],
        );

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        // The bar-5 short is ignored, the bar-6 short opens on the TP bar and never closes.
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].position, PositionSide::Long);
        assert_eq!(trades[0].exit_reason, "TP");
    }

    #[test]
    fn test_reentry_on_exit_bar_is_traded() {
        let params = BacktestParameters::default();
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(101), dec!(99), dec!(100)),
            (dec!(105), dec!(100), dec!(104)),
            (dec!(104), dec!(98.5), dec!(99)),
        ]);
        let signals = signals_at(candles.len(), &[(4, Signal::Long), (6, Signal::Short)]);

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        assert_eq!(trades.len(), 2);

        assert_eq!(trades[0].position, PositionSide::Long);
        assert_eq!(trades[0].exit_price, dec!(105));
        assert_eq!(trades[0].exit_time, candles[6].time);

        let short = &trades[1];
        assert_eq!(short.position, PositionSide::Short);
        assert_eq!(short.entry_time, candles[6].time);
        assert_eq!(short.entry_price, dec!(104));
        assert_eq!(short.exit_reason, "TP");
        assert_eq!(short.exit_price, dec!(99));
        assert_eq!(short.pnl, dec!(85));
        assert_eq!(short.cumulative_pnl, dec!(170));
        assert_eq!(short.balance_after, dec!(100170));
    }

    #[test]
    fn test_signal_on_bar_three_is_not_traded() {
        let params = BacktestParameters::default();
        let candles = series(vec![(dec!(110), dec!(90), dec!(100))]);
        let signals = signals_at(candles.len(), &[(3, Signal::Long)]);

        let trades = Simulator::new(&params).run(&candles, &signals, None).unwrap();
        assert!(trades.is_empty());
    }

    #[test]
    fn test_risk_based_sizing() {
        let params = BacktestParameters {
            position_sizing: PositionSizing::RiskBased,
            ..Default::default()
        };
        let sim = Simulator::new(&params);
        // margin: 100000 / 13000 = 7; risk: 1000 / (20 * 5) = 10
        assert_eq!(sim.position_size(dec!(100000)), dec!(7));
        assert_eq!(sim.position_size(dec!(12000)), Decimal::ZERO);

        let fixed = BacktestParameters::default();
        assert_eq!(Simulator::new(&fixed).position_size(dec!(1)), Decimal::ONE);
    }

    #[test]
    fn test_unrepresentable_size_is_zero() {
        let params = BacktestParameters {
            position_sizing: PositionSizing::RiskBased,
            risk_percentage: dec!(100),
            contract_margin: dec!(0.0001),
            ..Default::default()
        };
        assert_eq!(Simulator::new(&params).position_size(Decimal::MAX), Decimal::ZERO);
    }

    #[test]
    fn test_pnl_overflow_is_an_error() {
        let params = BacktestParameters {
            tick_value: Decimal::MAX / dec!(2),
            ..Default::default()
        };
        let candles = series(vec![
            (dec!(100.5), dec!(99.5), dec!(100)),
            (dec!(105.25), dec!(101), dec!(105)),
        ]);
        let signals = signals_at(candles.len(), &[(4, Signal::Long)]);

        let result = Simulator::new(&params).run(&candles, &signals, None);
        assert!(matches!(result, Err(EngineError::Overflow(_))));
    }

    #[test]
    fn test_cancelled_run() {
        let params = BacktestParameters::default();
        let candles: Vec<Candle> = (0..2000)
            .map(|i| Candle {
                time: NaiveDate::from_ymd_opt(2024, 1, 2)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    + chrono::Duration::minutes(i),
                open: dec!(100),
                high: dec!(100.5),
                low: dec!(99.5),
                close: dec!(100),
                volume: Decimal::ZERO,
            })
            .collect();
        let signals = vec![Signal::Flat; candles.len()];
        let control = RunControl::new();
        control.cancel();

        let result = Simulator::new(&params).run(&candles, &signals, Some(&control));
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
