use rust_decimal::Decimal;

/// Exponential moving average using the recursive (non-adjusted) form,
/// seeded with the first value: `ema[i] = a * x[i] + (1 - a) * ema[i-1]`,
/// `a = 2 / (span + 1)`.
pub fn ema(values: &[Decimal], span: usize) -> Vec<Decimal> {
    let span = span.max(1);
    let alpha = Decimal::TWO / Decimal::from(span + 1);
    let keep = Decimal::ONE - alpha;

    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<Decimal> = None;

    for &value in values {
        let next = match prev {
            Some(prev) => alpha * value + keep * prev,
            None => value,
        };
        out.push(next);
        prev = Some(next);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ema_span_9() {
        // alpha = 0.2
        let values = [dec!(10), dec!(20), dec!(30)];
        let out = ema(&values, 9);
        assert_eq!(out, vec![dec!(10), dec!(12), dec!(15.6)]);
    }

    #[test]
    fn test_span_one_tracks_input() {
        let values = [dec!(1), dec!(5), dec!(3)];
        assert_eq!(ema(&values, 1), values.to_vec());
    }

    #[test]
    fn test_empty_input() {
        assert!(ema(&[], 9).is_empty());
    }
}
