use super::rsi::rsi_series;
use crate::types::Bar;

const RSI_PERIOD: usize = 14;
const MIN_BARS: usize = RSI_PERIOD + 1;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RsiAlert {
    pub is_overbought: bool,
    pub is_oversold: bool,
    pub rsi_value: Option<f64>,
}

/// Overbought above 70, oversold below 30, on the latest RSI(14) value
pub fn rsi_alert(bars: &[Bar]) -> RsiAlert {
    if bars.len() < MIN_BARS {
        return RsiAlert::default();
    }
    let Some(value) = rsi_series(bars, RSI_PERIOD).last().copied().filter(|v| !v.is_nan()) else {
        return RsiAlert::default();
    };
    RsiAlert {
        is_overbought: value > 70.0,
        is_oversold: value < 30.0,
        rsi_value: Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::from_closes;

    #[test]
    fn test_overbought_on_rally() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let alert = rsi_alert(&from_closes(&closes));
        assert!(alert.is_overbought);
        assert!(!alert.is_oversold);
        assert_eq!(alert.rsi_value, Some(100.0));
    }

    #[test]
    fn test_oversold_on_selloff() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let alert = rsi_alert(&from_closes(&closes));
        assert!(alert.is_oversold);
    }

    #[test]
    fn test_requires_fifteen_bars() {
        let closes: Vec<f64> = (0..14).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi_alert(&from_closes(&closes)), RsiAlert::default());

        let closes: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        assert!(rsi_alert(&from_closes(&closes)).is_overbought);
    }

    #[test]
    fn test_neutral_range() {
        let closes: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        let alert = rsi_alert(&from_closes(&closes));
        assert!(!alert.is_overbought && !alert.is_oversold);
        assert!(alert.rsi_value.is_some());
    }
}
