//! Three-day positional (ICT) bias

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Bar, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Bullish,
    Bearish,
    Ranging,
    Unknown,
}

impl Bias {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Ranging => "RANGING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasResult {
    pub bias: Bias,
    /// Close of the most recent closed day
    pub reference_close: f64,
    /// High/low of the day before it
    pub range_high: f64,
    pub range_low: f64,
    /// Percent distance of the close beyond the broken level (0 inside the range)
    pub strength: f64,
}

impl BiasResult {
    fn unknown() -> Self {
        Self {
            bias: Bias::Unknown,
            reference_close: 0.0,
            range_high: 0.0,
            range_low: 0.0,
            strength: 0.0,
        }
    }

    pub fn bias_type(&self) -> &'static str {
        match self.bias {
            Bias::Bullish => "CLOSE_ABOVE_PRIOR_HIGH",
            Bias::Bearish => "CLOSE_BELOW_PRIOR_LOW",
            Bias::Ranging => "INSIDE_PRIOR_RANGE",
            Bias::Unknown => "INSUFFICIENT_DATA",
        }
    }
}

/// Compares the second-to-last day's close against the third-to-last day's
/// range. The last entry is the day still forming.
pub fn daily_bias(daily: &[Bar]) -> BiasResult {
    if daily.len() < 3 {
        return BiasResult::unknown();
    }
    let n = daily.len();
    evaluate(&daily[n - 3], daily[n - 2].close)
}

/// Bias as of `now`. A series of closed days has no forming entry, so when
/// the last day has already closed it is the reference day and the one
/// before it supplies the range.
pub fn daily_bias_at(daily: &[Bar], now: DateTime<Utc>) -> BiasResult {
    match daily.last() {
        Some(last) if last.open_time + Duration::days(1) <= now => {
            let n = daily.len();
            if n < 2 {
                return BiasResult::unknown();
            }
            evaluate(&daily[n - 2], daily[n - 1].close)
        }
        _ => daily_bias(daily),
    }
}

fn evaluate(range: &Bar, close: f64) -> BiasResult {
    let (bias, strength) = if close < range.low {
        (Bias::Bearish, pct(range.low - close, range.low))
    } else if close > range.high {
        (Bias::Bullish, pct(close - range.high, range.high))
    } else {
        (Bias::Ranging, 0.0)
    };

    BiasResult {
        bias,
        reference_close: close,
        range_high: range.high,
        range_low: range.low,
        strength,
    }
}

fn pct(distance: f64, level: f64) -> f64 {
    if level.abs() > 0.0 {
        distance / level.abs() * 100.0
    } else {
        0.0
    }
}

/// Groups sub-daily bars by UTC calendar day: first open, max high, min low,
/// last close, summed volume.
pub fn aggregate_daily(bars: &[Bar]) -> Vec<Bar> {
    let mut days: BTreeMap<NaiveDate, Bar> = BTreeMap::new();

    for bar in bars {
        let day = bar.open_time.date_naive();
        days.entry(day)
            .and_modify(|agg| {
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.close = bar.close;
                agg.volume += bar.volume;
                agg.quote_volume = match (agg.quote_volume, bar.quote_volume) {
                    (Some(a), Some(b)) => Some(a + b),
                    (a, b) => a.or(b),
                };
            })
            .or_insert_with(|| Bar {
                symbol: bar.symbol.clone(),
                timeframe: Timeframe::D1,
                open_time: Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN)),
                ..bar.clone()
            });
    }

    days.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::{candle, start};

    fn days(second_close: f64) -> Vec<Bar> {
        vec![
            candle(0, 105.0, 110.0, 100.0, 104.0),
            candle(24, 104.0, 118.0, 90.0, second_close),
            candle(48, second_close, second_close + 1.0, second_close - 1.0, second_close),
        ]
    }

    #[test]
    fn test_bias_scenarios() {
        let bearish = daily_bias(&days(95.0));
        assert_eq!(bearish.bias, Bias::Bearish);
        assert!((bearish.strength - 5.0).abs() < 1e-9);
        assert_eq!(bearish.bias_type(), "CLOSE_BELOW_PRIOR_LOW");

        let bullish = daily_bias(&days(115.0));
        assert_eq!(bullish.bias, Bias::Bullish);
        assert!(bullish.strength > 4.5);

        let ranging = daily_bias(&days(105.0));
        assert_eq!(ranging.bias, Bias::Ranging);
        assert_eq!(ranging.strength, 0.0);
    }

    #[test]
    fn test_closed_last_day_is_the_reference() {
        // Days 0..=2 all closed; day 2 closes below day 1's low
        let daily = vec![
            candle(0, 100.0, 112.0, 98.0, 105.0),
            candle(24, 105.0, 110.0, 100.0, 105.0),
            candle(48, 101.0, 102.0, 94.0, 95.0),
        ];
        let tick = start() + Duration::days(3) + Duration::seconds(30);
        let result = daily_bias_at(&daily, tick);
        assert_eq!(result.bias, Bias::Bearish);
        assert_eq!(result.reference_close, 95.0);
        assert_eq!(result.range_low, 100.0);

        // Mid-day 2 the last entry is still forming
        let forming = daily_bias_at(&daily, start() + Duration::hours(60));
        assert_eq!(forming, daily_bias(&daily));
        assert_eq!(forming.bias, Bias::Ranging);

        assert_eq!(daily_bias_at(&daily[2..], tick).bias, Bias::Unknown);
        assert_eq!(daily_bias_at(&daily[1..], tick).bias, Bias::Bearish);
    }

    #[test]
    fn test_unknown_with_two_days() {
        assert_eq!(daily_bias(&days(95.0)[..2]).bias, Bias::Unknown);
    }

    #[test]
    fn test_aggregate_daily_from_hourly() {
        // 36 hourly bars starting at midnight: one full day and half of the next
        let hourly: Vec<Bar> = (0..36)
            .map(|h| {
                let base = 100.0 + h as f64;
                candle(h, base, base + 2.0, base - 2.0, base + 1.0)
            })
            .collect();
        let daily = aggregate_daily(&hourly);
        assert_eq!(daily.len(), 2);

        let first = &daily[0];
        assert_eq!(first.timeframe, Timeframe::D1);
        assert_eq!(first.open, 100.0);
        assert_eq!(first.high, 125.0);
        assert_eq!(first.low, 98.0);
        assert_eq!(first.close, 124.0);
        assert_eq!(first.volume, 24.0);

        let second = &daily[1];
        assert_eq!(second.open_time, hourly[0].open_time + Duration::days(1));
        assert_eq!(second.open, 124.0);
        assert_eq!(second.close, 136.0);
        assert_eq!(second.volume, 12.0);
    }
}
