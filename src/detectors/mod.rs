//! Detector Library
//!
//! Pure, stateless functions over a chronologically ordered bar slice:
//! - RSI with Wilder smoothing
//! - Pivot highs/lows
//! - RSI divergence between consecutive pivots
//! - Engulfing / RUN / REV patterns with the run-length ("x") metric
//! - Hammer and 1:3 strong-reversal pairs
//! - Three-day positional (ICT) bias
//! - RSI overbought/oversold alerts
//!
//! Insufficient data always yields an empty or neutral result, never an error.

pub mod alerts;
pub mod bias;
pub mod divergence;
pub mod engulfing;
pub mod hammer;
pub mod pivots;
pub mod rsi;

use serde::{Deserialize, Serialize};

use crate::types::SignalType;

pub use alerts::{rsi_alert, RsiAlert};
pub use bias::{aggregate_daily, daily_bias, daily_bias_at, Bias, BiasResult};
pub use divergence::{detect_rsi_divergence, Divergence, DivergenceKind, DivergenceParams, DivergenceResult};
pub use engulfing::{analyze_pair, detect_super_engulfing, run_length, EngulfingResult, SuperEngulfing, SuperEngulfingPattern};
pub use hammer::{detect_hammer, is_strong_reversal, HammerResult};
pub use pivots::{pivot_highs, pivot_lows};
pub use rsi::{rsi, rsi_series};

/// Direction of a detected pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Bullish => SignalType::Buy,
            Self::Bearish => SignalType::Sell,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Med,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Med => "MED",
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::types::{Bar, Timeframe};

    pub fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    /// Bar `index` steps after the test epoch
    pub fn candle(index: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::H1,
            open_time: start() + Duration::hours(index),
            open,
            high,
            low,
            close,
            volume: 1.0,
            quote_volume: None,
        }
    }

    /// Bars whose open equals the previous close, high/low hugging the body
    pub fn from_closes(closes: &[f64]) -> Vec<Bar> {
        let mut prev = closes.first().copied().unwrap_or(0.0);
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = prev;
                prev = close;
                candle(i as i64, open, open.max(close) + 0.1, open.min(close) - 0.1, close)
            })
            .collect()
    }
}
