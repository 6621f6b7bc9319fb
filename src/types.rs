use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::backfill::Backfiller;
use crate::feed::FeedHandle;
use crate::scheduler::Scheduler;
use crate::store::{BarStore, SignalStore};

/// Candle bucket duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Self::M5 => 5 * 60,
            Self::M15 => 15 * 60,
            Self::H1 => 60 * 60,
            Self::H4 => 4 * 60 * 60,
            Self::D1 => 24 * 60 * 60,
            Self::W1 => 7 * 24 * 60 * 60,
        }
    }

    /// Bar duration, also the signal dedup window
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" | "60m" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            "1w" => Ok(Self::W1),
            other => Err(anyhow!("unsupported timeframe '{}'", other)),
        }
    }
}

/// Closed OHLCV bar, unique by (symbol, timeframe, open_time)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: Option<f64>,
}

impl Bar {
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn upper_shadow(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_shadow(&self) -> f64 {
        self.open.min(self.close) - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Normalize a venue ticker to the canonical uppercase form
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    SuperEngulfing,
    RsiDivergence,
    IctBias,
    Hammer,
    RsiAlert,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuperEngulfing => "SUPER_ENGULFING",
            Self::RsiDivergence => "RSI_DIVERGENCE",
            Self::IctBias => "ICT_BIAS",
            Self::Hammer => "HAMMER",
            Self::RsiAlert => "RSI_ALERT",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUPER_ENGULFING" => Ok(Self::SuperEngulfing),
            "RSI_DIVERGENCE" => Ok(Self::RsiDivergence),
            "ICT_BIAS" => Ok(Self::IctBias),
            "HAMMER" => Ok(Self::Hammer),
            "RSI_ALERT" => Ok(Self::RsiAlert),
            other => Err(anyhow!("unknown strategy type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(anyhow!("unknown signal type '{}'", other)),
        }
    }
}

/// Signal lifecycle state. Only `Active` is ever written here; the rest
/// belong to downstream lifecycle management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Active,
    Expired,
    Filled,
    Closed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Filled => "FILLED",
            Self::Closed => "CLOSED",
        }
    }
}

impl FromStr for SignalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "EXPIRED" => Ok(Self::Expired),
            "FILLED" => Ok(Self::Filled),
            "CLOSED" => Ok(Self::Closed),
            other => Err(anyhow!("unknown signal status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: String,
    pub strategy_type: StrategyType,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub signal_type: SignalType,
    pub price: f64,
    pub detected_at: DateTime<Utc>,
    pub status: SignalStatus,
    /// Strategy-specific fields (pattern, confidence, RSI values, ...)
    pub metadata: serde_json::Value,
}

/// Messages published on the live-update channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    #[serde(rename = "signal:new")]
    SignalNew { signal: Signal },
    #[serde(rename = "candle:update")]
    CandleUpdate {
        symbol: String,
        timeframe: Timeframe,
        bar: Bar,
    },
    Connected { symbols: Vec<String> },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    pub symbol: Option<String>,
}

/// Shared state behind the HTTP/WebSocket surface
pub struct AppState {
    pub tx: broadcast::Sender<WsMessage>,
    pub bars: Arc<dyn BarStore>,
    pub signals: Arc<dyn SignalStore>,
    pub backfiller: Arc<Backfiller>,
    pub scheduler: Arc<Scheduler>,
    pub feeds: Vec<FeedHandle>,
    /// Bars requested by the candles endpoint before answering
    pub min_bars: usize,
}
