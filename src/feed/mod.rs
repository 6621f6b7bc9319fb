//! Exchange Feed Adapters
//!
//! One long-lived WebSocket per venue, owned by an actor task (`adapter`).
//! Venue quirks (URLs, interval names, message shapes) stay behind the
//! `Venue` trait; everything past `parse_message` sees canonical `Bar`s.

pub mod adapter;
pub mod binance;
pub mod bybit;
pub mod subscriptions;

pub use adapter::{spawn_feed, ConnectionState, FeedCommand, FeedHandle};
pub use binance::Binance;
pub use bybit::Bybit;
pub use subscriptions::SubscriptionSet;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::store::BarStore;
use crate::types::{normalize_symbol, Bar, Timeframe, WsMessage};

/// A (symbol, timeframe) kline stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SubscriptionKey {
    pub fn new(symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            timeframe,
        }
    }
}

/// A kline event decoded from a venue stream
#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub bar: Bar,
    pub closed: bool,
}

/// Venue reply to a subscribe or unsubscribe request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestAck {
    Accepted { request_id: Option<u64> },
    Rejected { request_id: Option<u64>, reason: String },
}

#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &'static str;

    fn ws_url(&self) -> &str;

    /// Maximum streams per subscribe request
    fn max_batch(&self) -> usize;

    fn subscribe_message(&self, keys: &[SubscriptionKey], request_id: u64) -> String;

    fn unsubscribe_message(&self, keys: &[SubscriptionKey], request_id: u64) -> String;

    /// Application-level keepalive, if the venue needs one
    fn ping_message(&self) -> Option<String> {
        None
    }

    /// Decode one inbound text frame. Acks, pongs and other non-kline
    /// messages decode to an empty list.
    fn parse_message(&self, text: &str) -> Result<Vec<KlineUpdate>>;

    /// Decode a request reply, if `text` is one
    fn parse_ack(&self, _text: &str) -> Option<RequestAck> {
        None
    }

    /// Most recent `limit` bars in chronological order
    async fn fetch_historical(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>>;
}

/// Build venues in priority order from their names
pub fn venues_from_names(names: &[String], timeout: std::time::Duration) -> Result<Vec<Arc<dyn Venue>>> {
    names
        .iter()
        .map(|name| -> Result<Arc<dyn Venue>> {
            match name.trim().to_ascii_lowercase().as_str() {
                "binance" => Ok(Arc::new(Binance::new(timeout)?)),
                "bybit" => Ok(Arc::new(Bybit::new(timeout)?)),
                other => Err(anyhow!("unknown venue '{}'", other)),
            }
        })
        .collect()
}

/// Decode a frame and fan out its closed bars: upsert into the store and
/// publish `candle:update`. In-progress bars are discarded and a bar that
/// fails to store is logged without holding back the rest of the frame.
/// Returns the number of closed bars accepted.
pub fn ingest_message(
    venue: &dyn Venue,
    store: &dyn BarStore,
    tx: &broadcast::Sender<WsMessage>,
    text: &str,
) -> Result<usize> {
    let mut accepted = 0;
    for update in venue.parse_message(text)? {
        if !update.closed {
            continue;
        }
        if let Err(e) = store.upsert_bar(&update.bar) {
            error!(
                venue = venue.name(),
                symbol = %update.bar.symbol,
                timeframe = %update.bar.timeframe,
                "Failed to store closed bar: {:#}",
                e
            );
            continue;
        }
        debug!(
            venue = venue.name(),
            symbol = %update.bar.symbol,
            timeframe = %update.bar.timeframe,
            "Closed bar ingested"
        );
        // No receivers is fine
        let _ = tx.send(WsMessage::CandleUpdate {
            symbol: update.bar.symbol.clone(),
            timeframe: update.bar.timeframe,
            bar: update.bar,
        });
        accepted += 1;
    }
    Ok(accepted)
}

/// Drop bars whose period has not ended yet; REST endpoints include the
/// in-progress bar.
pub(crate) fn drop_unclosed(mut bars: Vec<Bar>, now: DateTime<Utc>) -> Vec<Bar> {
    bars.retain(|bar| bar.open_time + bar.timeframe.duration() <= now);
    bars
}

/// Parse a JSON number that venues may send either as a string or a number
pub(crate) fn json_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub(crate) fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}
