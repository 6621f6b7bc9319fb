//! Binance spot kline streams and REST klines

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{drop_unclosed, json_f64, json_i64, KlineUpdate, RequestAck, SubscriptionKey, Venue};
use crate::types::{normalize_symbol, Bar, Timeframe};

pub const WS_URL: &str = "wss://stream.binance.com:9443/stream";
pub const REST_URL: &str = "https://api.binance.com";

const MAX_STREAMS_PER_REQUEST: usize = 200;
const MAX_KLINES_PER_REQUEST: usize = 1000;

pub struct Binance {
    client: Client,
    ws_url: String,
    rest_url: String,
}

impl Binance {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_urls(WS_URL, REST_URL, timeout)
    }

    pub fn with_urls(ws_url: &str, rest_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to create HTTP client")?,
            ws_url: ws_url.to_string(),
            rest_url: rest_url.trim_end_matches('/').to_string(),
        })
    }
}

pub fn interval(timeframe: Timeframe) -> &'static str {
    // Binance interval names match ours
    timeframe.as_str()
}

fn stream_name(key: &SubscriptionKey) -> String {
    format!("{}@kline_{}", key.symbol.to_ascii_lowercase(), interval(key.timeframe))
}

/// `k` payload of a kline event
#[derive(Debug, Deserialize)]
struct RawKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: Option<String>,
    #[serde(rename = "x")]
    closed: bool,
}

fn num(field: &str, raw: &str) -> Result<f64> {
    raw.parse()
        .with_context(|| format!("Invalid {} value '{}'", field, raw))
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("Invalid timestamp {}", ms))
}

impl RawKline {
    fn into_update(self) -> Result<KlineUpdate> {
        let bar = Bar {
            symbol: normalize_symbol(&self.symbol),
            timeframe: self.interval.parse()?,
            open_time: millis(self.open_time)?,
            open: num("open", &self.open)?,
            high: num("high", &self.high)?,
            low: num("low", &self.low)?,
            close: num("close", &self.close)?,
            volume: num("volume", &self.volume)?,
            quote_volume: self.quote_volume.as_deref().and_then(|q| q.parse().ok()),
        };
        Ok(KlineUpdate {
            bar,
            closed: self.closed,
        })
    }
}

/// Decode a combined-stream or raw-stream frame
pub fn parse_stream_message(text: &str) -> Result<Vec<KlineUpdate>> {
    let value: Value = serde_json::from_str(text).context("binance ws json parse")?;

    // Subscription acks: {"result":null,"id":1}
    if value.get("result").is_some() || value.get("id").is_some() {
        return Ok(Vec::new());
    }

    let data = value.get("data").unwrap_or(&value);
    if data.get("e").and_then(|e| e.as_str()) != Some("kline") {
        return Ok(Vec::new());
    }
    let kline = data
        .get("k")
        .cloned()
        .ok_or_else(|| anyhow!("kline event without 'k' payload"))?;
    let raw: RawKline = serde_json::from_value(kline).context("binance kline decode")?;
    Ok(vec![raw.into_update()?])
}

/// Decode a request reply: `{"result":null,"id":1}` or
/// `{"error":{"code":2,"msg":"..."},"id":1}`
pub fn parse_ack(text: &str) -> Option<RequestAck> {
    let value: Value = serde_json::from_str(text).ok()?;
    let request_id = value.get("id").and_then(Value::as_u64);
    match value.get("error") {
        Some(error) => Some(RequestAck::Rejected {
            request_id,
            reason: error
                .get("msg")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        }),
        None if value.get("id").is_some() => Some(RequestAck::Accepted { request_id }),
        None => None,
    }
}

/// Decode a REST `/api/v3/klines` response (array of arrays, oldest first)
pub fn parse_rest_klines(symbol: &str, timeframe: Timeframe, body: &Value) -> Result<Vec<Bar>> {
    let rows = body
        .as_array()
        .ok_or_else(|| anyhow!("binance klines response is not an array: {}", body))?;

    rows.iter()
        .map(|row| {
            let field = |i: usize| row.get(i).ok_or_else(|| anyhow!("kline row too short: {}", row));
            let price = |i: usize| -> Result<f64> {
                json_f64(field(i)?).ok_or_else(|| anyhow!("invalid number in kline row: {}", row))
            };
            let open_ms =
                json_i64(field(0)?).ok_or_else(|| anyhow!("invalid open time in kline row: {}", row))?;
            Ok(Bar {
                symbol: normalize_symbol(symbol),
                timeframe,
                open_time: millis(open_ms)?,
                open: price(1)?,
                high: price(2)?,
                low: price(3)?,
                close: price(4)?,
                volume: price(5)?,
                quote_volume: row.get(7).and_then(json_f64),
            })
        })
        .collect()
}

#[async_trait]
impl Venue for Binance {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn max_batch(&self) -> usize {
        MAX_STREAMS_PER_REQUEST
    }

    fn subscribe_message(&self, keys: &[SubscriptionKey], request_id: u64) -> String {
        let params: Vec<String> = keys.iter().map(stream_name).collect();
        json!({"method": "SUBSCRIBE", "params": params, "id": request_id}).to_string()
    }

    fn unsubscribe_message(&self, keys: &[SubscriptionKey], request_id: u64) -> String {
        let params: Vec<String> = keys.iter().map(stream_name).collect();
        json!({"method": "UNSUBSCRIBE", "params": params, "id": request_id}).to_string()
    }

    fn parse_message(&self, text: &str) -> Result<Vec<KlineUpdate>> {
        parse_stream_message(text)
    }

    fn parse_ack(&self, text: &str) -> Option<RequestAck> {
        parse_ack(text)
    }

    async fn fetch_historical(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>> {
        let symbol = normalize_symbol(symbol);
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let limit_param = limit.to_string();
        let url = format!("{}/api/v3/klines", self.rest_url);
        debug!(%symbol, %timeframe, limit, "Fetching Binance klines");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.as_str()),
                ("interval", interval(timeframe)),
                ("limit", limit_param.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Request to {} failed ({}): {}", url, status, body));
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;
        let bars = parse_rest_klines(&symbol, timeframe, &body)?;
        Ok(drop_unclosed(bars, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ack_and_rejection() {
        assert_eq!(
            parse_ack(r#"{"result":null,"id":4}"#),
            Some(RequestAck::Accepted { request_id: Some(4) })
        );
        assert_eq!(
            parse_ack(r#"{"error":{"code":2,"msg":"Invalid request"},"id":3}"#),
            Some(RequestAck::Rejected {
                request_id: Some(3),
                reason: "Invalid request".to_string(),
            })
        );
        assert!(parse_ack(r#"{"stream":"btcusdt@kline_1h","data":{"e":"kline"}}"#).is_none());
        // Rejections carry no klines
        assert!(parse_stream_message(r#"{"error":{"code":2,"msg":"Invalid request"},"id":3}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_parse_closed_kline() {
        let text = r#"{"stream":"ethusdt@kline_4h","data":{"e":"kline","E":1709568000100,"s":"ETHUSDT","k":{"t":1709553600000,"T":1709567999999,"s":"ETHUSDT","i":"4h","f":1,"L":2,"o":"3400.10","c":"3450.00","h":"3460.5","l":"3390.0","v":"1500.5","n":10,"x":true,"q":"5100000.0","V":"700","Q":"2400000","B":"0"}}}"#;
        let updates = parse_stream_message(text).unwrap();
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert!(update.closed);
        assert_eq!(update.bar.symbol, "ETHUSDT");
        assert_eq!(update.bar.timeframe, Timeframe::H4);
        assert_eq!(update.bar.open_time.timestamp_millis(), 1_709_553_600_000);
        assert_eq!(update.bar.high, 3460.5);
        assert_eq!(update.bar.quote_volume, Some(5_100_000.0));
    }

    #[test]
    fn test_acks_and_other_events_ignored() {
        assert!(parse_stream_message(r#"{"result":null,"id":3}"#).unwrap().is_empty());
        let trade = r#"{"stream":"btcusdt@trade","data":{"e":"trade","s":"BTCUSDT","p":"1"}}"#;
        assert!(parse_stream_message(trade).unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_message_shape() {
        let venue = Binance::new(Duration::from_secs(1)).unwrap();
        let keys = vec![
            SubscriptionKey::new("btcusdt", Timeframe::H1),
            SubscriptionKey::new("ETHUSDT", Timeframe::W1),
        ];
        let msg: Value = serde_json::from_str(&venue.subscribe_message(&keys, 7)).unwrap();
        assert_eq!(msg["method"], "SUBSCRIBE");
        assert_eq!(msg["params"][0], "btcusdt@kline_1h");
        assert_eq!(msg["params"][1], "ethusdt@kline_1w");
        assert_eq!(msg["id"], 7);
    }

    #[test]
    fn test_parse_rest_klines() {
        let body: Value = serde_json::from_str(
            r#"[
                [1709510400000,"100.0","105.0","99.0","104.0","50.0",1709513999999,"5100.0",12,"20","2000","0"],
                [1709514000000,"104.0","106.0","103.0","105.5","40.0",1709517599999,"4200.0",9,"15","1500","0"]
            ]"#,
        )
        .unwrap();
        let bars = parse_rest_klines("btcusdt", Timeframe::H1, &body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].symbol, "BTCUSDT");
        assert!(bars[0].open_time < bars[1].open_time);
        assert_eq!(bars[1].close, 105.5);
        assert_eq!(bars[1].quote_volume, Some(4200.0));
    }

    #[test]
    fn test_parse_rest_error_body() {
        let body: Value = serde_json::from_str(r#"{"code":-1121,"msg":"Invalid symbol."}"#).unwrap();
        assert!(parse_rest_klines("NOPE", Timeframe::H1, &body).is_err());
    }
}
