//! Bybit v5 public spot kline streams and REST klines

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

pub const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
pub const REST_URL: &str = "https://api.bybit.com";

const MAX_ARGS_PER_REQUEST: usize = 10;
const MAX_KLINES_PER_REQUEST: usize = 1000;

pub struct Bybit {
    client: Client,
    ws_url: String,
    rest_url: String,
}

impl Bybit {
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
    match timeframe {
        Timeframe::M5 => "5",
        Timeframe::M15 => "15",
        Timeframe::H1 => "60",
        Timeframe::H4 => "240",
        Timeframe::D1 => "D",
        Timeframe::W1 => "W",
    }
}

pub fn timeframe_from_interval(raw: &str) -> Result<Timeframe> {
    match raw {
        "5" => Ok(Timeframe::M5),
        "15" => Ok(Timeframe::M15),
        "60" => Ok(Timeframe::H1),
        "240" => Ok(Timeframe::H4),
        "D" => Ok(Timeframe::D1),
        "W" => Ok(Timeframe::W1),
        other => Err(anyhow!("unsupported bybit interval '{}'", other)),
    }
}

fn topic(key: &SubscriptionKey) -> String {
    format!("kline.{}.{}", interval(key.timeframe), key.symbol)
}

#[derive(Debug, Deserialize)]
struct RawKline {
    start: i64,
    interval: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    turnover: Option<String>,
    confirm: bool,
}

fn num(field: &str, raw: &str) -> Result<f64> {
    raw.parse()
        .with_context(|| format!("Invalid {} value '{}'", field, raw))
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("Invalid timestamp {}", ms))
}

impl RawKline {
    fn into_update(self, symbol: &str) -> Result<KlineUpdate> {
        let bar = Bar {
            symbol: normalize_symbol(symbol),
            timeframe: timeframe_from_interval(&self.interval)?,
            open_time: millis(self.start)?,
            open: num("open", &self.open)?,
            high: num("high", &self.high)?,
            low: num("low", &self.low)?,
            close: num("close", &self.close)?,
            volume: num("volume", &self.volume)?,
            quote_volume: self.turnover.as_deref().and_then(|t| t.parse().ok()),
        };
        Ok(KlineUpdate {
            bar,
            closed: self.confirm,
        })
    }
}

/// Decode a public stream frame. Topic is `kline.{interval}.{symbol}`.
pub fn parse_stream_message(text: &str) -> Result<Vec<KlineUpdate>> {
    let value: Value = serde_json::from_str(text).context("bybit ws json parse")?;

    // Subscribe acks and pongs carry "op"
    if value.get("op").is_some() {
        return Ok(Vec::new());
    }

    let Some(topic) = value.get("topic").and_then(|t| t.as_str()) else {
        return Ok(Vec::new());
    };
    let mut parts = topic.splitn(3, '.');
    if parts.next() != Some("kline") {
        return Ok(Vec::new());
    }
    let symbol = parts
        .nth(1)
        .ok_or_else(|| anyhow!("kline topic without symbol: {}", topic))?;

    let data = value
        .get("data")
        .cloned()
        .ok_or_else(|| anyhow!("kline message without data: {}", topic))?;
    let raws: Vec<RawKline> = serde_json::from_value(data).context("bybit kline decode")?;
    raws.into_iter().map(|raw| raw.into_update(symbol)).collect()
}

/// Decode a subscribe/unsubscribe reply. Rejections arrive as
/// `{"success":false,"ret_msg":"...","req_id":"3","op":"subscribe"}`.
pub fn parse_ack(text: &str) -> Option<RequestAck> {
    let value: Value = serde_json::from_str(text).ok()?;
    let op = value.get("op").and_then(Value::as_str)?;
    if op != "subscribe" && op != "unsubscribe" {
        return None;
    }
    let request_id = value
        .get("req_id")
        .and_then(json_i64)
        .and_then(|id| u64::try_from(id).ok());
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let reason = value
            .get("ret_msg")
            .and_then(Value::as_str)
            .unwrap_or("request rejected")
            .to_string();
        return Some(RequestAck::Rejected { request_id, reason });
    }
    Some(RequestAck::Accepted { request_id })
}

/// Decode a REST `/v5/market/kline` response. Bybit lists newest first; the
/// result is returned oldest first.
pub fn parse_rest_klines(symbol: &str, timeframe: Timeframe, body: &Value) -> Result<Vec<Bar>> {
    let ret_code = body.get("retCode").and_then(|c| c.as_i64()).unwrap_or(-1);
    if ret_code != 0 {
        let msg = body.get("retMsg").and_then(|m| m.as_str()).unwrap_or("unknown error");
        return Err(anyhow!("bybit kline request failed ({}): {}", ret_code, msg));
    }
    let rows = body
        .get("result")
        .and_then(|r| r.get("list"))
        .and_then(|l| l.as_array())
        .ok_or_else(|| anyhow!("bybit kline response without result.list"))?;

    let mut bars = rows
        .iter()
        .map(|row| {
            let value = |i: usize| -> Result<f64> {
                row.get(i)
                    .and_then(json_f64)
                    .ok_or_else(|| anyhow!("invalid number in kline row: {}", row))
            };
            let start = row
                .get(0)
                .and_then(json_i64)
                .ok_or_else(|| anyhow!("invalid start time in kline row: {}", row))?;
            Ok(Bar {
                symbol: normalize_symbol(symbol),
                timeframe,
                open_time: millis(start)?,
                open: value(1)?,
                high: value(2)?,
                low: value(3)?,
                close: value(4)?,
                volume: value(5)?,
                quote_volume: row.get(6).and_then(json_f64),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    bars.reverse();
    Ok(bars)
}

#[async_trait]
impl Venue for Bybit {
    fn name(&self) -> &'static str {
        "bybit"
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn max_batch(&self) -> usize {
        MAX_ARGS_PER_REQUEST
    }

    fn subscribe_message(&self, keys: &[SubscriptionKey], request_id: u64) -> String {
        let args: Vec<String> = keys.iter().map(topic).collect();
        json!({"req_id": request_id.to_string(), "op": "subscribe", "args": args}).to_string()
    }

    fn unsubscribe_message(&self, keys: &[SubscriptionKey], request_id: u64) -> String {
        let args: Vec<String> = keys.iter().map(topic).collect();
        json!({"req_id": request_id.to_string(), "op": "unsubscribe", "args": args}).to_string()
    }

    fn ping_message(&self) -> Option<String> {
        Some(json!({"op": "ping"}).to_string())
    }

    fn parse_message(&self, text: &str) -> Result<Vec<KlineUpdate>> {
        parse_stream_message(text)
    }

    fn parse_ack(&self, text: &str) -> Option<RequestAck> {
        parse_ack(text)
    }

    async fn fetch_historical(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>> {
        let symbol = normalize_symbol(symbol);
        let limit_param = limit.clamp(1, MAX_KLINES_PER_REQUEST).to_string();
        let url = format!("{}/v5/market/kline", self.rest_url);
        debug!(%symbol, %timeframe, limit, "Fetching Bybit klines");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("category", "spot"),
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
