use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::feed::ConnectionState;
use crate::scheduler::{TickReport, TimeframeStatus};
use crate::store::{self, SignalQuery};
use crate::types::{normalize_symbol, AppState, Bar, ClientMessage, Signal, Timeframe, WsMessage};

const DEFAULT_CANDLE_LIMIT: usize = 200;
const MAX_CANDLE_LIMIT: usize = 1000;

/// Error type for API responses
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad_request: {msg}"),
            Self::Internal(msg) => write!(f, "internal_error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", e))
    }
}

/// Response for signals list
#[derive(Serialize)]
pub struct SignalsResponse {
    pub signals: Vec<Signal>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct CandlesResponse {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Bar>,
}

#[derive(Serialize)]
pub struct FeedStatus {
    pub venue: &'static str,
    pub state: ConnectionState,
}

#[derive(Serialize)]
pub struct SchedulerStatusResponse {
    pub timeframes: Vec<TimeframeStatus>,
    pub feeds: Vec<FeedStatus>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/signals", get(get_signals))
        .route("/api/candles", get(get_candles))
        .route("/api/scan/{timeframe}", post(trigger_scan))
        .route("/api/scheduler/status", get(scheduler_status))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /api/signals - newest first, filtered by strategy, symbol and timeframe
pub async fn get_signals(
    State(state): State<Arc<AppState>>,
    Query(mut query): Query<SignalQuery>,
) -> Result<Json<SignalsResponse>, ApiError> {
    query.symbol = query.symbol.as_deref().map(normalize_symbol);
    let signal_store = state.signals.clone();
    let signals = store::blocking(move || signal_store.query_signals(&query)).await?;
    Ok(Json(SignalsResponse {
        count: signals.len(),
        signals,
    }))
}

/// GET /api/candles - oldest first, backfilled when the store is short
pub async fn get_candles(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CandlesQuery>,
) -> Result<Json<CandlesResponse>, ApiError> {
    let symbol = normalize_symbol(&params.symbol);
    if symbol.is_empty() {
        return Err(ApiError::BadRequest("symbol is required".to_string()));
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_CANDLE_LIMIT)
        .clamp(1, MAX_CANDLE_LIMIT);

    state
        .backfiller
        .ensure_bars(&symbol, params.timeframe, limit.max(state.min_bars.min(MAX_CANDLE_LIMIT)))
        .await;
    let (bars, timeframe) = (state.bars.clone(), params.timeframe);
    let candles = {
        let symbol = symbol.clone();
        store::blocking(move || bars.latest_bars(&symbol, timeframe, limit)).await?
    };

    Ok(Json(CandlesResponse {
        symbol,
        timeframe: params.timeframe,
        candles,
    }))
}

/// POST /api/scan/{timeframe} - run one detection pass now
pub async fn trigger_scan(
    State(state): State<Arc<AppState>>,
    Path(timeframe): Path<String>,
) -> Result<Json<TickReport>, ApiError> {
    let timeframe: Timeframe = timeframe
        .parse()
        .map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))?;
    info!(%timeframe, "Manual detection pass requested");
    Ok(Json(state.scheduler.run_tick(timeframe).await))
}

/// GET /api/scheduler/status
pub async fn scheduler_status(State(state): State<Arc<AppState>>) -> Json<SchedulerStatusResponse> {
    Json(SchedulerStatusResponse {
        timeframes: state.scheduler.status(),
        feeds: state
            .feeds
            .iter()
            .map(|feed| FeedStatus {
                venue: feed.venue(),
                state: feed.state(),
            })
            .collect(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Signals always go out; candle updates only for subscribed symbols once
/// the client has subscribed to any.
fn should_forward(msg: &WsMessage, filter: &HashSet<String>) -> bool {
    match msg {
        WsMessage::CandleUpdate { symbol, .. } => filter.is_empty() || filter.contains(symbol),
        _ => true,
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.tx.subscribe();
    let filter: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));

    // Send current universe to new client
    let welcome = WsMessage::Connected {
        symbols: state.scheduler.load_universe().await,
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Forward live updates to this client
    let send_filter = filter.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client lagging, messages dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !should_forward(&msg, &*send_filter.read().await) {
                continue;
            }
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Handle subscribe/unsubscribe from the client
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(client_msg) = serde_json::from_str::<ClientMessage>(text.as_str()) {
                    let Some(symbol) = client_msg.symbol.as_deref().map(normalize_symbol) else {
                        continue;
                    };
                    match client_msg.action.as_str() {
                        "subscribe" => {
                            debug!(%symbol, "Client subscribed");
                            filter.write().await.insert(symbol);
                        }
                        "unsubscribe" => {
                            filter.write().await.remove(&symbol);
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::Backfiller;
    use crate::clock::{Clock, FixedClock};
    use crate::emitter::SignalEmitter;
    use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    use crate::scheduler::{Scheduler, SchedulerConfig, TradingWindow};
    use crate::store::{BarStore, SignalStore, SqliteStore};
    use crate::types::{SignalStatus, SignalType, StrategyType};
    use chrono::{TimeZone, Utc};
    use tokio::sync::broadcast;

    fn app_state() -> (Arc<SqliteStore>, Arc<AppState>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 30).unwrap()));
        let (tx, _rx) = broadcast::channel(16);
        let backfiller = Arc::new(Backfiller::new(store.clone(), Vec::new()));
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            store.clone(),
            backfiller.clone(),
            SignalEmitter::new(store.clone(), tx.clone()),
            TradingWindow::new(chrono_tz::UTC),
            clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig {
                symbol_delay: std::time::Duration::ZERO,
                symbols: vec!["BTCUSDT".to_string()],
                ..Default::default()
            },
            clock,
            store.clone(),
            orchestrator,
        ));
        let state = Arc::new(AppState {
            tx,
            bars: store.clone(),
            signals: store.clone(),
            backfiller,
            scheduler,
            feeds: Vec::new(),
            min_bars: 200,
        });
        (store, state)
    }

    #[tokio::test]
    async fn test_signals_endpoint_filters() {
        let (store, state) = app_state();
        for (i, symbol) in ["BTCUSDT", "ETHUSDT"].iter().enumerate() {
            store
                .create_signal(&Signal {
                    id: format!("sig-{i}"),
                    strategy_type: StrategyType::RsiAlert,
                    symbol: symbol.to_string(),
                    timeframe: Timeframe::H1,
                    signal_type: SignalType::Buy,
                    price: 1.0,
                    detected_at: Utc.with_ymd_and_hms(2024, 3, 4, 10 + i as u32, 0, 30).unwrap(),
                    status: SignalStatus::Active,
                    metadata: json!({"type": "OVERSOLD"}),
                })
                .unwrap();
        }

        let query = SignalQuery {
            symbol: Some("ethusdt".to_string()),
            ..Default::default()
        };
        let Json(response) = get_signals(State(state), Query(query)).await.unwrap();
        assert_eq!(response.count, 1);
        assert_eq!(response.signals[0].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn test_candles_endpoint_returns_ascending() {
        let (store, state) = app_state();
        let bars: Vec<Bar> = (0..5)
            .map(|i| Bar {
                symbol: "BTCUSDT".to_string(),
                timeframe: Timeframe::H4,
                open_time: Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap() + chrono::Duration::hours(4 * i),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 3.0,
                quote_volume: None,
            })
            .collect();
        store.upsert_bars(&bars).unwrap();

        let params = CandlesQuery {
            symbol: "btcusdt".to_string(),
            timeframe: Timeframe::H4,
            limit: Some(3),
        };
        let Json(response) = get_candles(State(state), Query(params)).await.unwrap();
        assert_eq!(response.candles.len(), 3);
        assert!(response.candles[0].open_time < response.candles[2].open_time);
        assert_eq!(response.candles[2].open_time, bars[4].open_time);
    }

    #[tokio::test]
    async fn test_scan_rejects_unknown_timeframe() {
        let (_store, state) = app_state();
        let err = trigger_scan(State(state.clone()), Path("3h".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let Json(report) = trigger_scan(State(state), Path("1h".to_string())).await.unwrap();
        assert_eq!(report.symbols, 1);
    }

    #[tokio::test]
    async fn test_scheduler_status_lists_every_timeframe() {
        let (_store, state) = app_state();
        let Json(status) = scheduler_status(State(state)).await;
        assert_eq!(status.timeframes.len(), Timeframe::ALL.len());
        assert!(status.feeds.is_empty());
    }

    #[test]
    fn test_candle_filter() {
        let bar = Bar {
            symbol: "ETHUSDT".to_string(),
            timeframe: Timeframe::M5,
            open_time: Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            quote_volume: None,
        };
        let msg = WsMessage::CandleUpdate {
            symbol: bar.symbol.clone(),
            timeframe: bar.timeframe,
            bar,
        };
        let mut filter = HashSet::new();
        assert!(should_forward(&msg, &filter));
        filter.insert("BTCUSDT".to_string());
        assert!(!should_forward(&msg, &filter));
        assert!(should_forward(&WsMessage::Error { message: "x".to_string() }, &filter));
    }

    #[test]
    fn test_internal_error_status() {
        let err: ApiError = anyhow::anyhow!("boom").into();
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
