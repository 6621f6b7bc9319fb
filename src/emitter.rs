//! Signal Deduplication & Emission
//!
//! At most one ACTIVE signal per (strategy, symbol, timeframe, direction)
//! within one timeframe duration. The lookup and insert run under one lock so
//! a manual scan racing a scheduled tick cannot slip a duplicate in.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::store::SignalStore;
use crate::types::{Signal, SignalStatus, SignalType, StrategyType, Timeframe, WsMessage};

/// Detector output converted to signal shape, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub strategy_type: StrategyType,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub signal_type: SignalType,
    pub price: f64,
    pub metadata: serde_json::Value,
}

pub struct SignalEmitter {
    store: Arc<dyn SignalStore>,
    tx: broadcast::Sender<WsMessage>,
    guard: Mutex<()>,
}

impl SignalEmitter {
    pub fn new(store: Arc<dyn SignalStore>, tx: broadcast::Sender<WsMessage>) -> Self {
        Self {
            store,
            tx,
            guard: Mutex::new(()),
        }
    }

    /// Persist and publish `candidate` unless an equivalent ACTIVE signal was
    /// detected within the last timeframe duration. Store failures are logged
    /// and the candidate is dropped; the next qualifying bar close retries.
    pub fn emit(&self, candidate: Candidate, now: DateTime<Utc>) -> Option<Signal> {
        let _lock = match self.guard.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };

        let since = now - candidate.timeframe.duration();
        match self.store.find_active_signal(
            candidate.strategy_type,
            &candidate.symbol,
            candidate.timeframe,
            candidate.signal_type,
            since,
        ) {
            Ok(Some(existing)) => {
                debug!(
                    strategy = %candidate.strategy_type,
                    symbol = %candidate.symbol,
                    timeframe = %candidate.timeframe,
                    existing = %existing.id,
                    "Duplicate signal suppressed"
                );
                return None;
            }
            Ok(None) => {}
            Err(e) => {
                error!(
                    strategy = %candidate.strategy_type,
                    symbol = %candidate.symbol,
                    timeframe = %candidate.timeframe,
                    "Active signal lookup failed, dropping candidate: {:#}",
                    e
                );
                return None;
            }
        }

        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            strategy_type: candidate.strategy_type,
            symbol: candidate.symbol,
            timeframe: candidate.timeframe,
            signal_type: candidate.signal_type,
            price: candidate.price,
            detected_at: now,
            status: SignalStatus::Active,
            metadata: candidate.metadata,
        };

        let created = match self.store.create_signal(&signal) {
            Ok(created) => created,
            Err(e) => {
                error!(
                    strategy = %signal.strategy_type,
                    symbol = %signal.symbol,
                    timeframe = %signal.timeframe,
                    "Failed to persist signal, dropping candidate: {:#}",
                    e
                );
                return None;
            }
        };

        info!(
            id = %created.id,
            strategy = %created.strategy_type,
            symbol = %created.symbol,
            timeframe = %created.timeframe,
            side = %created.signal_type,
            price = created.price,
            "New signal"
        );
        let _ = self.tx.send(WsMessage::SignalNew {
            signal: created.clone(),
        });
        Some(created)
    }
}
