//! Bar-close aligned detection scheduler
//!
//! One timer per timeframe fires a fixed offset after each bar close
//! (default 30s) so the closing bar has landed in the store. A tick walks the
//! symbol universe sequentially with a small delay between symbols and
//! isolates failures per symbol.

pub mod gate;

pub use gate::{is_gated, DailyWindow, TradingWindow};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::orchestrator::{strategies_for, Orchestrator};
use crate::store::{self, BarStore};
use crate::types::{StrategyType, Timeframe};

/// Fallback universe when nothing is configured and the store is empty
pub const DEFAULT_SYMBOLS: [&str; 5] = ["BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT"];

/// Number of recently seen symbols used when no universe is configured
const STORE_UNIVERSE_LIMIT: usize = 20;

/// 1970-01-05 00:00 UTC, a Monday; weekly bars open on Mondays
const WEEK_ANCHOR_SECS: i64 = 4 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay after a bar close before the tick fires
    pub tick_offset: Duration,
    /// Pause between symbols inside a tick
    pub symbol_delay: std::time::Duration,
    /// Configured universe; empty means resolve from the store
    pub symbols: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_offset: Duration::seconds(30),
            symbol_delay: std::time::Duration::from_millis(250),
            symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TickPhase {
    Idle,
    Firing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub timeframe: Timeframe,
    pub symbols: usize,
    pub failures: usize,
    pub signals: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeframeStatus {
    pub timeframe: Timeframe,
    pub schedule: String,
    pub next_fire: DateTime<Utc>,
    pub phase: TickPhase,
    pub strategies: Vec<StrategyType>,
    pub gated_strategies: Vec<StrategyType>,
    pub last_tick: Option<TickReport>,
}

struct TimeframeState {
    phase: TickPhase,
    last_tick: Option<TickReport>,
}

/// Next instant after `now` that lies `offset` past a bar close of `timeframe`.
/// Bars are aligned to the Unix epoch in UTC, weekly bars to Mondays.
pub fn next_fire_time(now: DateTime<Utc>, timeframe: Timeframe, offset: Duration) -> DateTime<Utc> {
    let step = timeframe.seconds();
    let anchor = if timeframe == Timeframe::W1 {
        WEEK_ANCHOR_SECS
    } else {
        0
    };
    let offset_secs = offset.num_seconds();
    let shifted = now.timestamp() - offset_secs - anchor;
    let index = shifted.div_euclid(step) + 1;
    let fire = anchor + index * step + offset_secs;
    DateTime::<Utc>::from_timestamp(fire, 0).unwrap_or(now + timeframe.duration())
}

pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    bars: Arc<dyn BarStore>,
    orchestrator: Arc<Orchestrator>,
    states: Mutex<HashMap<Timeframe, TimeframeState>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        bars: Arc<dyn BarStore>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        let states = Timeframe::ALL
            .iter()
            .map(|tf| {
                (
                    *tf,
                    TimeframeState {
                        phase: TickPhase::Idle,
                        last_tick: None,
                    },
                )
            })
            .collect();
        Self {
            config,
            clock,
            bars,
            orchestrator,
            states: Mutex::new(states),
        }
    }

    /// Spawn one timer task per timeframe
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        Timeframe::ALL
            .iter()
            .map(|tf| {
                let scheduler = Arc::clone(self);
                let tf = *tf;
                tokio::spawn(async move { scheduler.run_timeframe(tf).await })
            })
            .collect()
    }

    async fn run_timeframe(self: Arc<Self>, timeframe: Timeframe) {
        loop {
            let now = self.clock.now();
            let next = next_fire_time(now, timeframe, self.config.tick_offset);
            debug!(%timeframe, next = %next, "Next detection tick scheduled");
            let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(wait).await;

            let report = self.run_tick(timeframe).await;
            info!(
                %timeframe,
                symbols = report.symbols,
                signals = report.signals,
                failures = report.failures,
                "Detection tick complete"
            );
        }
    }

    /// Run one detection pass over the symbol universe. Also used by the
    /// manual trigger.
    pub async fn run_tick(&self, timeframe: Timeframe) -> TickReport {
        let started_at = self.clock.now();
        self.set_phase(timeframe, TickPhase::Firing);

        let symbols = self.load_universe().await;
        let mut signals = 0;
        let mut failures = 0;

        for (i, symbol) in symbols.iter().enumerate() {
            if i > 0 && !self.config.symbol_delay.is_zero() {
                tokio::time::sleep(self.config.symbol_delay).await;
            }
            match self.orchestrator.process(symbol, timeframe).await {
                Ok(emitted) => signals += emitted,
                Err(e) => {
                    failures += 1;
                    error!(%symbol, %timeframe, "Detection failed: {:#}", e);
                }
            }
        }

        let report = TickReport {
            timeframe,
            symbols: symbols.len(),
            failures,
            signals,
            started_at,
            finished_at: self.clock.now(),
        };

        if let Ok(mut states) = self.states.lock() {
            if let Some(state) = states.get_mut(&timeframe) {
                state.phase = TickPhase::Idle;
                state.last_tick = Some(report.clone());
            }
        }

        report
    }

    fn set_phase(&self, timeframe: Timeframe, phase: TickPhase) {
        if let Ok(mut states) = self.states.lock() {
            if let Some(state) = states.get_mut(&timeframe) {
                state.phase = phase;
            }
        }
    }

    /// Configured list, else most recently seen symbols, else the defaults
    pub fn resolve_universe(&self) -> Vec<String> {
        universe(&self.config.symbols, self.bars.as_ref())
    }

    /// `resolve_universe` off the async workers
    pub async fn load_universe(&self) -> Vec<String> {
        let (configured, bars) = (self.config.symbols.clone(), self.bars.clone());
        match store::blocking(move || Ok(universe(&configured, bars.as_ref()))).await {
            Ok(symbols) => symbols,
            Err(e) => {
                warn!("Universe lookup failed: {:#}", e);
                default_symbols()
            }
        }
    }

    pub fn status(&self) -> Vec<TimeframeStatus> {
        let now = self.clock.now();
        let states = self.states.lock().ok();
        Timeframe::ALL
            .iter()
            .map(|tf| {
                let strategies = strategies_for(*tf).to_vec();
                let gated_strategies = strategies
                    .iter()
                    .copied()
                    .filter(|s| is_gated(*s, *tf))
                    .collect();
                let (phase, last_tick) = states
                    .as_ref()
                    .and_then(|s| s.get(tf))
                    .map(|s| (s.phase, s.last_tick.clone()))
                    .unwrap_or((TickPhase::Idle, None));
                TimeframeStatus {
                    timeframe: *tf,
                    schedule: format!(
                        "every {} at +{}s after close (UTC)",
                        tf,
                        self.config.tick_offset.num_seconds()
                    ),
                    next_fire: next_fire_time(now, *tf, self.config.tick_offset),
                    phase,
                    strategies,
                    gated_strategies,
                    last_tick,
                }
            })
            .collect()
    }
}

fn universe(configured: &[String], bars: &dyn BarStore) -> Vec<String> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    match bars.query_distinct_symbols(STORE_UNIVERSE_LIMIT) {
        Ok(symbols) if !symbols.is_empty() => return symbols,
        Ok(_) => {}
        Err(e) => warn!("Failed to load symbols from bar store: {:#}", e),
    }
    default_symbols()
}

fn default_symbols() -> Vec<String> {
    DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::Backfiller;
    use crate::clock::FixedClock;
    use crate::emitter::SignalEmitter;
    use crate::orchestrator::OrchestratorConfig;
    use crate::store::SqliteStore;
    use crate::types::Bar;
    use chrono::TimeZone;
    use tokio::sync::broadcast;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_next_fire_time_per_timeframe() {
        let offset = Duration::seconds(30);
        let now = utc(2024, 3, 6, 13, 7, 10); // Wednesday

        assert_eq!(next_fire_time(now, Timeframe::M5, offset), utc(2024, 3, 6, 13, 10, 30));
        assert_eq!(next_fire_time(now, Timeframe::M15, offset), utc(2024, 3, 6, 13, 15, 30));
        assert_eq!(next_fire_time(now, Timeframe::H1, offset), utc(2024, 3, 6, 14, 0, 30));
        assert_eq!(next_fire_time(now, Timeframe::H4, offset), utc(2024, 3, 6, 16, 0, 30));
        assert_eq!(next_fire_time(now, Timeframe::D1, offset), utc(2024, 3, 7, 0, 0, 30));
        assert_eq!(next_fire_time(now, Timeframe::W1, offset), utc(2024, 3, 11, 0, 0, 30));
    }

    #[test]
    fn test_next_fire_time_inside_offset() {
        let offset = Duration::seconds(30);
        // Bar closed at 14:00 but the offset has not elapsed yet
        let now = utc(2024, 3, 6, 14, 0, 10);
        assert_eq!(next_fire_time(now, Timeframe::H1, offset), utc(2024, 3, 6, 14, 0, 30));
        // Exactly at the fire instant, the following one is returned
        let at_fire = utc(2024, 3, 6, 14, 0, 30);
        assert_eq!(next_fire_time(at_fire, Timeframe::H1, offset), utc(2024, 3, 6, 15, 0, 30));
    }

    fn scheduler_with(store: Arc<SqliteStore>, symbols: Vec<String>, now: DateTime<Utc>) -> Scheduler {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        let (tx, _rx) = broadcast::channel(16);
        let backfiller = Arc::new(Backfiller::new(store.clone(), Vec::new()));
        let emitter = SignalEmitter::new(store.clone(), tx);
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            store.clone(),
            backfiller,
            emitter,
            TradingWindow::new(chrono_tz::UTC),
            clock.clone(),
        ));
        let config = SchedulerConfig {
            symbol_delay: std::time::Duration::ZERO,
            symbols,
            ..Default::default()
        };
        Scheduler::new(config, clock, store, orchestrator)
    }

    #[test]
    fn test_universe_resolution_fallbacks() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = utc(2024, 3, 6, 12, 0, 30);

        let configured = scheduler_with(store.clone(), vec!["ADAUSDT".to_string()], now);
        assert_eq!(configured.resolve_universe(), vec!["ADAUSDT".to_string()]);

        let empty = scheduler_with(store.clone(), Vec::new(), now);
        assert_eq!(empty.resolve_universe().len(), DEFAULT_SYMBOLS.len());

        store
            .upsert_bar(&Bar {
                symbol: "DOGEUSDT".to_string(),
                timeframe: Timeframe::H1,
                open_time: utc(2024, 3, 6, 11, 0, 0),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
                quote_volume: None,
            })
            .unwrap();
        assert_eq!(empty.resolve_universe(), vec!["DOGEUSDT".to_string()]);
    }

    #[tokio::test]
    async fn test_tick_covers_all_symbols_and_reports_idle() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = utc(2024, 3, 6, 12, 0, 30);
        let scheduler = scheduler_with(
            store,
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            now,
        );

        let report = scheduler.run_tick(Timeframe::H1).await;
        assert_eq!(report.symbols, 2);
        assert_eq!(report.failures, 0);
        assert_eq!(report.signals, 0);

        let status = scheduler.status();
        let h1 = status.iter().find(|s| s.timeframe == Timeframe::H1).unwrap();
        assert_eq!(h1.phase, TickPhase::Idle);
        assert!(h1.last_tick.is_some());
        assert_eq!(h1.next_fire, utc(2024, 3, 6, 13, 0, 30));
        assert!(h1.gated_strategies.contains(&StrategyType::SuperEngulfing));
    }
}
