//! Detection Orchestrator
//!
//! Per (symbol, timeframe) tick: top up bars, run the strategies configured
//! for the timeframe (respecting the trading-window gate), turn detector
//! results into candidates and hand them to the emitter.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backfill::Backfiller;
use crate::clock::Clock;
use crate::detectors::{
    aggregate_daily, daily_bias_at, detect_hammer, detect_rsi_divergence, detect_super_engulfing,
    is_strong_reversal, rsi_alert, Bias, Confidence, Direction, Divergence, DivergenceParams,
    DivergenceResult,
};
use crate::emitter::{Candidate, SignalEmitter};
use crate::scheduler::gate::{is_gated, TradingWindow};
use crate::store::{self, BarStore};
use crate::types::{normalize_symbol, Bar, SignalType, StrategyType, Timeframe};

/// ICT bias strength (percent beyond the broken level) rated HIGH
const ICT_HIGH_CONFIDENCE_PCT: f64 = 0.5;
/// Hourly bars loaded when daily bars must be rebuilt for the bias rule
const HOURLY_BARS_FOR_BIAS: usize = 24 * 7;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bars requested from the store (and backfill) before detection
    pub min_bars: usize,
    pub divergence: DivergenceParams,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_bars: 200,
            divergence: DivergenceParams::default(),
        }
    }
}

/// Strategies evaluated on each timeframe
pub fn strategies_for(timeframe: Timeframe) -> &'static [StrategyType] {
    use StrategyType::*;
    match timeframe {
        Timeframe::M5 => &[SuperEngulfing],
        Timeframe::M15 => &[SuperEngulfing, RsiDivergence],
        Timeframe::H1 => &[SuperEngulfing, RsiDivergence, RsiAlert],
        Timeframe::H4 => &[SuperEngulfing, RsiDivergence, RsiAlert, Hammer],
        Timeframe::D1 => &[SuperEngulfing, RsiDivergence, RsiAlert, IctBias, Hammer],
        Timeframe::W1 => &[Hammer],
    }
}

fn candidate(
    strategy_type: StrategyType,
    symbol: &str,
    timeframe: Timeframe,
    signal_type: SignalType,
    price: f64,
    metadata: serde_json::Value,
) -> Candidate {
    Candidate {
        strategy_type,
        symbol: symbol.to_string(),
        timeframe,
        signal_type,
        price,
        metadata,
    }
}

/// RUN/REV on the last closed pair
pub fn super_engulfing_candidate(symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Option<Candidate> {
    let found = detect_super_engulfing(bars)?;
    let last = bars.last()?;
    Some(candidate(
        StrategyType::SuperEngulfing,
        symbol,
        timeframe,
        found.direction.signal_type(),
        last.close,
        json!({
            "pattern": found.pattern.as_str(),
            "patternType": found.pattern.pattern_type(),
            "direction": found.direction.as_str(),
            "xLogic": found.x_logic,
            "confidence": found.confidence.as_str(),
            "bodyRatio": found.body_ratio,
        }),
    ))
}

/// Divergences whose current pivot was confirmed by the latest bar
pub fn confirmed_divergences<'a>(
    result: &'a DivergenceResult,
    len: usize,
    right_bars: usize,
) -> impl Iterator<Item = &'a Divergence> {
    let confirmed = move |d: &&Divergence| d.curr_index + right_bars + 1 == len;
    result
        .bullish
        .iter()
        .find(confirmed)
        .into_iter()
        .chain(result.bearish.iter().find(confirmed))
}

pub fn divergence_candidates(
    symbol: &str,
    timeframe: Timeframe,
    bars: &[Bar],
    params: &DivergenceParams,
) -> Vec<Candidate> {
    let Some(last) = bars.last() else {
        return Vec::new();
    };
    let result = detect_rsi_divergence(bars, params);
    confirmed_divergences(&result, bars.len(), params.right_bars)
        .map(|d| {
            let confidence = if d.strong {
                Confidence::High
            } else {
                Confidence::Med
            };
            candidate(
                StrategyType::RsiDivergence,
                symbol,
                timeframe,
                d.direction.signal_type(),
                last.close,
                json!({
                    "type": d.direction.as_str(),
                    "divergenceType": d.label(),
                    "rsiLow": d.rsi_low(),
                    "rsiHigh": d.rsi_high(),
                    "prevPrice": d.prev_price,
                    "currPrice": d.curr_price,
                    "confidence": confidence.as_str(),
                }),
            )
        })
        .collect()
}

pub fn rsi_alert_candidate(symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Option<Candidate> {
    let alert = rsi_alert(bars);
    let (signal_type, kind) = if alert.is_oversold {
        (SignalType::Buy, "OVERSOLD")
    } else if alert.is_overbought {
        (SignalType::Sell, "OVERBOUGHT")
    } else {
        return None;
    };
    let last = bars.last()?;
    Some(candidate(
        StrategyType::RsiAlert,
        symbol,
        timeframe,
        signal_type,
        last.close,
        json!({
            "type": kind,
            "rsiValue": alert.rsi_value,
        }),
    ))
}

/// A 1:3 strong reversal on daily/weekly bars wins over a single hammer
pub fn hammer_candidate(symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Option<Candidate> {
    let last = bars.last()?;

    let reversal_label = match timeframe {
        Timeframe::D1 => Some("1:3 Daily"),
        Timeframe::W1 => Some("1:3 Weekly"),
        _ => None,
    };
    if let (Some(label), [.., prev, curr]) = (reversal_label, bars) {
        let opposite = (prev.is_bullish() && curr.is_bearish()) || (prev.is_bearish() && curr.is_bullish());
        if opposite && is_strong_reversal(prev, curr) {
            let direction = if curr.is_bullish() {
                Direction::Bullish
            } else {
                Direction::Bearish
            };
            return Some(candidate(
                StrategyType::Hammer,
                symbol,
                timeframe,
                direction.signal_type(),
                last.close,
                json!({
                    "pattern": label,
                    "patternType": "STRONG_REVERSAL",
                    "direction": direction.as_str(),
                    "bodyRatio": curr.body() / prev.body(),
                }),
            ));
        }
    }

    let hammer = detect_hammer(last);
    let direction = hammer.direction.filter(|_| hammer.is_hammer)?;
    let pattern_type = match direction {
        Direction::Bullish => "HAMMER",
        Direction::Bearish => "INVERTED_HAMMER",
    };
    Some(candidate(
        StrategyType::Hammer,
        symbol,
        timeframe,
        direction.signal_type(),
        last.close,
        json!({
            "pattern": "Hammer",
            "patternType": pattern_type,
            "direction": direction.as_str(),
        }),
    ))
}

/// Bias of the latest closed day against the day before it
pub fn ict_bias_candidate(
    symbol: &str,
    timeframe: Timeframe,
    daily: &[Bar],
    now: DateTime<Utc>,
) -> Option<Candidate> {
    let result = daily_bias_at(daily, now);
    let signal_type = match result.bias {
        Bias::Bullish => SignalType::Buy,
        Bias::Bearish => SignalType::Sell,
        Bias::Ranging | Bias::Unknown => return None,
    };
    let confidence = if result.strength >= ICT_HIGH_CONFIDENCE_PCT {
        Confidence::High
    } else {
        Confidence::Med
    };
    let last = daily.last()?;
    Some(candidate(
        StrategyType::IctBias,
        symbol,
        timeframe,
        signal_type,
        last.close,
        json!({
            "bias": result.bias.as_str(),
            "biasType": result.bias_type(),
            "confidence": confidence.as_str(),
            "strength": result.strength,
            "referenceClose": result.reference_close,
            "rangeHigh": result.range_high,
            "rangeLow": result.range_low,
        }),
    ))
}

fn annotate_kill_zone(candidate: &mut Candidate, kill_zone: bool) {
    if let Some(map) = candidate.metadata.as_object_mut() {
        map.insert("killZone".to_string(), json!(kill_zone));
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    bars: Arc<dyn BarStore>,
    backfiller: Arc<Backfiller>,
    emitter: Arc<SignalEmitter>,
    gate: TradingWindow,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        bars: Arc<dyn BarStore>,
        backfiller: Arc<Backfiller>,
        emitter: SignalEmitter,
        gate: TradingWindow,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            bars,
            backfiller,
            emitter: Arc::new(emitter),
            gate,
            clock,
        }
    }

    pub fn gate(&self) -> &TradingWindow {
        &self.gate
    }

    /// Run every strategy configured for `timeframe` on `symbol`. A failing
    /// strategy is logged and skipped. Returns the number of signals emitted.
    pub async fn process(&self, symbol: &str, timeframe: Timeframe) -> Result<usize> {
        let symbol = normalize_symbol(symbol);
        let now = self.clock.now();

        self.backfiller
            .ensure_bars(&symbol, timeframe, self.config.min_bars)
            .await;
        let bars = self.load_bars(&symbol, timeframe, self.config.min_bars).await?;

        let allowed = self.gate.is_within_allowed_time(now);
        let kill_zone = matches!(timeframe, Timeframe::H1 | Timeframe::H4).then(|| self.gate.is_kill_zone(now));

        let mut emitted = 0;
        for strategy in strategies_for(timeframe) {
            if is_gated(*strategy, timeframe) && !allowed {
                debug!(%symbol, %timeframe, %strategy, "Outside trading window, skipped");
                continue;
            }

            let candidates = match self.candidates(*strategy, &symbol, timeframe, &bars, now).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(%symbol, %timeframe, %strategy, "Strategy failed: {:#}", e);
                    continue;
                }
            };

            for mut candidate in candidates {
                if let Some(kill_zone) = kill_zone {
                    annotate_kill_zone(&mut candidate, kill_zone);
                }
                let emitter = self.emitter.clone();
                match store::blocking(move || Ok(emitter.emit(candidate, now))).await {
                    Ok(Some(_)) => emitted += 1,
                    Ok(None) => {}
                    Err(e) => warn!(%symbol, %timeframe, %strategy, "Emit failed: {:#}", e),
                }
            }
        }

        debug!(%symbol, %timeframe, bars = bars.len(), emitted, "Symbol processed");
        Ok(emitted)
    }

    async fn candidates(
        &self,
        strategy: StrategyType,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>> {
        let found = match strategy {
            StrategyType::SuperEngulfing => super_engulfing_candidate(symbol, timeframe, bars)
                .into_iter()
                .collect(),
            StrategyType::RsiDivergence => {
                divergence_candidates(symbol, timeframe, bars, &self.config.divergence)
            }
            StrategyType::RsiAlert => rsi_alert_candidate(symbol, timeframe, bars)
                .into_iter()
                .collect(),
            StrategyType::Hammer => hammer_candidate(symbol, timeframe, bars)
                .into_iter()
                .collect(),
            StrategyType::IctBias => {
                let daily = self.daily_bars(symbol, timeframe, bars).await?;
                ict_bias_candidate(symbol, timeframe, &daily, now)
                    .into_iter()
                    .collect()
            }
        };
        Ok(found)
    }

    /// Native daily bars, or daily bars rebuilt from hourly ones when fewer
    /// than three are stored
    async fn daily_bars(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Result<Vec<Bar>> {
        if timeframe == Timeframe::D1 && bars.len() >= 3 {
            return Ok(bars.to_vec());
        }
        let native = self.load_bars(symbol, Timeframe::D1, self.config.min_bars).await?;
        if native.len() >= 3 {
            return Ok(native);
        }
        self.backfiller
            .ensure_bars(symbol, Timeframe::H1, HOURLY_BARS_FOR_BIAS)
            .await;
        let hourly = self.load_bars(symbol, Timeframe::H1, HOURLY_BARS_FOR_BIAS).await?;
        Ok(aggregate_daily(&hourly))
    }

    async fn load_bars(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>> {
        let (bars, symbol) = (self.bars.clone(), symbol.to_string());
        store::blocking(move || bars.latest_bars(&symbol, timeframe, limit)).await
    }
}
