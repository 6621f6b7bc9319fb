//! RSI divergence between consecutive RSI pivots

use serde::{Deserialize, Serialize};

use super::pivots::{pivot_highs, pivot_lows};
use super::rsi::rsi_series;
use super::Direction;
use crate::types::Bar;

/// RSI level the earlier pivot of a bullish divergence must start below
const OVERSOLD: f64 = 30.0;
/// RSI level the earlier pivot of a bearish divergence must start above
const OVERBOUGHT: f64 = 70.0;
/// RSI difference above which a divergence is marked strong
const STRONG_RSI_DELTA: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
pub struct DivergenceParams {
    pub rsi_period: usize,
    pub left_bars: usize,
    pub right_bars: usize,
    pub min_gap: usize,
    pub max_gap: usize,
}

impl Default for DivergenceParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            left_bars: 5,
            right_bars: 5,
            min_gap: 5,
            max_gap: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceKind {
    Regular,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    pub direction: Direction,
    pub kind: DivergenceKind,
    pub strong: bool,
    pub prev_index: usize,
    pub curr_index: usize,
    pub prev_price: f64,
    pub curr_price: f64,
    pub prev_rsi: f64,
    pub curr_rsi: f64,
}

impl Divergence {
    /// Human label such as "Strong Regular Bullish"
    pub fn label(&self) -> String {
        let kind = match self.kind {
            DivergenceKind::Regular => "Regular",
            DivergenceKind::Hidden => "Hidden",
        };
        let direction = match self.direction {
            Direction::Bullish => "Bullish",
            Direction::Bearish => "Bearish",
        };
        if self.strong {
            format!("Strong {} {}", kind, direction)
        } else {
            format!("{} {}", kind, direction)
        }
    }

    pub fn rsi_low(&self) -> f64 {
        self.prev_rsi.min(self.curr_rsi)
    }

    pub fn rsi_high(&self) -> f64 {
        self.prev_rsi.max(self.curr_rsi)
    }
}

/// Divergences, most recent first
#[derive(Debug, Clone, Default)]
pub struct DivergenceResult {
    pub bullish: Vec<Divergence>,
    pub bearish: Vec<Divergence>,
}

impl DivergenceResult {
    pub fn is_empty(&self) -> bool {
        self.bullish.is_empty() && self.bearish.is_empty()
    }
}

/// Bullish divergences compare bar lows at RSI pivot lows; bearish ones
/// compare bar highs at RSI pivot highs.
pub fn detect_rsi_divergence(bars: &[Bar], params: &DivergenceParams) -> DivergenceResult {
    if bars.len() <= params.rsi_period {
        return DivergenceResult::default();
    }
    let rsi = rsi_series(bars, params.rsi_period);
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    find_divergences(&lows, &highs, &rsi, params)
}

pub(crate) fn find_divergences(
    lows: &[f64],
    highs: &[f64],
    rsi: &[f64],
    params: &DivergenceParams,
) -> DivergenceResult {
    let gap_ok = |prev: usize, curr: usize| {
        let gap = curr - prev;
        gap >= params.min_gap && gap <= params.max_gap
    };

    let mut bullish = Vec::new();
    for pair in pivot_lows(rsi, params.left_bars, params.right_bars).windows(2) {
        let (prev, curr) = (pair[0], pair[1]);
        if !gap_ok(prev, curr) {
            continue;
        }
        let lower_low = lows[curr] < lows[prev];
        let higher_rsi = rsi[curr] > rsi[prev];
        if lower_low && higher_rsi && rsi[prev] < OVERSOLD {
            bullish.push(build(Direction::Bullish, prev, curr, lows, rsi));
        }
    }

    let mut bearish = Vec::new();
    for pair in pivot_highs(rsi, params.left_bars, params.right_bars).windows(2) {
        let (prev, curr) = (pair[0], pair[1]);
        if !gap_ok(prev, curr) {
            continue;
        }
        let higher_high = highs[curr] > highs[prev];
        let lower_rsi = rsi[curr] < rsi[prev];
        if higher_high && lower_rsi && rsi[prev] > OVERBOUGHT {
            bearish.push(build(Direction::Bearish, prev, curr, highs, rsi));
        }
    }

    bullish.reverse();
    bearish.reverse();
    DivergenceResult { bullish, bearish }
}

fn build(direction: Direction, prev: usize, curr: usize, prices: &[f64], rsi: &[f64]) -> Divergence {
    let (prev_price, curr_price) = (prices[prev], prices[curr]);
    let regular = match direction {
        Direction::Bullish => curr_price < prev_price,
        Direction::Bearish => curr_price > prev_price,
    };
    Divergence {
        direction,
        kind: if regular {
            DivergenceKind::Regular
        } else {
            DivergenceKind::Hidden
        },
        strong: (rsi[curr] - rsi[prev]).abs() > STRONG_RSI_DELTA,
        prev_index: prev,
        curr_index: curr,
        prev_price,
        curr_price,
        prev_rsi: rsi[prev],
        curr_rsi: rsi[curr],
    }
}
