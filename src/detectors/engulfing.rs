//! Engulfing family: classic engulfing, RUN (continuation) and REV (reversal)
//! two-candle patterns, plus the consecutive-close run-length metric.

use serde::{Deserialize, Serialize};

use super::{Confidence, Direction};
use crate::types::Bar;

/// Minimum consecutive-close count worth reporting
const MIN_RUN_LENGTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EngulfingResult {
    pub is_engulfing: bool,
    pub is_run: bool,
    pub is_rev: bool,
    pub direction: Option<Direction>,
    pub has_plus: bool,
    /// Current body divided by previous body (0 when the previous body is empty)
    pub body_ratio: f64,
}

pub fn analyze_pair(prev: &Bar, curr: &Bar) -> EngulfingResult {
    let body_ratio = if prev.body() > 0.0 {
        curr.body() / prev.body()
    } else {
        0.0
    };
    let mut result = EngulfingResult {
        body_ratio,
        ..Default::default()
    };

    let bigger_body = curr.body() > prev.body();

    if prev.is_bearish() && curr.is_bullish() {
        result.is_engulfing = bigger_body && curr.close > prev.open;
        result.is_rev = curr.low < prev.low && curr.close > prev.open;
        result.has_plus = result.is_rev && curr.close > prev.high;
        if result.is_engulfing || result.is_rev {
            result.direction = Some(Direction::Bullish);
        }
    } else if prev.is_bullish() && curr.is_bearish() {
        result.is_engulfing = bigger_body && curr.close < prev.open;
        result.is_rev = curr.high > prev.high && curr.close < prev.open;
        result.has_plus = result.is_rev && curr.close < prev.low;
        if result.is_engulfing || result.is_rev {
            result.direction = Some(Direction::Bearish);
        }
    } else if prev.is_bullish() && curr.is_bullish() {
        result.is_run = curr.low < prev.low && curr.close > prev.close;
        result.has_plus = result.is_run && curr.close > prev.high;
        if result.is_run {
            result.direction = Some(Direction::Bullish);
        }
    } else if prev.is_bearish() && curr.is_bearish() {
        result.is_run = curr.high > prev.high && curr.close < prev.close;
        result.has_plus = result.is_run && curr.close < prev.low;
        if result.is_run {
            result.direction = Some(Direction::Bearish);
        }
    }

    result
}

/// Walks back from `bars[index]` through the preceding candles of the same
/// color and counts how many of their closes its close exceeds (bullish) or
/// undercuts (bearish) in a row. Wicks are ignored. Returns 0 unless the
/// count reaches 2.
pub fn run_length(bars: &[Bar], index: usize) -> usize {
    let Some(curr) = bars.get(index) else {
        return 0;
    };
    let bullish = if curr.is_bullish() {
        true
    } else if curr.is_bearish() {
        false
    } else {
        return 0;
    };

    let mut count = 0;
    for prior in bars[..index].iter().rev() {
        let same_color = if bullish {
            prior.is_bullish()
        } else {
            prior.is_bearish()
        };
        if !same_color {
            break;
        }
        let beyond = if bullish {
            curr.close > prior.close
        } else {
            curr.close < prior.close
        };
        if !beyond {
            break;
        }
        count += 1;
    }

    if count >= MIN_RUN_LENGTH {
        count
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuperEngulfingPattern {
    Run,
    RunPlus,
    Rev,
    RevPlus,
}

impl SuperEngulfingPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::RunPlus => "RUN_PLUS",
            Self::Rev => "REV",
            Self::RevPlus => "REV_PLUS",
        }
    }

    pub fn pattern_type(&self) -> &'static str {
        match self {
            Self::Run | Self::RunPlus => "CONTINUATION",
            Self::Rev | Self::RevPlus => "REVERSAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuperEngulfing {
    pub pattern: SuperEngulfingPattern,
    pub direction: Direction,
    /// Run length, `None` when below the reporting threshold
    pub x_logic: Option<usize>,
    pub confidence: Confidence,
    pub body_ratio: f64,
}

/// Evaluates the last two bars. REV takes precedence over RUN (they cannot
/// both hold since they need different color combinations).
pub fn detect_super_engulfing(bars: &[Bar]) -> Option<SuperEngulfing> {
    if bars.len() < 2 {
        return None;
    }
    let last = bars.len() - 1;
    let result = analyze_pair(&bars[last - 1], &bars[last]);
    let direction = result.direction?;

    let pattern = match (result.is_rev, result.is_run, result.has_plus) {
        (true, _, true) => SuperEngulfingPattern::RevPlus,
        (true, _, false) => SuperEngulfingPattern::Rev,
        (false, true, true) => SuperEngulfingPattern::RunPlus,
        (false, true, false) => SuperEngulfingPattern::Run,
        (false, false, _) => return None,
    };

    let x = run_length(bars, last);
    Some(SuperEngulfing {
        pattern,
        direction,
        x_logic: (x > 0).then_some(x),
        confidence: if result.has_plus {
            Confidence::High
        } else {
            Confidence::Med
        },
        body_ratio: result.body_ratio,
    })
}
