use super::Direction;
use crate::types::Bar;

/// Minimum body multiple required of the later candle in a strong reversal
const STRONG_REVERSAL_RATIO: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HammerResult {
    pub is_hammer: bool,
    pub direction: Option<Direction>,
}

/// Bullish hammer: long lower shadow (>= 2x body), small upper shadow
/// (<= 0.5x body). The inverted form is the bearish counterpart.
pub fn detect_hammer(candle: &Bar) -> HammerResult {
    let body = candle.body();
    if body <= 0.0 {
        return HammerResult::default();
    }
    let upper = candle.upper_shadow();
    let lower = candle.lower_shadow();

    if lower >= 2.0 * body && upper <= 0.5 * body {
        HammerResult {
            is_hammer: true,
            direction: Some(Direction::Bullish),
        }
    } else if upper >= 2.0 * body && lower <= 0.5 * body {
        HammerResult {
            is_hammer: true,
            direction: Some(Direction::Bearish),
        }
    } else {
        HammerResult::default()
    }
}

/// 1:3 body-size reversal: both bodies non-zero and the later one at least
/// three times the earlier.
pub fn is_strong_reversal(prev: &Bar, curr: &Bar) -> bool {
    let (prev_body, curr_body) = (prev.body(), curr.body());
    prev_body > 0.0 && curr_body > 0.0 && curr_body >= STRONG_REVERSAL_RATIO * prev_body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testing::candle;

    #[test]
    fn test_bullish_hammer() {
        // body 1, lower shadow 3, upper shadow 0.25
        let c = candle(0, 10.0, 11.25, 7.0, 11.0);
        let r = detect_hammer(&c);
        assert!(r.is_hammer);
        assert_eq!(r.direction, Some(Direction::Bullish));
    }

    #[test]
    fn test_inverted_hammer() {
        // body 1, upper shadow 2, lower shadow 0.5
        let c = candle(0, 11.0, 13.0, 9.5, 10.0);
        let r = detect_hammer(&c);
        assert!(r.is_hammer);
        assert_eq!(r.direction, Some(Direction::Bearish));
    }

    #[test]
    fn test_not_hammer() {
        assert!(!detect_hammer(&candle(0, 10.0, 11.5, 8.5, 11.0)).is_hammer);
        // zero body never qualifies
        assert!(!detect_hammer(&candle(0, 10.0, 10.1, 5.0, 10.0)).is_hammer);
    }

    #[test]
    fn test_strong_reversal_ratio() {
        let prev = candle(0, 10.0, 10.6, 9.4, 10.5);
        assert!(is_strong_reversal(&prev, &candle(1, 10.5, 10.6, 8.9, 9.0)));
        assert!(!is_strong_reversal(&prev, &candle(1, 10.5, 10.6, 9.2, 9.4)));
        let flat = candle(0, 10.0, 10.6, 9.4, 10.0);
        assert!(!is_strong_reversal(&flat, &candle(1, 10.5, 10.6, 8.9, 9.0)));
    }
}
