//! Trading-Window Gate
//!
//! Pure functions of an injected instant evaluated in a fixed named timezone.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::types::{StrategyType, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DailyWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start: NaiveTime::from_hms_opt(start_hour, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(end_hour, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    /// Start inclusive, end exclusive
    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time < self.end
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TradingWindow {
    tz: Tz,
    allowed: DailyWindow,
    kill_zone: DailyWindow,
}

impl TradingWindow {
    /// 10:00-21:00 allowed hours with a 17:00-20:00 kill zone
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            allowed: DailyWindow::new(10, 21),
            kill_zone: DailyWindow::new(17, 20),
        }
    }

    pub fn with_windows(tz: Tz, allowed: DailyWindow, kill_zone: DailyWindow) -> Self {
        Self {
            tz,
            allowed,
            kill_zone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.tz).time()
    }

    pub fn is_within_allowed_time(&self, now: DateTime<Utc>) -> bool {
        self.allowed.contains(self.local_time(now))
    }

    /// Annotation only; never gates detection
    pub fn is_kill_zone(&self, now: DateTime<Utc>) -> bool {
        self.kill_zone.contains(self.local_time(now))
    }
}

/// Whether `strategy` on `timeframe` only runs inside the allowed window
pub fn is_gated(strategy: StrategyType, timeframe: Timeframe) -> bool {
    matches!(
        strategy,
        StrategyType::RsiDivergence | StrategyType::SuperEngulfing
    ) && matches!(timeframe, Timeframe::H1 | Timeframe::H4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Asia::Kolkata;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Kolkata
            .with_ymd_and_hms(2024, 3, 4, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_allowed_window_edges() {
        let gate = TradingWindow::new(Kolkata);
        assert!(!gate.is_within_allowed_time(at(9, 59)));
        assert!(gate.is_within_allowed_time(at(10, 0)));
        assert!(gate.is_within_allowed_time(at(20, 59)));
        assert!(!gate.is_within_allowed_time(at(21, 0)));
    }

    #[test]
    fn test_kill_zone() {
        let gate = TradingWindow::new(Kolkata);
        assert!(!gate.is_kill_zone(at(16, 59)));
        assert!(gate.is_kill_zone(at(17, 0)));
        assert!(gate.is_kill_zone(at(19, 59)));
        assert!(!gate.is_kill_zone(at(20, 0)));
    }

    #[test]
    fn test_timezone_is_respected() {
        let gate = TradingWindow::new(chrono_tz::America::New_York);
        // 15:00 UTC in July is 11:00 in New York (EDT)
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 15, 0, 0).unwrap();
        assert!(gate.is_within_allowed_time(now));
        // 15:00 UTC in January is 10:00 EST; 14:59 UTC is 09:59
        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 14, 59, 0).unwrap();
        assert!(!gate.is_within_allowed_time(winter));
    }

    #[test]
    fn test_gated_matrix() {
        assert!(is_gated(StrategyType::SuperEngulfing, Timeframe::H1));
        assert!(is_gated(StrategyType::RsiDivergence, Timeframe::H4));
        assert!(!is_gated(StrategyType::SuperEngulfing, Timeframe::M15));
        assert!(!is_gated(StrategyType::RsiAlert, Timeframe::H1));
    }
}
