//! Bar Store and signal persistence
//!
//! The detection core only depends on the two traits below; `SqliteStore`
//! is the bundled implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::types::{Bar, Signal, SignalType, StrategyType, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

pub trait BarStore: Send + Sync {
    /// Insert or refresh the OHLCV fields of the bar keyed by (symbol, timeframe, open_time)
    fn upsert_bar(&self, bar: &Bar) -> Result<()>;

    fn upsert_bars(&self, bars: &[Bar]) -> Result<usize> {
        for bar in bars {
            self.upsert_bar(bar)?;
        }
        Ok(bars.len())
    }

    fn count_bars(&self, symbol: &str, timeframe: Timeframe) -> Result<usize>;

    fn query_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<Bar>>;

    /// Symbols ordered by most recently seen bar
    fn query_distinct_symbols(&self, limit: usize) -> Result<Vec<String>>;

    /// Latest `limit` bars in chronological order
    fn latest_bars(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>> {
        let mut bars = self.query_bars(symbol, timeframe, SortOrder::Desc, limit)?;
        bars.reverse();
        Ok(bars)
    }
}

/// Filters for the downstream signal listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalQuery {
    pub strategy_type: Option<StrategyType>,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub trait SignalStore: Send + Sync {
    fn find_active_signal(
        &self,
        strategy_type: StrategyType,
        symbol: &str,
        timeframe: Timeframe,
        signal_type: SignalType,
        since: DateTime<Utc>,
    ) -> Result<Option<Signal>>;

    fn create_signal(&self, signal: &Signal) -> Result<Signal>;

    /// Signals sorted by detected_at descending
    fn query_signals(&self, query: &SignalQuery) -> Result<Vec<Signal>>;
}

/// Run a store call on tokio's blocking pool
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| anyhow!("store task failed: {}", e))?
}
