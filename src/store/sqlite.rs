use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use super::{BarStore, SignalQuery, SignalStore, SortOrder};
use crate::types::{Bar, Signal, SignalStatus, SignalType, StrategyType, Timeframe};

const DEFAULT_SIGNAL_LIMIT: u32 = 50;
const MAX_SIGNAL_LIMIT: u32 = 500;

const SIGNAL_COLUMNS: &str =
    "id, strategy_type, symbol, timeframe, signal_type, price, detected_at, status, metadata";

/// SQLite-backed bar and signal store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        // Best-effort pragmas; in-memory databases reject WAL.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
        let store = Self { conn: Mutex::new(conn) };
        store.ensure_schema()?;
        info!("Opened signal store at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        let store = Self { conn: Mutex::new(conn) };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                quote_volume REAL,
                PRIMARY KEY (symbol, timeframe, open_time)
            );
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                strategy_type TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                price REAL NOT NULL,
                detected_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_dedup
            ON signals(strategy_type, symbol, timeframe, signal_type, detected_at);
            CREATE INDEX IF NOT EXISTS idx_signals_detected_at
            ON signals(detected_at);
            "#,
        )
        .context("Failed to create schema")?;
        Ok(())
    }
}

fn upsert_bar_on(conn: &Connection, bar: &Bar) -> Result<()> {
    conn.execute(
        "INSERT INTO bars (symbol, timeframe, open_time, open, high, low, close, volume, quote_volume)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(symbol, timeframe, open_time) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume,
            quote_volume = excluded.quote_volume",
        params![
            bar.symbol,
            bar.timeframe.as_str(),
            bar.open_time.timestamp_millis(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.quote_volume,
        ],
    )
    .with_context(|| format!("Failed to upsert {} {} bar", bar.symbol, bar.timeframe))?;
    Ok(())
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

type RawSignal = (String, String, String, String, String, f64, i64, String, String);

fn raw_signal(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSignal> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn signal_from_raw(raw: RawSignal) -> Result<Signal> {
    let (id, strategy, symbol, timeframe, signal_type, price, detected_at, status, metadata) = raw;
    Ok(Signal {
        id,
        strategy_type: strategy.parse()?,
        symbol,
        timeframe: timeframe.parse()?,
        signal_type: signal_type.parse()?,
        price,
        detected_at: millis_to_utc(detected_at)?,
        status: status.parse()?,
        metadata: serde_json::from_str(&metadata).context("Corrupt signal metadata")?,
    })
}

impl BarStore for SqliteStore {
    fn upsert_bar(&self, bar: &Bar) -> Result<()> {
        let conn = self.lock()?;
        upsert_bar_on(&conn, bar)
    }

    fn upsert_bars(&self, bars: &[Bar]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for bar in bars {
            upsert_bar_on(&tx, bar)?;
        }
        tx.commit().context("Failed to commit bar batch")?;
        Ok(bars.len())
    }

    fn count_bars(&self, symbol: &str, timeframe: Timeframe) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bars WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, timeframe.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn query_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let direction = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT open_time, open, high, low, close, volume, quote_volume
             FROM bars
             WHERE symbol = ?1 AND timeframe = ?2
             ORDER BY open_time {direction}
             LIMIT ?3"
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![symbol, timeframe.as_str(), limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(t, open, high, low, close, volume, quote_volume)| {
                Ok(Bar {
                    symbol: symbol.to_string(),
                    timeframe,
                    open_time: millis_to_utc(t)?,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    quote_volume,
                })
            })
            .collect()
    }

    fn query_distinct_symbols(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT symbol FROM bars
             GROUP BY symbol
             ORDER BY MAX(open_time) DESC
             LIMIT ?1",
        )?;
        let symbols = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(symbols)
    }
}

impl SignalStore for SqliteStore {
    fn find_active_signal(
        &self,
        strategy_type: StrategyType,
        symbol: &str,
        timeframe: Timeframe,
        signal_type: SignalType,
        since: DateTime<Utc>,
    ) -> Result<Option<Signal>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {SIGNAL_COLUMNS} FROM signals
             WHERE strategy_type = ?1 AND symbol = ?2 AND timeframe = ?3
               AND signal_type = ?4 AND status = ?5 AND detected_at >= ?6
             ORDER BY detected_at DESC
             LIMIT 1"
        );
        let raw = conn
            .query_row(
                &sql,
                params![
                    strategy_type.as_str(),
                    symbol,
                    timeframe.as_str(),
                    signal_type.as_str(),
                    SignalStatus::Active.as_str(),
                    since.timestamp_millis(),
                ],
                raw_signal,
            )
            .optional()?;
        raw.map(signal_from_raw).transpose()
    }

    fn create_signal(&self, signal: &Signal) -> Result<Signal> {
        let conn = self.lock()?;
        let metadata = serde_json::to_string(&signal.metadata)?;
        conn.execute(
            "INSERT INTO signals (id, strategy_type, symbol, timeframe, signal_type, price, detected_at, status, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                signal.id,
                signal.strategy_type.as_str(),
                signal.symbol,
                signal.timeframe.as_str(),
                signal.signal_type.as_str(),
                signal.price,
                signal.detected_at.timestamp_millis(),
                signal.status.as_str(),
                metadata,
            ],
        )
        .with_context(|| format!("Failed to insert signal {}", signal.id))?;
        Ok(signal.clone())
    }

    fn query_signals(&self, query: &SignalQuery) -> Result<Vec<Signal>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(strategy) = query.strategy_type {
            clauses.push("strategy_type = ?");
            values.push(SqlValue::Text(strategy.as_str().to_string()));
        }
        if let Some(symbol) = &query.symbol {
            clauses.push("symbol = ?");
            values.push(SqlValue::Text(symbol.to_ascii_uppercase()));
        }
        if let Some(timeframe) = query.timeframe {
            clauses.push("timeframe = ?");
            values.push(SqlValue::Text(timeframe.as_str().to_string()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let limit = query.limit.unwrap_or(DEFAULT_SIGNAL_LIMIT).min(MAX_SIGNAL_LIMIT);
        values.push(SqlValue::Integer(i64::from(limit)));
        values.push(SqlValue::Integer(i64::from(query.offset.unwrap_or(0))));

        let sql = format!(
            "SELECT {SIGNAL_COLUMNS} FROM signals {where_clause}
             ORDER BY detected_at DESC
             LIMIT ? OFFSET ?"
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_from_iter(values), raw_signal)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(signal_from_raw).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn bar(symbol: &str, minute: i64, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::H1,
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(minute),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 100.0,
            quote_volume: Some(close * 100.0),
        }
    }

    fn signal(strategy: StrategyType, signal_type: SignalType, at: DateTime<Utc>) -> Signal {
        Signal {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_type: strategy,
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::H1,
            signal_type,
            price: 42_000.0,
            detected_at: at,
            status: SignalStatus::Active,
            metadata: json!({"pattern": "RUN"}),
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_bar(&bar("BTCUSDT", 0, 100.0)).unwrap();
        store.upsert_bar(&bar("BTCUSDT", 0, 105.0)).unwrap();

        assert_eq!(store.count_bars("BTCUSDT", Timeframe::H1).unwrap(), 1);
        let bars = store.latest_bars("BTCUSDT", Timeframe::H1, 10).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 105.0);
        assert_eq!(bars[0].high, 106.0);
        assert_eq!(bars[0].quote_volume, Some(10_500.0));
    }

    #[test]
    fn test_query_order_and_limit() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bars: Vec<Bar> = (0..5).map(|i| bar("ETHUSDT", i, 10.0 + i as f64)).collect();
        assert_eq!(store.upsert_bars(&bars).unwrap(), 5);

        let asc = store.query_bars("ETHUSDT", Timeframe::H1, SortOrder::Asc, 2).unwrap();
        assert_eq!(asc.iter().map(|b| b.close).collect::<Vec<_>>(), vec![10.0, 11.0]);

        let latest = store.latest_bars("ETHUSDT", Timeframe::H1, 3).unwrap();
        assert_eq!(latest.iter().map(|b| b.close).collect::<Vec<_>>(), vec![12.0, 13.0, 14.0]);

        assert_eq!(store.count_bars("ETHUSDT", Timeframe::D1).unwrap(), 0);
    }

    #[test]
    fn test_distinct_symbols_most_recent_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_bar(&bar("ETHUSDT", 1, 10.0)).unwrap();
        store.upsert_bar(&bar("BTCUSDT", 5, 10.0)).unwrap();
        store.upsert_bar(&bar("SOLUSDT", 3, 10.0)).unwrap();

        let symbols = store.query_distinct_symbols(2).unwrap();
        assert_eq!(symbols, vec!["BTCUSDT".to_string(), "SOLUSDT".to_string()]);
    }

    #[test]
    fn test_find_active_signal_respects_window() {
        let store = SqliteStore::open_in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 30).unwrap();
        let created = store
            .create_signal(&signal(StrategyType::SuperEngulfing, SignalType::Buy, at))
            .unwrap();

        let found = store
            .find_active_signal(
                StrategyType::SuperEngulfing,
                "BTCUSDT",
                Timeframe::H1,
                SignalType::Buy,
                at - Duration::minutes(30),
            )
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some(created.id));

        let later = store
            .find_active_signal(
                StrategyType::SuperEngulfing,
                "BTCUSDT",
                Timeframe::H1,
                SignalType::Buy,
                at + Duration::seconds(1),
            )
            .unwrap();
        assert!(later.is_none());

        let other_side = store
            .find_active_signal(
                StrategyType::SuperEngulfing,
                "BTCUSDT",
                Timeframe::H1,
                SignalType::Sell,
                at - Duration::hours(1),
            )
            .unwrap();
        assert!(other_side.is_none());
    }

    #[test]
    fn test_query_signals_filters_and_sorts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..3 {
            store
                .create_signal(&signal(StrategyType::RsiAlert, SignalType::Sell, base + Duration::hours(i)))
                .unwrap();
        }
        store
            .create_signal(&signal(StrategyType::Hammer, SignalType::Buy, base))
            .unwrap();

        let alerts = store
            .query_signals(&SignalQuery {
                strategy_type: Some(StrategyType::RsiAlert),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(alerts.len(), 3);
        assert!(alerts[0].detected_at > alerts[1].detected_at);
        assert_eq!(alerts[0].metadata["pattern"], "RUN");

        let paged = store
            .query_signals(&SignalQuery {
                limit: Some(2),
                offset: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(paged.len(), 1);
    }
}
