use anyhow::{anyhow, Result};
use chrono_tz::Tz;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::feed::adapter::FeedConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::scheduler::SchedulerConfig;
use crate::types::normalize_symbol;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// SQLite file holding bars and signals
    #[arg(long, env = "SIGNALS_DB_PATH", default_value = "signals.db")]
    pub db_path: PathBuf,

    /// Port to run the web server on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Symbol universe (comma-separated); empty resolves from the bar store
    #[arg(short, long, env = "SIGNAL_SYMBOLS")]
    pub symbols: Option<String>,

    /// Venues in priority order (comma-separated)
    #[arg(long, env = "SIGNAL_VENUES", default_value = "binance,bybit")]
    pub venues: String,

    /// IANA timezone of the trading window
    #[arg(long, env = "TRADING_TIMEZONE", default_value = "Asia/Kolkata")]
    pub timezone: String,

    /// Seconds after a bar close before detection runs
    #[arg(long, env = "TICK_OFFSET_SECS", default_value = "30")]
    pub tick_offset_secs: u64,

    /// Pause between symbols inside one tick
    #[arg(long, env = "SYMBOL_DELAY_MS", default_value = "250")]
    pub symbol_delay_ms: u64,

    /// Fixed WebSocket reconnect backoff
    #[arg(long, env = "FEED_RECONNECT_SECS", default_value = "5")]
    pub reconnect_secs: u64,

    /// REST timeout for historical backfill
    #[arg(long, env = "BACKFILL_TIMEOUT_SECS", default_value = "10")]
    pub backfill_timeout_secs: u64,

    /// Bars loaded (and backfilled) before detection
    #[arg(long, env = "MIN_BARS", default_value = "200")]
    pub min_bars: usize,

    /// Run the scheduler and API without live exchange feeds
    #[arg(long)]
    pub no_feeds: bool,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parsed runtime configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub symbols: Vec<String>,
    pub venues: Vec<String>,
    pub timezone: Tz,
    pub tick_offset: chrono::Duration,
    pub symbol_delay: Duration,
    pub reconnect: Duration,
    pub backfill_timeout: Duration,
    pub min_bars: usize,
    pub feeds_enabled: bool,
}

impl TryFrom<Args> for EngineConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> Result<Self> {
        let timezone: Tz = args
            .timezone
            .parse()
            .map_err(|e| anyhow!("invalid timezone '{}': {}", args.timezone, e))?;

        let venues = split_list(&args.venues);
        if venues.is_empty() {
            return Err(anyhow!("at least one venue is required"));
        }

        let mut symbols: Vec<String> = Vec::new();
        for symbol in args.symbols.as_deref().map(split_list).unwrap_or_default() {
            let symbol = normalize_symbol(&symbol);
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }

        let tick_offset = i64::try_from(args.tick_offset_secs)
            .map(chrono::Duration::seconds)
            .map_err(|_| anyhow!("tick offset out of range"))?;

        Ok(Self {
            db_path: args.db_path,
            port: args.port,
            symbols,
            venues,
            timezone,
            tick_offset,
            symbol_delay: Duration::from_millis(args.symbol_delay_ms),
            reconnect: Duration::from_secs(args.reconnect_secs),
            backfill_timeout: Duration::from_secs(args.backfill_timeout_secs),
            min_bars: args.min_bars.max(1),
            feeds_enabled: !args.no_feeds,
        })
    }
}

impl EngineConfig {
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_offset: self.tick_offset,
            symbol_delay: self.symbol_delay,
            symbols: self.symbols.clone(),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            min_bars: self.min_bars,
            ..Default::default()
        }
    }

    pub fn feed(&self) -> FeedConfig {
        FeedConfig {
            reconnect: self.reconnect,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<EngineConfig> {
        let mut argv = vec!["candle-signals"];
        argv.extend_from_slice(extra);
        EngineConfig::try_from(Args::try_parse_from(argv)?)
    }

    #[test]
    fn test_lists_are_normalized() {
        let config = parse(&[
            "--symbols",
            "btcusdt, ETHUSDT,,btcusdt",
            "--venues",
            "bybit , binance",
            "--timezone",
            "UTC",
        ])
        .unwrap();
        assert_eq!(config.symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(config.venues, vec!["bybit".to_string(), "binance".to_string()]);
        assert_eq!(config.timezone, chrono_tz::UTC);
    }

    #[test]
    fn test_durations_and_flags() {
        let config = parse(&[
            "--tick-offset-secs",
            "45",
            "--symbol-delay-ms",
            "0",
            "--reconnect-secs",
            "2",
            "--timezone",
            "Asia/Kolkata",
            "--no-feeds",
        ])
        .unwrap();
        assert_eq!(config.scheduler().tick_offset, chrono::Duration::seconds(45));
        assert!(config.scheduler().symbol_delay.is_zero());
        assert_eq!(config.feed().reconnect, Duration::from_secs(2));
        assert!(!config.feeds_enabled);
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        assert!(parse(&["--timezone", "Mars/Olympus"]).is_err());
        assert!(parse(&["--timezone", "UTC", "--venues", " , "]).is_err());
    }
}
