use anyhow::{Context, Result};
use clap::Parser;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use candle_signals::{
    api,
    backfill::Backfiller,
    clock::{Clock, SystemClock},
    config::{Args, EngineConfig},
    emitter::SignalEmitter,
    feed::{spawn_feed, venues_from_names},
    orchestrator::Orchestrator,
    scheduler::{Scheduler, TradingWindow},
    store::SqliteStore,
    types::{AppState, Timeframe, WsMessage},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "candle_signals=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::try_from(Args::parse())?;

    info!("Starting candle signal engine");
    info!("Database: {}", config.db_path.display());
    info!("Venues: {}", config.venues.join(","));
    info!("Trading timezone: {}", config.timezone);

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );

    // Create broadcast channel for signals and candle updates
    let (tx, _rx) = broadcast::channel::<WsMessage>(1000);

    let venues = venues_from_names(&config.venues, config.backfill_timeout)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backfiller = Arc::new(Backfiller::new(store.clone(), venues.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator(),
        store.clone(),
        backfiller.clone(),
        SignalEmitter::new(store.clone(), tx.clone()),
        TradingWindow::new(config.timezone),
        clock.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        config.scheduler(),
        clock,
        store.clone(),
        orchestrator,
    ));

    let universe = scheduler.resolve_universe();
    info!("Symbols: {}", universe.join(","));

    // One live feed per venue, each subscribed to every (symbol, timeframe)
    let mut feeds = Vec::new();
    if config.feeds_enabled {
        let pairs: Vec<(String, Timeframe)> = universe
            .iter()
            .flat_map(|symbol| Timeframe::ALL.iter().map(move |tf| (symbol.clone(), *tf)))
            .collect();
        for venue in venues {
            let (handle, _task) = spawn_feed(venue, store.clone(), tx.clone(), config.feed());
            if let Err(e) = handle.batch_subscribe(&pairs) {
                warn!(venue = handle.venue(), "Initial subscribe failed: {:#}", e);
            }
            feeds.push(handle);
        }
    } else {
        info!("Live feeds disabled");
    }

    let _ticks = scheduler.spawn();

    let state = Arc::new(AppState {
        tx,
        bars: store.clone(),
        signals: store,
        backfiller,
        scheduler,
        feeds,
        min_bars: config.min_bars,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, api::router(state)).await?;

    Ok(())
}
