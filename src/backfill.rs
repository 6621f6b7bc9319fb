//! Historical Backfill Client
//!
//! Tops up the bar store from venue REST endpoints when a (symbol, timeframe)
//! has too few rows. Venues are tried in priority order and the first
//! non-empty answer wins. Never fails: detection runs on whatever is stored.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::feed::Venue;
use crate::store::{self, BarStore};
use crate::types::{normalize_symbol, Timeframe};

pub struct Backfiller {
    store: Arc<dyn BarStore>,
    venues: Vec<Arc<dyn Venue>>,
}

impl Backfiller {
    pub fn new(store: Arc<dyn BarStore>, venues: Vec<Arc<dyn Venue>>) -> Self {
        Self { store, venues }
    }

    pub fn venue_names(&self) -> Vec<&'static str> {
        self.venues.iter().map(|v| v.name()).collect()
    }

    pub async fn ensure_bars(&self, symbol: &str, timeframe: Timeframe, min_count: usize) {
        let symbol = normalize_symbol(symbol);
        let counted = {
            let (bar_store, symbol) = (self.store.clone(), symbol.clone());
            store::blocking(move || bar_store.count_bars(&symbol, timeframe)).await
        };
        let have = match counted {
            Ok(n) => n,
            Err(e) => {
                warn!(%symbol, %timeframe, "Failed to count stored bars: {:#}", e);
                0
            }
        };
        if have >= min_count {
            debug!(%symbol, %timeframe, have, "Enough bars stored");
            return;
        }

        for venue in &self.venues {
            let bars = match venue.fetch_historical(&symbol, timeframe, min_count).await {
                Ok(bars) if bars.is_empty() => {
                    warn!(venue = venue.name(), %symbol, %timeframe, "Backfill returned no bars");
                    continue;
                }
                Ok(bars) => bars,
                Err(e) => {
                    warn!(venue = venue.name(), %symbol, %timeframe, "Backfill failed: {:#}", e);
                    continue;
                }
            };

            let bar_store = self.store.clone();
            match store::blocking(move || bar_store.upsert_bars(&bars)).await {
                Ok(n) => info!(
                    venue = venue.name(),
                    %symbol,
                    %timeframe,
                    had = have,
                    fetched = n,
                    "Backfilled bars"
                ),
                Err(e) => error!(venue = venue.name(), %symbol, %timeframe, "Failed to store backfilled bars: {:#}", e),
            }
            return;
        }

        warn!(
            %symbol,
            %timeframe,
            have,
            wanted = min_count,
            "No venue could backfill; continuing with stored bars"
        );
    }
}
