// Library crate - candle signal detection engine

pub mod api;
pub mod backfill;
pub mod clock;
pub mod config;
pub mod detectors;
pub mod emitter;
pub mod feed;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use types::*;
