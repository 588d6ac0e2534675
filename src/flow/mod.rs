//! Order-flow preprocessing
//!
//! Normalizes raw trades and depth events and emits [`EnrichedTrade`]s that
//! carry passive-liquidity context and multi-resolution zone aggregates.
//! The preprocessor is the only stage that mutates the order book.

pub mod preprocessor;
pub mod types;
pub mod zones;

pub use preprocessor::Preprocessor;
pub use types::{AggressiveTrade, EnrichedTrade, StandardZoneData, ZoneBoundaries, ZoneSnapshot};
pub use zones::{ZoneAggregator, ZoneTracker};
