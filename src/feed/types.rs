//! Wire types for the exchange streams
//!
//! Field names follow the exchange's short-name JSON; prices and quantities
//! stay strings here to preserve precision, parsed to decimals by the
//! preprocessor.

use serde::{Deserialize, Serialize};

/// Depth snapshot from GET /api/v3/depth
///
/// Example JSON:
/// ```json
/// {
///   "lastUpdateId": 1027024,
///   "bids": [["4.00000000", "431.00000000"]],
///   "asks": [["4.00000200", "12.00000000"]]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    pub last_update_id: i64,

    /// [price, qty] tuples, best bid first
    pub bids: Vec<[String; 2]>,

    /// [price, qty] tuples, best ask first
    pub asks: Vec<[String; 2]>,
}

/// Incremental depth update from the `<symbol>@depth@100ms` stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffDepthEvent {
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event timestamp (ms)
    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "U")]
    pub first_update_id: i64,

    #[serde(rename = "u")]
    pub final_update_id: i64,

    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,

    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Aggregated trade from the `<symbol>@aggTrade` stream
///
/// `m == true` means the buyer was the maker, i.e. the aggressor sold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggTradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// Aggregate trade id (monotonic per symbol)
    #[serde(rename = "a")]
    pub agg_trade_id: u64,

    #[serde(rename = "p")]
    pub price: String,

    #[serde(rename = "q")]
    pub quantity: String,

    #[serde(rename = "f")]
    pub first_trade_id: u64,

    #[serde(rename = "l")]
    pub last_trade_id: u64,

    /// Trade timestamp (ms)
    #[serde(rename = "T")]
    pub trade_time: i64,

    #[serde(rename = "m")]
    pub is_buyer_maker: bool,

    #[serde(rename = "M", default)]
    pub is_best_match: bool,
}
