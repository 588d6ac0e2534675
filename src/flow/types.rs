//! Entities flowing between the preprocessor and the detectors

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A market-taking execution. `buyer_is_maker == true` means the taker sold
/// (aggressive sell); `false` means the taker bought.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggressiveTrade {
    pub trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,

    /// Trade timestamp (ms)
    pub timestamp: i64,

    pub buyer_is_maker: bool,

    /// Trading pair, uppercase
    pub pair: String,
}

impl AggressiveTrade {
    pub fn is_aggressive_buy(&self) -> bool {
        !self.buyer_is_maker
    }

    /// Quantity signed by aggressor direction (buy positive)
    pub fn signed_quantity(&self) -> Decimal {
        if self.is_aggressive_buy() {
            self.quantity
        } else {
            -self.quantity
        }
    }
}

/// Inclusive price range of a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneBoundaries {
    pub min: Decimal,
    pub max: Decimal,
}

/// Rolling aggregates for one price zone at one resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub zone_id: i64,

    /// Zone center on the grid
    pub price_level: Decimal,

    pub tick_size: Decimal,

    /// In-window taker buy volume at the zone
    pub aggressive_buy_volume: Decimal,

    /// In-window taker sell volume at the zone
    pub aggressive_sell_volume: Decimal,

    /// Resting bid quantity inside the zone, from the current book
    pub passive_bid_volume: Decimal,

    /// Resting ask quantity inside the zone, from the current book
    pub passive_ask_volume: Decimal,

    pub trade_count: u64,

    /// Age of the oldest in-window trade relative to the newest (ms)
    pub timespan_ms: i64,

    pub boundaries: ZoneBoundaries,

    /// Event time of the last in-zone trade (ms)
    pub last_update: i64,

    /// Sum(price * qty) / sum(qty) over in-window trades
    pub volume_weighted_price: Decimal,
}

impl ZoneSnapshot {
    pub fn aggressive_total(&self) -> Decimal {
        self.aggressive_buy_volume + self.aggressive_sell_volume
    }

    pub fn passive_total(&self) -> Decimal {
        self.passive_bid_volume + self.passive_ask_volume
    }
}

/// Zone grid parameters echoed alongside the snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfigEcho {
    pub base_ticks: i64,
    pub tick_value: Decimal,
    pub time_window_ms: i64,
}

/// Multi-resolution zone context: the event's neighborhood at zone widths
/// base_ticks x {1, 2, 4}, each slice ordered low zone to high zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardZoneData {
    pub base: Vec<ZoneSnapshot>,
    pub doubled: Vec<ZoneSnapshot>,
    pub quadrupled: Vec<ZoneSnapshot>,
    pub zone_config: ZoneConfigEcho,
}

/// Trade enriched with passive-liquidity and zone context, handed to every
/// detector in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedTrade {
    pub trade: AggressiveTrade,

    /// Passive sums in the configured band around the trade price,
    /// as of the latest applied diff
    pub passive_bid_volume: Decimal,
    pub passive_ask_volume: Decimal,

    /// Passive sums at the detectors' base zone width
    pub zone_passive_bid_volume: Decimal,
    pub zone_passive_ask_volume: Decimal,

    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,

    /// Present when standardized zones are enabled
    pub zone_data: Option<StandardZoneData>,
}

impl EnrichedTrade {
    pub fn price(&self) -> Decimal {
        self.trade.price
    }

    pub fn quantity(&self) -> Decimal {
        self.trade.quantity
    }

    pub fn timestamp(&self) -> i64 {
        self.trade.timestamp
    }

    pub fn is_aggressive_buy(&self) -> bool {
        self.trade.is_aggressive_buy()
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }
}
