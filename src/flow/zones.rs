//! Price-zone aggregation
//!
//! Zones are grid-aligned price bands of width `zone_ticks * tick_size`,
//! identified by `floor(price_ticks / zone_ticks)`. Each tracker keeps a
//! rolling trade window per zone in a fixed-size table; recycling is
//! least-recently-touched with age eviction, so sustained streams never grow
//! the table without bound. Passive fields always come from the *current*
//! book, not from historical passive state.

use crate::book::OrderBookEngine;
use crate::config::{PreprocessorConfig, StandardZoneConfig};
use crate::containers::TimeCache;
use crate::flow::types::{
    AggressiveTrade, StandardZoneData, ZoneBoundaries, ZoneConfigEcho, ZoneSnapshot,
};
use crate::num::{self, TickSpec};
use rust_decimal::Decimal;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct ZoneTrade {
    ts: i64,
    price: Decimal,
    qty: Decimal,
    is_buy: bool,
}

/// Rolling per-zone window of trades with O(1) aggregate updates
#[derive(Debug, Default)]
struct ZoneAggregate {
    trades: VecDeque<ZoneTrade>,
    buy_volume: Decimal,
    sell_volume: Decimal,
    weighted_price_sum: Decimal,
    last_update: i64,
}

impl ZoneAggregate {
    fn add(&mut self, trade: ZoneTrade) {
        if trade.is_buy {
            self.buy_volume += trade.qty;
        } else {
            self.sell_volume += trade.qty;
        }
        self.weighted_price_sum += trade.price * trade.qty;
        self.last_update = trade.ts;
        self.trades.push_back(trade);
    }

    fn evict(&mut self, now_ms: i64, window_ms: i64) {
        let cutoff = now_ms - window_ms;
        while let Some(front) = self.trades.front() {
            if front.ts >= cutoff {
                break;
            }
            let old = self.trades.pop_front().expect("front checked");
            if old.is_buy {
                self.buy_volume -= old.qty;
            } else {
                self.sell_volume -= old.qty;
            }
            self.weighted_price_sum -= old.price * old.qty;
        }
    }

    fn total_volume(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }

    fn vwap(&self) -> Decimal {
        let total = self.total_volume();
        if total.is_zero() {
            Decimal::ZERO
        } else {
            self.weighted_price_sum / total
        }
    }

    fn timespan_ms(&self) -> i64 {
        match (self.trades.front(), self.trades.back()) {
            (Some(first), Some(last)) => last.ts - first.ts,
            _ => 0,
        }
    }
}

/// All zones at one resolution (one zone width, one rolling window)
pub struct ZoneTracker {
    spec: TickSpec,
    zone_ticks: i64,
    window_ms: i64,
    zones: TimeCache<i64, ZoneAggregate>,
}

impl ZoneTracker {
    pub fn new(
        spec: TickSpec,
        zone_ticks: i64,
        window_ms: i64,
        cache_size: usize,
        max_age_ms: i64,
    ) -> Self {
        Self {
            spec,
            zone_ticks,
            window_ms,
            zones: TimeCache::new(cache_size, max_age_ms),
        }
    }

    pub fn zone_ticks(&self) -> i64 {
        self.zone_ticks
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Zone id for a price at this resolution
    pub fn zone_of(&self, price: Decimal) -> i64 {
        num::zone_id(self.spec.to_ticks(price), self.zone_ticks)
    }

    /// Record a trade; returns the zone it landed in
    pub fn on_trade(&mut self, trade: &AggressiveTrade) -> i64 {
        let zone = self.zone_of(trade.price);
        let window_ms = self.window_ms;
        let now = trade.timestamp;
        let agg = self.zones.get_or_insert_with(zone, now, ZoneAggregate::default);
        agg.add(ZoneTrade {
            ts: trade.timestamp,
            price: trade.price,
            qty: trade.quantity,
            is_buy: trade.is_aggressive_buy(),
        });
        agg.evict(now, window_ms);
        zone
    }

    /// Build a snapshot for a zone, joining the rolling trade aggregates with
    /// current passive sums from the book. None when the zone has no
    /// in-window trades.
    pub fn snapshot(
        &mut self,
        zone: i64,
        book: &OrderBookEngine,
        now_ms: i64,
    ) -> Option<ZoneSnapshot> {
        let zone_ticks = self.zone_ticks;
        let agg = self.zones.get_mut(&zone, now_ms)?;
        agg.evict(now_ms, self.window_ms);
        if agg.trades.is_empty() {
            return None;
        }

        let (lo, hi) = num::zone_bounds_ticks(zone, zone_ticks);
        let (passive_bid, passive_ask) = book.sum_ticks_range(lo, hi);
        Some(ZoneSnapshot {
            zone_id: zone,
            price_level: self.spec.to_price(num::zone_center_ticks(zone, zone_ticks)),
            tick_size: self.spec.tick_size,
            aggressive_buy_volume: agg.buy_volume,
            aggressive_sell_volume: agg.sell_volume,
            passive_bid_volume: passive_bid,
            passive_ask_volume: passive_ask,
            trade_count: agg.trades.len() as u64,
            timespan_ms: agg.timespan_ms(),
            boundaries: ZoneBoundaries {
                min: self.spec.to_price(lo),
                max: self.spec.to_price(hi),
            },
            last_update: agg.last_update,
            volume_weighted_price: agg.vwap(),
        })
    }

    /// Drop zones idle past the cache age
    pub fn evict_expired(&mut self, now_ms: i64) {
        self.zones.evict_expired(now_ms);
    }
}

/// The three standard resolutions (base_ticks x {1, 2, 4}) behind one API
pub struct ZoneAggregator {
    trackers: Vec<ZoneTracker>,
    zone_cfg: StandardZoneConfig,
    spec: TickSpec,
}

impl ZoneAggregator {
    pub fn new(spec: TickSpec, cfg: &PreprocessorConfig) -> Self {
        let zone_cfg = cfg.standard_zones.clone();
        let trackers = zone_cfg
            .zone_multipliers
            .iter()
            .zip(zone_cfg.time_windows_ms.iter())
            .map(|(&mult, &window)| {
                ZoneTracker::new(
                    spec,
                    zone_cfg.base_ticks * mult,
                    window,
                    cfg.zone_cache_size,
                    cfg.max_zone_cache_age_ms,
                )
            })
            .collect();
        Self {
            trackers,
            zone_cfg,
            spec,
        }
    }

    pub fn base_zone_ticks(&self) -> i64 {
        self.zone_cfg.base_ticks
    }

    /// Record the trade at every resolution
    pub fn on_trade(&mut self, trade: &AggressiveTrade) {
        for tracker in &mut self.trackers {
            tracker.on_trade(trade);
        }
    }

    /// Build the event's multi-resolution context: at each width, the trade's
    /// zone plus its immediate neighbors, low to high, filtered by the
    /// per-resolution volume threshold.
    pub fn standard_zone_data(
        &mut self,
        trade: &AggressiveTrade,
        book: &OrderBookEngine,
    ) -> StandardZoneData {
        let now = trade.timestamp;
        let mut slices: Vec<Vec<ZoneSnapshot>> = Vec::with_capacity(3);
        for (i, tracker) in self.trackers.iter_mut().enumerate() {
            let center = tracker.zone_of(trade.price);
            let threshold = self.zone_cfg.volume_thresholds[i];
            let mut out = Vec::with_capacity(3);
            for zone in [center - 1, center, center + 1] {
                if let Some(snap) = tracker.snapshot(zone, book, now) {
                    if threshold.is_zero() || snap.aggressive_total() >= threshold {
                        out.push(snap);
                    }
                }
            }
            slices.push(out);
        }
        let quadrupled = slices.pop().unwrap_or_default();
        let doubled = slices.pop().unwrap_or_default();
        let base = slices.pop().unwrap_or_default();
        StandardZoneData {
            base,
            doubled,
            quadrupled,
            zone_config: ZoneConfigEcho {
                base_ticks: self.zone_cfg.base_ticks,
                tick_value: self.spec.tick_size,
                time_window_ms: self.zone_cfg.time_windows_ms[0],
            },
        }
    }

    /// Passive sums inside the trade's base-width zone
    pub fn zone_passive(&self, trade: &AggressiveTrade, book: &OrderBookEngine) -> (Decimal, Decimal) {
        let tracker = &self.trackers[0];
        let zone = tracker.zone_of(trade.price);
        let (lo, hi) = num::zone_bounds_ticks(zone, tracker.zone_ticks());
        book.sum_ticks_range(lo, hi)
    }

    pub fn evict_expired(&mut self, now_ms: i64) {
        for tracker in &mut self.trackers {
            tracker.evict_expired(now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookSnapshot, OrderBookEngine};
    use crate::config::BookConfig;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn spec() -> TickSpec {
        TickSpec::new(2, 8)
    }

    fn trade(id: u64, price: &str, qty: &str, ts: i64, buyer_is_maker: bool) -> AggressiveTrade {
        AggressiveTrade {
            trade_id: id,
            price: d(price),
            quantity: d(qty),
            timestamp: ts,
            buyer_is_maker,
            pair: "BTCUSDT".to_string(),
        }
    }

    fn empty_book() -> OrderBookEngine {
        let mut book = OrderBookEngine::new("BTCUSDT", spec(), BookConfig::default());
        book.initialize_from_snapshot(
            &BookSnapshot {
                last_update_id: 1,
                bids: vec![(d("49.95"), d("10"))],
                asks: vec![(d("50.05"), d("20"))],
            },
            0,
        );
        book
    }

    #[test]
    fn test_window_membership_is_exact() {
        // zone width 10 ticks = 0.10; window 60s
        let mut tracker = ZoneTracker::new(spec(), 10, 60_000, 64, 90_000);
        let book = empty_book();

        tracker.on_trade(&trade(1, "50.00", "5", 1_000, true));
        tracker.on_trade(&trade(2, "50.03", "3", 30_000, false));
        // Outside the zone (0.10-wide band starting at 50.00)
        tracker.on_trade(&trade(3, "50.15", "7", 30_000, false));

        let zone = tracker.zone_of(d("50.00"));
        let snap = tracker.snapshot(zone, &book, 30_000).unwrap();
        assert_eq!(snap.aggressive_sell_volume, d("5"));
        assert_eq!(snap.aggressive_buy_volume, d("3"));
        assert_eq!(snap.trade_count, 2);

        // 62s later the first trade ages out.
        let snap = tracker.snapshot(zone, &book, 63_000).unwrap();
        assert_eq!(snap.aggressive_sell_volume, Decimal::ZERO);
        assert_eq!(snap.aggressive_buy_volume, d("3"));
        assert_eq!(snap.trade_count, 1);
    }

    #[test]
    fn test_vwap_over_window() {
        let mut tracker = ZoneTracker::new(spec(), 10, 60_000, 64, 90_000);
        let book = empty_book();
        tracker.on_trade(&trade(1, "50.00", "1", 0, false));
        tracker.on_trade(&trade(2, "50.04", "3", 100, false));

        let zone = tracker.zone_of(d("50.00"));
        let snap = tracker.snapshot(zone, &book, 200).unwrap();
        // (50.00*1 + 50.04*3) / 4 = 50.03
        assert_eq!(snap.volume_weighted_price, d("50.03"));
    }

    #[test]
    fn test_passive_fields_track_current_book() {
        let mut tracker = ZoneTracker::new(spec(), 10, 60_000, 64, 90_000);
        let book = empty_book();
        tracker.on_trade(&trade(1, "49.95", "1", 0, false));
        let zone = tracker.zone_of(d("49.95"));
        let snap = tracker.snapshot(zone, &book, 0).unwrap();
        // 49.95 bid level (qty 10) sits in the zone [49.90, 49.99]
        assert_eq!(snap.passive_bid_volume, d("10"));
        assert_eq!(snap.passive_ask_volume, Decimal::ZERO);
    }

    #[test]
    fn test_aggregator_produces_three_resolutions() {
        let spec = spec();
        let cfg = PreprocessorConfig::default();
        let mut agg = ZoneAggregator::new(spec, &cfg);
        let book = empty_book();
        let t = trade(1, "50.00", "5", 1_000, false);
        agg.on_trade(&t);
        let data = agg.standard_zone_data(&t, &book);
        assert!(!data.base.is_empty());
        assert!(!data.doubled.is_empty());
        assert!(!data.quadrupled.is_empty());
        assert_eq!(data.zone_config.base_ticks, 10);
    }
}
