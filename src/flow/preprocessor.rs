//! Trade/depth normalization and enrichment
//!
//! Owns the order book: depth diffs are parsed and applied here, and every
//! raw trade is either dropped (book not READY, malformed payload,
//! out-of-order id) with a counted reason, or emitted as a fully-populated
//! [`EnrichedTrade`]. Enrichment always reads the book state as of the
//! latest applied diff; no partially-enriched event is ever emitted.

use crate::book::{BookDiff, BookSnapshot, OrderBookEngine};
use crate::config::EngineConfig;
use crate::error::{DataError, SyncError};
use crate::feed::types::{AggTradeEvent, DepthSnapshot, DiffDepthEvent};
use crate::flow::types::{AggressiveTrade, EnrichedTrade};
use crate::flow::zones::ZoneAggregator;
use crate::metrics::{MetricsRegistry, RejectReason};
use crate::num;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Preprocessor {
    symbol: String,
    band_ticks: i64,
    standardized_zones: bool,
    book: OrderBookEngine,
    zones: ZoneAggregator,
    metrics: Arc<MetricsRegistry>,
    last_trade_id: Option<u64>,
    prune_interval_ms: i64,
    last_prune_ms: i64,
}

impl Preprocessor {
    pub fn new(cfg: &EngineConfig, metrics: Arc<MetricsRegistry>) -> Self {
        let spec = cfg.tick_spec();
        Self {
            symbol: cfg.symbol.clone(),
            band_ticks: cfg.preprocessor.band_ticks,
            standardized_zones: cfg.preprocessor.enable_standardized_zones,
            book: OrderBookEngine::new(cfg.symbol.clone(), spec, cfg.book.clone()),
            zones: ZoneAggregator::new(spec, &cfg.preprocessor),
            metrics,
            last_trade_id: None,
            prune_interval_ms: cfg.book.prune_interval_ms,
            last_prune_ms: 0,
        }
    }

    pub fn book(&self) -> &OrderBookEngine {
        &self.book
    }

    pub fn book_mut(&mut self) -> &mut OrderBookEngine {
        &mut self.book
    }

    /// Parse and apply a depth snapshot; the book enters READY state
    pub fn initialize_book(
        &mut self,
        snapshot: &DepthSnapshot,
        now_ms: i64,
    ) -> Result<(), DataError> {
        let parsed = BookSnapshot {
            last_update_id: snapshot.last_update_id,
            bids: parse_levels(&snapshot.bids)?,
            asks: parse_levels(&snapshot.asks)?,
        };
        self.book.initialize_from_snapshot(&parsed, now_ms);
        Ok(())
    }

    /// Parse and apply one depth diff.
    ///
    /// Malformed payloads are dropped and counted (the book keeps its state);
    /// sync errors propagate so the pipeline can run the resync protocol.
    pub fn handle_depth(&mut self, event: &DiffDepthEvent) -> Result<bool, SyncError> {
        let diff = match self.parse_diff(event) {
            Ok(diff) => diff,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Dropping malformed depth diff");
                self.metrics.reject(RejectReason::MalformedEvent);
                self.book.record_apply_failure(event.event_time);
                return Ok(false);
            }
        };

        let applied = self.book.apply_diff(&diff)?;
        if applied {
            self.metrics.diff_applied();
        }
        Ok(applied)
    }

    /// Parse, validate, and enrich one raw trade.
    ///
    /// Returns None (with a counted reason) when the book is not READY, the
    /// payload is malformed, or the trade id is out of order.
    pub fn handle_agg_trade(&mut self, event: &AggTradeEvent) -> Option<EnrichedTrade> {
        if !self.book.is_ready() {
            debug!(symbol = %self.symbol, trade_id = event.agg_trade_id, "Dropping trade: book not ready");
            self.metrics.reject(RejectReason::NotReady);
            return None;
        }

        let trade = match self.parse_trade(event) {
            Ok(trade) => trade,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "Dropping malformed trade");
                self.metrics.reject(RejectReason::MalformedEvent);
                return None;
            }
        };

        if let Some(last) = self.last_trade_id {
            if trade.trade_id <= last {
                let err = DataError::NonMonotonicTradeId {
                    last,
                    got: trade.trade_id,
                };
                warn!(symbol = %self.symbol, error = %err, "Dropping out-of-order trade");
                self.metrics.reject(RejectReason::OutOfOrder);
                return None;
            }
        }
        self.last_trade_id = Some(trade.trade_id);

        self.zones.on_trade(&trade);

        let band = self.book.sum_band(trade.price, self.band_ticks);
        let (zone_bid, zone_ask) = self.zones.zone_passive(&trade, &self.book);
        let zone_data = if self.standardized_zones {
            Some(self.zones.standard_zone_data(&trade, &self.book))
        } else {
            None
        };

        self.metrics.trade_processed();
        Some(EnrichedTrade {
            passive_bid_volume: band.bid,
            passive_ask_volume: band.ask,
            zone_passive_bid_volume: zone_bid,
            zone_passive_ask_volume: zone_ask,
            best_bid: self.book.best_bid(),
            best_ask: self.book.best_ask(),
            zone_data,
            trade,
        })
    }

    /// Periodic maintenance: zone-table eviction and book pruning (the book
    /// prunes on its own, slower cadence)
    pub fn cleanup(&mut self, now_ms: i64) {
        self.zones.evict_expired(now_ms);
        if now_ms - self.last_prune_ms >= self.prune_interval_ms {
            self.book.prune();
            self.last_prune_ms = now_ms;
        }
    }

    fn parse_trade(&self, event: &AggTradeEvent) -> Result<AggressiveTrade, DataError> {
        Ok(AggressiveTrade {
            trade_id: event.agg_trade_id,
            price: num::parse_price(&event.price)?,
            quantity: {
                let qty = num::parse_quantity(&event.quantity)?;
                if qty.is_zero() {
                    return Err(DataError::OutOfRange {
                        field: "quantity",
                        value: event.quantity.clone(),
                    });
                }
                qty
            },
            timestamp: event.trade_time,
            buyer_is_maker: event.is_buyer_maker,
            pair: self.symbol.clone(),
        })
    }

    fn parse_diff(&self, event: &DiffDepthEvent) -> Result<BookDiff, DataError> {
        Ok(BookDiff {
            first_update_id: event.first_update_id,
            final_update_id: event.final_update_id,
            event_time: event.event_time,
            bids: parse_levels(&event.bids)?,
            asks: parse_levels(&event.asks)?,
        })
    }
}

fn parse_levels(levels: &[[String; 2]]) -> Result<Vec<(Decimal, Decimal)>, DataError> {
    levels
        .iter()
        .map(|[price, qty]| Ok((num::parse_price(price)?, num::parse_quantity(qty)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn snapshot(last_update_id: i64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id,
            bids: vec![["49.95".to_string(), "10".to_string()]],
            asks: vec![["50.05".to_string(), "20".to_string()]],
        }
    }

    fn agg_trade(id: u64, price: &str, qty: &str, ts: i64, buyer_is_maker: bool) -> AggTradeEvent {
        AggTradeEvent {
            event_type: "aggTrade".to_string(),
            event_time: ts,
            symbol: "BTCUSDT".to_string(),
            agg_trade_id: id,
            price: price.to_string(),
            quantity: qty.to_string(),
            first_trade_id: id,
            last_trade_id: id,
            trade_time: ts,
            is_buyer_maker: buyer_is_maker,
            is_best_match: true,
        }
    }

    fn preprocessor() -> (Preprocessor, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let pre = Preprocessor::new(&EngineConfig::default(), Arc::clone(&metrics));
        (pre, metrics)
    }

    #[test]
    fn test_trade_dropped_before_snapshot() {
        let (mut pre, metrics) = preprocessor();
        assert!(pre.handle_agg_trade(&agg_trade(1, "50.00", "1", 0, false)).is_none());
        assert_eq!(metrics.snapshot().not_ready, 1);
    }

    #[test]
    fn test_enrichment_carries_band_and_quotes() {
        let (mut pre, _) = preprocessor();
        pre.initialize_book(&snapshot(100), 0).unwrap();

        let enriched = pre
            .handle_agg_trade(&agg_trade(1, "50.00", "2", 1_000, false))
            .unwrap();
        // Band of 5 ticks around 50.00 covers 49.95..50.05.
        assert_eq!(enriched.passive_bid_volume, Decimal::from(10));
        assert_eq!(enriched.passive_ask_volume, Decimal::from(20));
        assert_eq!(enriched.best_bid, Some(Decimal::new(4995, 2)));
        assert_eq!(enriched.best_ask, Some(Decimal::new(5005, 2)));
        assert!(enriched.zone_data.is_some());
    }

    #[test]
    fn test_malformed_trade_dropped_and_counted() {
        let (mut pre, metrics) = preprocessor();
        pre.initialize_book(&snapshot(100), 0).unwrap();
        assert!(pre.handle_agg_trade(&agg_trade(1, "garbage", "1", 0, false)).is_none());
        assert!(pre.handle_agg_trade(&agg_trade(2, "50.00", "0", 0, false)).is_none());
        assert_eq!(metrics.snapshot().malformed_event, 2);
    }

    #[test]
    fn test_out_of_order_trade_dropped() {
        let (mut pre, metrics) = preprocessor();
        pre.initialize_book(&snapshot(100), 0).unwrap();
        assert!(pre.handle_agg_trade(&agg_trade(5, "50.00", "1", 0, false)).is_some());
        assert!(pre.handle_agg_trade(&agg_trade(5, "50.00", "1", 1, false)).is_none());
        assert!(pre.handle_agg_trade(&agg_trade(4, "50.00", "1", 2, false)).is_none());
        assert!(pre.handle_agg_trade(&agg_trade(6, "50.00", "1", 3, false)).is_some());
        assert_eq!(metrics.snapshot().out_of_order, 2);
        assert_eq!(metrics.snapshot().malformed_event, 0);
    }

    #[test]
    fn test_depth_gap_propagates_for_resync() {
        let (mut pre, _) = preprocessor();
        pre.initialize_book(&snapshot(100), 0).unwrap();

        let good = DiffDepthEvent {
            event_type: "depthUpdate".to_string(),
            event_time: 1,
            symbol: "BTCUSDT".to_string(),
            first_update_id: 101,
            final_update_id: 102,
            bids: vec![["49.96".to_string(), "1".to_string()]],
            asks: vec![],
        };
        assert!(pre.handle_depth(&good).unwrap());

        let gapped = DiffDepthEvent {
            first_update_id: 110,
            final_update_id: 111,
            ..good.clone()
        };
        assert!(matches!(
            pre.handle_depth(&gapped),
            Err(SyncError::IdGap { expected: 103, .. })
        ));
    }
}
