//! Accumulation / distribution zone detectors
//!
//! Unlike the point-event detectors, these track *evolving* zones: a bounded
//! set of candidates, each with a ring buffer of in-zone trades, rolling
//! buy/sell volume, and Welford price stability. Accumulation reads
//! sell-dominant flow into a stable zone as passive institutional buying
//! (side = buy); distribution is the inversion (side = sell).

use crate::config::ZoneDetectorConfig;
use crate::containers::{RingBuffer, Welford};
use crate::detect::{
    bounded_confidence, CooldownGate, Detector, DetectorSource, SignalCandidate, SignalSide,
};
use crate::flow::EnrichedTrade;
use crate::metrics::{MetricsRegistry, RejectReason};
use crate::num::{self, TickSpec};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Which lifecycle the detector is hunting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    Accumulation,
    Distribution,
}

impl ZoneKind {
    fn source(self) -> DetectorSource {
        match self {
            ZoneKind::Accumulation => DetectorSource::Accumulation,
            ZoneKind::Distribution => DetectorSource::Distribution,
        }
    }

    fn side(self) -> SignalSide {
        match self {
            ZoneKind::Accumulation => SignalSide::Buy,
            ZoneKind::Distribution => SignalSide::Sell,
        }
    }
}

/// In-zone trade observations kept per candidate
const CANDIDATE_TRADE_CAPACITY: usize = 256;

#[derive(Debug)]
struct ZoneCandidate {
    price_level: Decimal,
    started_at: i64,
    trades: RingBuffer<(i64, f64, f64)>,
    buy_volume: Decimal,
    sell_volume: Decimal,
    trade_count: u64,
    price_stats: Welford,
    last_activity: i64,
    breakout_run: u32,
}

impl ZoneCandidate {
    fn new(price_level: Decimal, now_ms: i64) -> Self {
        Self {
            price_level,
            started_at: now_ms,
            trades: RingBuffer::new(CANDIDATE_TRADE_CAPACITY),
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            trade_count: 0,
            price_stats: Welford::new(),
            last_activity: now_ms,
            breakout_run: 0,
        }
    }

    fn record(&mut self, trade: &EnrichedTrade) {
        let price = num::to_f64(trade.price());
        if trade.is_aggressive_buy() {
            self.buy_volume += trade.quantity();
        } else {
            self.sell_volume += trade.quantity();
        }
        self.trade_count += 1;
        self.price_stats.add(price);
        self.trades
            .push((trade.timestamp(), price, num::to_f64(trade.quantity())));
        self.last_activity = trade.timestamp();
        self.breakout_run = 0;
    }

    fn total_volume(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }

    /// Mean clip size over the retained in-zone trades
    fn avg_recent_qty(&self) -> f64 {
        if self.trades.is_empty() {
            return 0.0;
        }
        self.trades.iter().map(|&(_, _, qty)| qty).sum::<f64>() / self.trades.len() as f64
    }

    /// Price stability in [0, 1]: 1 at zero dispersion, 0 when the standard
    /// deviation reaches the zone half-width
    fn stability(&self, zone_half_width: f64) -> f64 {
        if self.price_stats.count() < 2 {
            return 1.0;
        }
        if zone_half_width <= 0.0 {
            return 0.0;
        }
        (1.0 - self.price_stats.std_dev() / zone_half_width).clamp(0.0, 1.0)
    }
}

/// Inputs to the pure confidence function
#[derive(Debug, Clone, Copy)]
pub struct ZoneScore {
    /// Dominant-volume share in [0, 1]
    pub dominance: f64,
    pub dominance_threshold: f64,

    pub stability: f64,
    pub strong_zone_threshold: f64,

    /// Zone age over the minimum duration, capped at 1
    pub maturity: f64,
}

/// Pure, bounded confidence composition
pub fn zone_confidence(s: &ZoneScore) -> f64 {
    let dominance_excess = if s.dominance_threshold < 1.0 {
        ((s.dominance - s.dominance_threshold) / (1.0 - s.dominance_threshold)).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mut score = 0.4 * dominance_excess + 0.35 * s.stability + 0.25 * s.maturity;
    if s.stability >= s.strong_zone_threshold {
        score += 0.1;
    }
    bounded_confidence(score)
}

pub struct ZoneLifecycleDetector {
    kind: ZoneKind,
    spec: TickSpec,
    zone_ticks: i64,
    window_ms: i64,
    cfg: ZoneDetectorConfig,
    candidates: HashMap<i64, ZoneCandidate>,
    cooldown: CooldownGate,
    metrics: Arc<MetricsRegistry>,
}

impl ZoneLifecycleDetector {
    pub fn new(
        kind: ZoneKind,
        spec: TickSpec,
        zone_ticks: i64,
        window_ms: i64,
        event_cooldown_ms: i64,
        cfg: ZoneDetectorConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            kind,
            spec,
            zone_ticks,
            window_ms,
            cfg,
            candidates: HashMap::new(),
            cooldown: CooldownGate::new(event_cooldown_ms),
            metrics,
        }
    }

    fn zone_half_width(&self) -> f64 {
        num::to_f64(self.spec.tick_size) * self.zone_ticks as f64 / 2.0
    }

    /// Volume share of the dominant (non-signal) side for this kind
    fn dominance(&self, candidate: &ZoneCandidate) -> f64 {
        let total = num::to_f64(candidate.total_volume());
        if total <= 0.0 {
            return 0.0;
        }
        match self.kind {
            ZoneKind::Accumulation => num::to_f64(candidate.sell_volume) / total,
            ZoneKind::Distribution => num::to_f64(candidate.buy_volume) / total,
        }
    }

    fn dominance_threshold(&self) -> f64 {
        match self.kind {
            ZoneKind::Accumulation => self.cfg.min_sell_ratio,
            ZoneKind::Distribution => self.cfg.min_buy_ratio,
        }
    }

    fn evaluate(&mut self, zone: i64, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        let half_width = self.zone_half_width();
        let dominance_threshold = self.dominance_threshold();
        let candidate = self.candidates.get(&zone)?;
        let now = trade.timestamp();

        let age = now - candidate.started_at;
        if age < self.cfg.min_duration_ms {
            return None;
        }
        if now - candidate.last_activity > self.cfg.min_recent_activity_ms {
            return None;
        }
        if candidate.total_volume() < self.cfg.min_zone_volume
            || candidate.trade_count < self.cfg.min_trade_count
        {
            return None;
        }

        let dominance = self.dominance(candidate);
        if dominance < dominance_threshold {
            return None;
        }

        let stability = candidate.stability(half_width);
        if stability < self.cfg.price_stability_threshold {
            return None;
        }

        let side = self.kind.side();
        let score = ZoneScore {
            dominance,
            dominance_threshold,
            stability,
            strong_zone_threshold: self.cfg.strong_zone_threshold,
            maturity: (age as f64 / (2.0 * self.cfg.min_duration_ms as f64)).clamp(0.0, 1.0),
        };
        let confidence = zone_confidence(&score);
        if confidence < self.cfg.final_confidence_threshold {
            self.metrics.reject(RejectReason::BelowConfidence);
            return None;
        }

        if !self.cooldown.ready(zone, side, now) {
            self.metrics.reject(RejectReason::Cooldown);
            return None;
        }
        self.cooldown.touch(zone, side, now);

        debug!(
            zone,
            kind = ?self.kind,
            dominance,
            stability,
            age_ms = age,
            confidence,
            "Zone lifecycle candidate"
        );

        let passive = match self.kind {
            // The absorbing side's resting depth backs the signal.
            ZoneKind::Accumulation => trade.zone_passive_bid_volume,
            ZoneKind::Distribution => trade.zone_passive_ask_volume,
        };
        Some(SignalCandidate::new(
            self.kind.source(),
            side,
            trade.price(),
            zone,
            candidate.total_volume(),
            passive,
            false,
            confidence,
            now,
            serde_json::json!({
                "zone_price_level": num::to_f64(candidate.price_level),
                "duration_ms": age,
                "dominance": dominance,
                "stability": stability,
                "trade_count": candidate.trade_count,
                "avg_clip_qty": candidate.avg_recent_qty(),
            }),
        ))
    }

    /// Drop the weakest candidate to make room for a new zone
    fn evict_weakest(&mut self) {
        let half_width = self.zone_half_width();
        let weakest = self
            .candidates
            .iter()
            .min_by(|(_, a), (_, b)| {
                let sa = a.stability(half_width);
                let sb = b.stability(half_width);
                sa.partial_cmp(&sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.last_activity.cmp(&b.last_activity))
            })
            .map(|(&k, _)| k);
        if let Some(zone) = weakest {
            self.candidates.remove(&zone);
        }
    }
}

impl Detector for ZoneLifecycleDetector {
    fn source(&self) -> DetectorSource {
        self.kind.source()
    }

    fn on_trade(&mut self, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        let now = trade.timestamp();
        let zone = num::zone_id(self.spec.to_ticks(trade.price()), self.zone_ticks);
        let half_width = self.zone_half_width();
        let weak = self.cfg.weak_zone_threshold;
        let max_breakout = self.cfg.max_breakout_trades;

        // Candidates the price has left accumulate a breakout run; persistent
        // breakouts or crumbling stability invalidate them.
        self.candidates.retain(|&z, candidate| {
            if z != zone {
                candidate.breakout_run += 1;
                if candidate.breakout_run > max_breakout {
                    return false;
                }
            }
            candidate.price_stats.count() < 2 || candidate.stability(half_width) >= weak
        });

        if !self.candidates.contains_key(&zone) {
            if self.candidates.len() >= self.cfg.max_candidates {
                self.evict_weakest();
            }
            let price_level = self
                .spec
                .to_price(num::zone_center_ticks(zone, self.zone_ticks));
            self.candidates
                .insert(zone, ZoneCandidate::new(price_level, now));
        }
        if let Some(candidate) = self.candidates.get_mut(&zone) {
            candidate.record(trade);
        }

        self.evaluate(zone, trade)
    }

    fn cleanup(&mut self, now_ms: i64) {
        let horizon = 2 * self.window_ms;
        self.candidates
            .retain(|_, c| now_ms - c.last_activity <= horizon);
        self.cooldown.cleanup(now_ms, horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::AggressiveTrade;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn fast_cfg() -> ZoneDetectorConfig {
        ZoneDetectorConfig {
            min_duration_ms: 5_000,
            min_sell_ratio: 0.6,
            min_buy_ratio: 0.6,
            min_recent_activity_ms: 30_000,
            min_zone_volume: Decimal::from(50),
            min_trade_count: 10,
            price_stability_threshold: 0.5,
            strong_zone_threshold: 0.8,
            weak_zone_threshold: 0.2,
            max_breakout_trades: 5,
            max_candidates: 3,
            final_confidence_threshold: 0.3,
        }
    }

    fn detector(kind: ZoneKind) -> ZoneLifecycleDetector {
        ZoneLifecycleDetector::new(
            kind,
            TickSpec::new(2, 8),
            10,
            60_000,
            15_000,
            fast_cfg(),
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn enriched(id: u64, price: &str, qty: &str, ts: i64, buyer_is_maker: bool) -> EnrichedTrade {
        EnrichedTrade {
            trade: AggressiveTrade {
                trade_id: id,
                price: d(price),
                quantity: d(qty),
                timestamp: ts,
                buyer_is_maker,
                pair: "BTCUSDT".to_string(),
            },
            passive_bid_volume: d("500"),
            passive_ask_volume: d("500"),
            zone_passive_bid_volume: d("500"),
            zone_passive_ask_volume: d("500"),
            best_bid: Some(d("99.99")),
            best_ask: Some(d("100.01")),
            zone_data: None,
        }
    }

    #[test]
    fn test_sell_dominated_stable_zone_emits_accumulation_buy() {
        let mut det = detector(ZoneKind::Accumulation);
        let mut candidate = None;
        // 15 sells and 3 buys at a stable price over 7 seconds.
        for i in 0..18u64 {
            let is_sell = i % 6 != 5;
            let trade = enriched(i + 1, "100.02", "10", (i as i64) * 400, is_sell);
            if let Some(c) = det.on_trade(&trade) {
                candidate = Some(c);
            }
        }
        let c = candidate.expect("accumulation candidate expected");
        assert_eq!(c.source, DetectorSource::Accumulation);
        assert_eq!(c.side, SignalSide::Buy);
        assert!(c.confidence > 0.0 && c.confidence <= 1.0);
    }

    #[test]
    fn test_distribution_is_the_inversion() {
        let mut det = detector(ZoneKind::Distribution);
        let mut candidate = None;
        for i in 0..18u64 {
            let is_sell = i % 6 == 5; // buy-dominated
            let trade = enriched(i + 1, "100.02", "10", (i as i64) * 400, is_sell);
            if let Some(c) = det.on_trade(&trade) {
                candidate = Some(c);
            }
        }
        let c = candidate.expect("distribution candidate expected");
        assert_eq!(c.source, DetectorSource::Distribution);
        assert_eq!(c.side, SignalSide::Sell);
    }

    #[test]
    fn test_balanced_flow_never_qualifies() {
        let mut det = detector(ZoneKind::Accumulation);
        for i in 0..30u64 {
            let trade = enriched(i + 1, "100.02", "10", (i as i64) * 400, i % 2 == 0);
            assert!(det.on_trade(&trade).is_none());
        }
    }

    #[test]
    fn test_young_zone_cannot_emit() {
        let mut det = detector(ZoneKind::Accumulation);
        // Heavy sell dominance but all inside 2 seconds (< min_duration_ms).
        for i in 0..20u64 {
            let trade = enriched(i + 1, "100.02", "10", (i as i64) * 100, true);
            assert!(det.on_trade(&trade).is_none());
        }
    }

    #[test]
    fn test_persistent_breakout_invalidates_candidate() {
        let mut det = detector(ZoneKind::Accumulation);
        for i in 0..10u64 {
            det.on_trade(&enriched(i + 1, "100.02", "10", (i as i64) * 400, true));
        }
        assert!(det.candidates.contains_key(&1000));
        // Price leaves the zone for more than max_breakout_trades trades.
        for i in 10..17u64 {
            det.on_trade(&enriched(i + 1, "101.55", "10", (i as i64) * 400, true));
        }
        assert!(!det.candidates.contains_key(&1000));
    }

    #[test]
    fn test_candidate_set_is_bounded() {
        let mut det = detector(ZoneKind::Accumulation);
        for i in 0..10u64 {
            // Each trade in a different zone.
            let price = format!("{}.02", 100 + i);
            det.on_trade(&enriched(i + 1, &price, "10", (i as i64) * 400, true));
        }
        assert!(det.candidates.len() <= fast_cfg().max_candidates);
    }

    #[test]
    fn test_zone_confidence_bounds() {
        let s = ZoneScore {
            dominance: 0.8,
            dominance_threshold: 0.6,
            stability: 0.9,
            strong_zone_threshold: 0.8,
            maturity: 1.0,
        };
        let c = zone_confidence(&s);
        assert!((0.0..=1.0).contains(&c));

        let junk = ZoneScore {
            dominance: f64::NAN,
            dominance_threshold: 0.6,
            stability: f64::INFINITY,
            strong_zone_threshold: 0.8,
            maturity: -3.0,
        };
        let c = zone_confidence(&junk);
        assert!(c.is_finite() && (0.0..=1.0).contains(&c));
    }
}
