//! Absorption detector
//!
//! Finds zones where heavy aggressive flow executes against resting
//! liquidity without moving price efficiently: the absorbing side owns the
//! level. Signal direction is the absorbing side, i.e. opposite the dominant
//! aggressor (aggressive sells hammered into the bid -> side = buy).

use crate::config::AbsorptionConfig;
use crate::containers::WindowStats;
use crate::detect::{
    bounded_confidence, CooldownGate, Detector, DetectorSource, SignalCandidate, SignalSide,
};
use crate::flow::EnrichedTrade;
use crate::metrics::{MetricsRegistry, RejectReason};
use crate::num::{self, TickSpec};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct TradeObs {
    ts: i64,
    price_ticks: i64,
    qty: Decimal,
    is_buy: bool,
}

/// Rolling per-zone state
#[derive(Debug)]
struct ZoneState {
    trades: VecDeque<TradeObs>,
    buy_volume: Decimal,
    sell_volume: Decimal,

    /// Observed zone passive totals (bid+ask), for the rolling average
    passive_obs: WindowStats,

    /// Observed spreads, for the spread-impact filter
    spread_obs: WindowStats,

    /// Previous passive observation per side, for refill tracking
    prev_bid: f64,
    prev_ask: f64,
    bid_dipped: bool,
    ask_dipped: bool,
    bid_refills: u32,
    ask_refills: u32,

    last_activity: i64,
}

impl ZoneState {
    fn new(window_ms: i64) -> Self {
        Self {
            trades: VecDeque::new(),
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            passive_obs: WindowStats::new(window_ms),
            spread_obs: WindowStats::new(window_ms),
            prev_bid: 0.0,
            prev_ask: 0.0,
            bid_dipped: false,
            ask_dipped: false,
            bid_refills: 0,
            ask_refills: 0,
            last_activity: 0,
        }
    }

    fn add(&mut self, obs: TradeObs, window_ms: i64) {
        self.last_activity = obs.ts;
        if obs.is_buy {
            self.buy_volume += obs.qty;
        } else {
            self.sell_volume += obs.qty;
        }
        self.trades.push_back(obs);
        self.evict(window_ms);
    }

    fn evict(&mut self, window_ms: i64) {
        let Some(back) = self.trades.back() else {
            return;
        };
        let cutoff = back.ts - window_ms;
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
        }
    }

    /// Track passive dips and refills per side. A refill is a dip of more
    /// than 20% followed by recovery above the pre-dip level's half.
    fn observe_passive(&mut self, ts: i64, bid: f64, ask: f64) {
        self.passive_obs.push(ts, bid + ask);

        if self.prev_bid > 0.0 {
            if bid < self.prev_bid * 0.8 {
                self.bid_dipped = true;
            } else if self.bid_dipped && bid > self.prev_bid {
                self.bid_refills += 1;
                self.bid_dipped = false;
            }
        }
        if self.prev_ask > 0.0 {
            if ask < self.prev_ask * 0.8 {
                self.ask_dipped = true;
            } else if self.ask_dipped && ask > self.prev_ask {
                self.ask_refills += 1;
                self.ask_dipped = false;
            }
        }
        self.prev_bid = bid;
        self.prev_ask = ask;
    }

    fn aggressive_total(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }

    fn price_range_ticks(&self) -> i64 {
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for obs in &self.trades {
            min = min.min(obs.price_ticks);
            max = max.max(obs.price_ticks);
        }
        if min > max {
            0
        } else {
            max - min
        }
    }

    fn median_trade_size(&self) -> f64 {
        if self.trades.is_empty() {
            return 0.0;
        }
        let mut sizes: Vec<f64> = self.trades.iter().map(|t| num::to_f64(t.qty)).collect();
        sizes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sizes.len() / 2;
        if sizes.len() % 2 == 0 {
            (sizes[mid - 1] + sizes[mid]) / 2.0
        } else {
            sizes[mid]
        }
    }

    fn events_per_sec(&self) -> f64 {
        match (self.trades.front(), self.trades.back()) {
            (Some(first), Some(last)) if last.ts > first.ts => {
                self.trades.len() as f64 / ((last.ts - first.ts) as f64 / 1000.0)
            }
            _ => 0.0,
        }
    }
}

/// Inputs to the pure confidence function
#[derive(Debug, Clone, Copy)]
pub struct AbsorptionScore {
    /// priceMovement / expectedMovement, lower is stronger
    pub efficiency: f64,
    pub efficiency_threshold: f64,

    /// passive / (aggressive * absorption_threshold), capped at 1
    pub passive_cover: f64,

    /// aggressive / min_agg_volume, capped at 1
    pub volume_weight: f64,

    pub refilled: bool,

    /// events/sec scaled by 10, capped at 1; zero when the feature is off
    pub velocity: f64,
}

/// Pure, bounded confidence composition
pub fn absorption_confidence(s: &AbsorptionScore) -> f64 {
    let efficiency_component = if s.efficiency_threshold > 0.0 {
        (1.0 - s.efficiency / s.efficiency_threshold).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mut score = 0.5 * efficiency_component + 0.3 * s.passive_cover + 0.2 * s.volume_weight;
    if s.refilled {
        score += 0.1;
    }
    score += 0.05 * s.velocity;
    bounded_confidence(score)
}

pub struct AbsorptionDetector {
    spec: TickSpec,
    zone_ticks: i64,
    window_ms: i64,
    cfg: AbsorptionConfig,
    zones: HashMap<i64, ZoneState>,
    cooldown: CooldownGate,
    metrics: Arc<MetricsRegistry>,
}

impl AbsorptionDetector {
    pub fn new(
        spec: TickSpec,
        zone_ticks: i64,
        window_ms: i64,
        event_cooldown_ms: i64,
        cfg: AbsorptionConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            spec,
            zone_ticks,
            window_ms,
            cfg,
            zones: HashMap::new(),
            cooldown: CooldownGate::new(event_cooldown_ms),
            metrics,
        }
    }

    fn evaluate(&mut self, zone: i64, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        let state = self.zones.get(&zone)?;
        let now = trade.timestamp();

        let aggressive = state.aggressive_total();
        if aggressive < self.cfg.min_agg_volume {
            return None;
        }

        let aggressive_f = num::to_f64(aggressive);
        let passive = state.passive_obs.mean();
        let ratio = aggressive_f / passive.max(f64::EPSILON);
        if ratio >= self.cfg.max_absorption_ratio {
            // Too much volume against too little liquidity: that zone is
            // depleting, not absorbing.
            return None;
        }
        if passive < self.cfg.min_passive_multiplier * aggressive_f {
            return None;
        }

        let median = state.median_trade_size();
        if median <= 0.0 {
            return None;
        }
        let tick = num::to_f64(self.spec.tick_size);
        let movement = state.price_range_ticks() as f64 * tick;
        let expected = (aggressive_f / median) * tick * self.cfg.movement_scaler;
        if expected <= 0.0 {
            return None;
        }
        let efficiency = movement / expected;
        if efficiency >= self.cfg.price_efficiency_threshold {
            return None;
        }

        // Reversal semantics: the absorbing side is opposite the dominant
        // aggressor and is the signal direction.
        let side = if state.buy_volume > state.sell_volume {
            SignalSide::Sell
        } else {
            SignalSide::Buy
        };

        if self.cfg.features.spread_impact {
            let spread_now = state.spread_obs.latest().unwrap_or(0.0);
            let spread_avg = state.spread_obs.mean();
            if spread_avg > 0.0 && spread_now > spread_avg * 3.0 {
                return None;
            }
        }
        if self.cfg.features.liquidity_gradient {
            // The zone must hold at least its share of the surrounding band.
            let band_total =
                num::to_f64(trade.passive_bid_volume) + num::to_f64(trade.passive_ask_volume);
            if band_total > 0.0 && passive < band_total * 0.25 {
                return None;
            }
        }

        let refilled = self.cfg.features.refill_detection
            && match side {
                SignalSide::Buy => state.bid_refills > 0,
                SignalSide::Sell => state.ask_refills > 0,
            };

        let velocity = if self.cfg.features.absorption_velocity {
            (state.events_per_sec() / 10.0).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let score = AbsorptionScore {
            efficiency,
            efficiency_threshold: self.cfg.price_efficiency_threshold,
            passive_cover: (passive / (aggressive_f * self.cfg.absorption_threshold))
                .clamp(0.0, 1.0),
            volume_weight: (aggressive_f / num::to_f64(self.cfg.min_agg_volume).max(f64::EPSILON))
                .clamp(0.0, 1.0),
            refilled,
            velocity,
        };
        let confidence = absorption_confidence(&score);
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
            side = ?side,
            aggressive = %aggressive,
            passive,
            efficiency,
            confidence,
            "Absorption candidate"
        );

        Some(SignalCandidate::new(
            DetectorSource::Absorption,
            side,
            trade.price(),
            zone,
            aggressive,
            Decimal::try_from(passive).unwrap_or(Decimal::ZERO),
            refilled,
            confidence,
            now,
            serde_json::json!({
                "absorption_ratio": ratio,
                "price_efficiency": efficiency,
                "buy_volume": num::to_f64(state.buy_volume),
                "sell_volume": num::to_f64(state.sell_volume),
                "trade_count": state.trades.len(),
            }),
        ))
    }
}

impl Detector for AbsorptionDetector {
    fn source(&self) -> DetectorSource {
        DetectorSource::Absorption
    }

    fn on_trade(&mut self, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        let zone = num::zone_id(self.spec.to_ticks(trade.price()), self.zone_ticks);
        let window_ms = self.window_ms;
        let state = self
            .zones
            .entry(zone)
            .or_insert_with(|| ZoneState::new(window_ms));

        state.add(
            TradeObs {
                ts: trade.timestamp(),
                price_ticks: self.spec.to_ticks(trade.price()),
                qty: trade.quantity(),
                is_buy: trade.is_aggressive_buy(),
            },
            window_ms,
        );
        state.observe_passive(
            trade.timestamp(),
            num::to_f64(trade.zone_passive_bid_volume),
            num::to_f64(trade.zone_passive_ask_volume),
        );
        if let Some(spread) = trade.spread() {
            state.spread_obs.push(trade.timestamp(), num::to_f64(spread));
        }

        self.evaluate(zone, trade)
    }

    fn cleanup(&mut self, now_ms: i64) {
        let horizon = 2 * self.window_ms;
        self.zones
            .retain(|_, state| now_ms - state.last_activity <= horizon);
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

    fn permissive_cfg() -> AbsorptionConfig {
        AbsorptionConfig {
            min_agg_volume: Decimal::from(1),
            absorption_threshold: 1.0,
            max_absorption_ratio: 10.0,
            price_efficiency_threshold: 0.9,
            min_passive_multiplier: 0.0,
            movement_scaler: 1.0,
            final_confidence_threshold: 0.1,
            features: Default::default(),
        }
    }

    fn detector(cfg: AbsorptionConfig) -> AbsorptionDetector {
        AbsorptionDetector::new(
            TickSpec::new(2, 8),
            10,
            60_000,
            15_000,
            cfg,
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
            passive_bid_volume: d("1000"),
            passive_ask_volume: d("1000"),
            zone_passive_bid_volume: d("1000"),
            zone_passive_ask_volume: d("1000"),
            best_bid: Some(d(price)),
            best_ask: Some(d(price) + d("0.01")),
            zone_data: None,
        }
    }

    #[test]
    fn test_aggressive_sells_absorbed_at_bid_signal_buy() {
        let mut det = detector(permissive_cfg());
        let mut candidate = None;
        for i in 0..5u64 {
            // 5 x 100 qty sells at exactly 50000.00
            let trade = enriched(i + 1, "50000.00", "100", 1_000 + i as i64 * 100, true);
            if let Some(c) = det.on_trade(&trade) {
                candidate = Some(c);
            }
        }
        let c = candidate.expect("absorption candidate expected");
        assert_eq!(c.side, SignalSide::Buy);
        assert_eq!(c.source, DetectorSource::Absorption);
        assert!(c.confidence > 0.0 && c.confidence <= 1.0);
    }

    #[test]
    fn test_aggressive_buys_signal_sell() {
        let mut det = detector(permissive_cfg());
        let mut candidate = None;
        for i in 0..5u64 {
            let trade = enriched(i + 1, "50000.00", "100", 1_000 + i as i64 * 100, false);
            if let Some(c) = det.on_trade(&trade) {
                candidate = Some(c);
            }
        }
        assert_eq!(candidate.unwrap().side, SignalSide::Sell);
    }

    #[test]
    fn test_insufficient_volume_is_silent() {
        let mut cfg = permissive_cfg();
        cfg.min_agg_volume = Decimal::from(10_000);
        let mut det = detector(cfg);
        for i in 0..5u64 {
            let trade = enriched(i + 1, "50000.00", "100", 1_000 + i as i64 * 100, true);
            assert!(det.on_trade(&trade).is_none());
        }
    }

    #[test]
    fn test_high_ratio_rejected_as_exhaustion_territory() {
        let mut cfg = permissive_cfg();
        cfg.max_absorption_ratio = 0.01;
        let mut det = detector(cfg);
        for i in 0..5u64 {
            let trade = enriched(i + 1, "50000.00", "100", 1_000 + i as i64 * 100, true);
            assert!(det.on_trade(&trade).is_none());
        }
    }

    #[test]
    fn test_moving_price_is_not_absorption() {
        let mut cfg = permissive_cfg();
        cfg.min_agg_volume = Decimal::from(3);
        let mut det = detector(cfg);
        // Same zone, but price walks the whole zone on small clips:
        // movement far exceeds the expected movement for this volume.
        let prices = ["50000.00", "50000.05", "50000.09", "50000.02", "50000.07"];
        for (i, p) in prices.iter().enumerate() {
            let trade = enriched(i as u64 + 1, p, "1", 1_000 + i as i64 * 100, true);
            assert!(det.on_trade(&trade).is_none());
        }
    }

    #[test]
    fn test_cooldown_suppresses_repeat_candidates() {
        let mut det = detector(permissive_cfg());
        let mut fired = 0;
        for i in 0..20u64 {
            let trade = enriched(i + 1, "50000.00", "100", 1_000 + i as i64 * 100, true);
            if det.on_trade(&trade).is_some() {
                fired += 1;
            }
        }
        // All 20 trades fit inside one cooldown window.
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_confidence_composition_is_bounded_and_monotone() {
        let base = AbsorptionScore {
            efficiency: 0.1,
            efficiency_threshold: 0.5,
            passive_cover: 0.8,
            volume_weight: 1.0,
            refilled: false,
            velocity: 0.0,
        };
        let c = absorption_confidence(&base);
        assert!((0.0..=1.0).contains(&c));

        let mut refilled = base;
        refilled.refilled = true;
        assert!(absorption_confidence(&refilled) >= c);

        let mut worse_eff = base;
        worse_eff.efficiency = 0.45;
        assert!(absorption_confidence(&worse_eff) <= c);

        let degenerate = AbsorptionScore {
            efficiency: f64::NAN,
            efficiency_threshold: 0.5,
            passive_cover: f64::INFINITY,
            volume_weight: 1.0,
            refilled: true,
            velocity: 1.0,
        };
        let c = absorption_confidence(&degenerate);
        assert!(c.is_finite() && (0.0..=1.0).contains(&c));
    }

    #[test]
    fn test_zone_cleanup_drops_idle_state() {
        let mut det = detector(permissive_cfg());
        det.on_trade(&enriched(1, "50000.00", "100", 1_000, true));
        assert_eq!(det.zones.len(), 1);
        det.cleanup(1_000 + 2 * 60_000 + 1);
        assert!(det.zones.is_empty());
    }
}
