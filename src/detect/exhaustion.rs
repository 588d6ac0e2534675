//! Exhaustion detector
//!
//! Finds zones where aggressive flow has chewed through the resting
//! liquidity: current passive depth sits far below its rolling average.
//! The spent side is done; signal direction is the opposite of the
//! aggressor (reversal).

use crate::config::ExhaustionConfig;
use crate::containers::{Welford, WindowStats};
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

#[derive(Debug)]
struct ZoneState {
    trades: VecDeque<(i64, Decimal, bool)>,
    buy_volume: Decimal,
    sell_volume: Decimal,

    /// Observed zone passive totals over the window
    passive_obs: WindowStats,

    /// Per-observation passive deltas (negative = depletion)
    depletion_rate: Welford,

    spread_obs: WindowStats,

    prev_passive: f64,

    /// Latest observation where passive grew (refill)
    last_refill_ts: Option<i64>,

    last_activity: i64,
}

impl ZoneState {
    fn new(window_ms: i64) -> Self {
        Self {
            trades: VecDeque::new(),
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            passive_obs: WindowStats::new(window_ms),
            depletion_rate: Welford::new(),
            spread_obs: WindowStats::new(window_ms),
            prev_passive: 0.0,
            last_refill_ts: None,
            last_activity: 0,
        }
    }

    fn add_trade(&mut self, ts: i64, qty: Decimal, is_buy: bool, window_ms: i64) {
        self.last_activity = ts;
        if is_buy {
            self.buy_volume += qty;
        } else {
            self.sell_volume += qty;
        }
        self.trades.push_back((ts, qty, is_buy));
        let cutoff = ts - window_ms;
        while let Some(&(old_ts, old_qty, old_buy)) = self.trades.front() {
            if old_ts >= cutoff {
                break;
            }
            self.trades.pop_front();
            if old_buy {
                self.buy_volume -= old_qty;
            } else {
                self.sell_volume -= old_qty;
            }
        }
    }

    fn observe_passive(&mut self, ts: i64, passive: f64) {
        if self.prev_passive > 0.0 {
            let delta = passive - self.prev_passive;
            self.depletion_rate.add(delta);
            if delta > 0.0 {
                self.last_refill_ts = Some(ts);
            }
        }
        self.prev_passive = passive;
        self.passive_obs.push(ts, passive);
    }

    fn aggressive_total(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }
}

/// Inputs to the pure confidence function
#[derive(Debug, Clone, Copy)]
pub struct ExhaustionScore {
    /// (avg - current) / avg, in [0, 1] once gated
    pub depletion_ratio: f64,
    pub depletion_threshold: f64,

    /// aggressive / (current_passive * exhaustion_ratio), capped at 1
    pub pressure: f64,

    /// Mean per-observation depletion normalized by the average passive;
    /// zero when the velocity feature is off
    pub velocity: f64,

    /// Spread widened during the window (only set when the spread feature is on)
    pub spread_widened: bool,
}

/// Pure, bounded confidence composition
pub fn exhaustion_confidence(s: &ExhaustionScore) -> f64 {
    let depth = if s.depletion_threshold < 1.0 {
        ((s.depletion_ratio - s.depletion_threshold) / (1.0 - s.depletion_threshold))
            .clamp(0.0, 1.0)
    } else {
        1.0
    };
    let mut score = 0.45 + 0.3 * depth + 0.2 * s.pressure + 0.1 * s.velocity;
    if s.spread_widened {
        score -= 0.15;
    }
    bounded_confidence(score)
}

pub struct ExhaustionDetector {
    spec: TickSpec,
    zone_ticks: i64,
    window_ms: i64,
    cfg: ExhaustionConfig,
    zones: HashMap<i64, ZoneState>,
    cooldown: CooldownGate,
    metrics: Arc<MetricsRegistry>,
}

impl ExhaustionDetector {
    pub fn new(
        spec: TickSpec,
        zone_ticks: i64,
        window_ms: i64,
        event_cooldown_ms: i64,
        cfg: ExhaustionConfig,
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
        // A single observation cannot show depletion against its own average.
        if state.passive_obs.len() < 3 {
            return None;
        }

        let avg = state.passive_obs.mean();
        let current = state.passive_obs.latest().unwrap_or(0.0);
        let depleted = avg - current;
        let depletion_ratio = depleted / avg.max(f64::EPSILON);
        if depletion_ratio <= 0.0 || depletion_ratio < self.cfg.depletion_ratio_threshold {
            return None;
        }
        if depleted < num::to_f64(self.cfg.depletion_volume_threshold) {
            return None;
        }

        let aggressive_f = num::to_f64(aggressive);
        if aggressive_f < current.max(f64::EPSILON) * self.cfg.passive_volume_exhaustion_ratio {
            return None;
        }

        if self.cfg.features.refill_gap {
            // A refill inside the last quarter window disproves exhaustion.
            if let Some(refill_ts) = state.last_refill_ts {
                if now - refill_ts <= self.window_ms / 4 {
                    return None;
                }
            }
        }

        let spread_widened = self.cfg.features.spread_adjustment && {
            let spread_now = state.spread_obs.latest().unwrap_or(0.0);
            let spread_avg = state.spread_obs.mean();
            spread_avg > 0.0 && spread_now > spread_avg * 2.0
        };

        let velocity = if self.cfg.features.depletion_velocity {
            (-state.depletion_rate.mean() / avg.max(f64::EPSILON) * 10.0).clamp(0.0, 1.0)
        } else {
            0.0
        };

        // The exhausted side is the one the aggressor was hitting; signal
        // the reversal, opposite the dominant aggressor.
        let side = if state.buy_volume > state.sell_volume {
            SignalSide::Sell
        } else {
            SignalSide::Buy
        };

        let score = ExhaustionScore {
            depletion_ratio,
            depletion_threshold: self.cfg.depletion_ratio_threshold,
            pressure: (aggressive_f
                / (current.max(f64::EPSILON) * self.cfg.passive_volume_exhaustion_ratio))
                .clamp(0.0, 1.0),
            velocity,
            spread_widened,
        };
        let confidence = exhaustion_confidence(&score);
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
            depletion_ratio,
            aggressive = %aggressive,
            current_passive = current,
            confidence,
            "Exhaustion candidate"
        );

        Some(SignalCandidate::new(
            DetectorSource::Exhaustion,
            side,
            trade.price(),
            zone,
            aggressive,
            Decimal::try_from(current).unwrap_or(Decimal::ZERO),
            false,
            confidence,
            now,
            serde_json::json!({
                "avg_passive": avg,
                "current_passive": current,
                "depletion_ratio": depletion_ratio,
                "buy_volume": num::to_f64(state.buy_volume),
                "sell_volume": num::to_f64(state.sell_volume),
            }),
        ))
    }
}

impl Detector for ExhaustionDetector {
    fn source(&self) -> DetectorSource {
        DetectorSource::Exhaustion
    }

    fn on_trade(&mut self, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        let zone = num::zone_id(self.spec.to_ticks(trade.price()), self.zone_ticks);
        let window_ms = self.window_ms;
        let state = self
            .zones
            .entry(zone)
            .or_insert_with(|| ZoneState::new(window_ms));

        state.add_trade(
            trade.timestamp(),
            trade.quantity(),
            trade.is_aggressive_buy(),
            window_ms,
        );
        state.observe_passive(
            trade.timestamp(),
            num::to_f64(trade.zone_passive_bid_volume) + num::to_f64(trade.zone_passive_ask_volume),
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
