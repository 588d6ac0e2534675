//! Order-flow detectors
//!
//! A closed set of five detectors consumes enriched trades in arrival order:
//! absorption, exhaustion, accumulation, distribution, and CVD confirmation.
//! Each owns its state exclusively and shares only this contract: per-zone
//! cooldown keyed (zone, side), a minimum aggressive volume over the window,
//! zone granularity from the standard grid, and periodic state cleanup.
//! Candidates go to the signal coordinator, never straight downstream.

pub mod absorption;
pub mod accdist;
pub mod cvd;
pub mod exhaustion;

pub use absorption::AbsorptionDetector;
pub use accdist::{ZoneKind, ZoneLifecycleDetector};
pub use cvd::CvdDetector;
pub use exhaustion::ExhaustionDetector;

use crate::flow::EnrichedTrade;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Which detector produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorSource {
    Absorption,
    Exhaustion,
    Accumulation,
    Distribution,
    Cvd,
}

impl DetectorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectorSource::Absorption => "absorption",
            DetectorSource::Exhaustion => "exhaustion",
            DetectorSource::Accumulation => "accumulation",
            DetectorSource::Distribution => "distribution",
            DetectorSource::Cvd => "cvd",
        }
    }
}

/// Signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Buy,
    Sell,
}

impl SignalSide {
    pub fn opposite(self) -> Self {
        match self {
            SignalSide::Buy => SignalSide::Sell,
            SignalSide::Sell => SignalSide::Buy,
        }
    }
}

/// A detection before coordination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCandidate {
    pub id: Uuid,
    pub source: DetectorSource,
    pub side: SignalSide,
    pub price: Decimal,

    /// Zone on the standard base grid (shared by all detectors so the
    /// coordinator can merge concurrent detections)
    pub zone_id: i64,

    pub aggressive_volume: Decimal,
    pub passive_volume: Decimal,

    /// Passive liquidity was observed refilling at the signal side
    pub refilled: bool,

    /// Always finite, in [0, 1]
    pub confidence: f64,

    /// Event time of the detection (ms)
    pub detected_at: i64,

    pub metadata: serde_json::Value,
}

impl SignalCandidate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: DetectorSource,
        side: SignalSide,
        price: Decimal,
        zone_id: i64,
        aggressive_volume: Decimal,
        passive_volume: Decimal,
        refilled: bool,
        confidence: f64,
        detected_at: i64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            side,
            price,
            zone_id,
            aggressive_volume,
            passive_volume,
            refilled,
            confidence: bounded_confidence(confidence),
            detected_at,
            metadata,
        }
    }
}

/// Clamp a raw score into [0, 1]; NaN and infinities become 0 so they can
/// never reach a candidate
pub fn bounded_confidence(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Per-(zone, side) cooldown gate shared by detectors and the coordinator
#[derive(Debug)]
pub struct CooldownGate {
    cooldown_ms: i64,
    last: HashMap<(i64, SignalSide), i64>,
}

impl CooldownGate {
    pub fn new(cooldown_ms: i64) -> Self {
        Self {
            cooldown_ms,
            last: HashMap::new(),
        }
    }

    /// Whether this key may fire at `now_ms`
    pub fn ready(&self, zone: i64, side: SignalSide, now_ms: i64) -> bool {
        match self.last.get(&(zone, side)) {
            Some(&ts) => now_ms - ts >= self.cooldown_ms,
            None => true,
        }
    }

    /// Record a firing
    pub fn touch(&mut self, zone: i64, side: SignalSide, now_ms: i64) {
        self.last.insert((zone, side), now_ms);
    }

    /// Drop keys idle past `max_age_ms`
    pub fn cleanup(&mut self, now_ms: i64, max_age_ms: i64) {
        self.last.retain(|_, ts| now_ms - *ts <= max_age_ms);
    }
}

/// The contract every detector implements. The pipeline invokes `on_trade`
/// synchronously per enriched trade and forwards any candidate to the
/// coordinator's `submit_signal`; `cleanup` runs on the shared sweep timer.
pub trait Detector: Send {
    fn source(&self) -> DetectorSource;

    fn on_trade(&mut self, trade: &EnrichedTrade) -> Option<SignalCandidate>;

    /// Drop zones with no activity within two windows
    fn cleanup(&mut self, now_ms: i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_confidence_handles_non_finite() {
        assert_eq!(bounded_confidence(f64::NAN), 0.0);
        assert_eq!(bounded_confidence(f64::INFINITY), 0.0);
        assert_eq!(bounded_confidence(-0.5), 0.0);
        assert_eq!(bounded_confidence(1.5), 1.0);
        assert_eq!(bounded_confidence(0.42), 0.42);
    }

    #[test]
    fn test_cooldown_gate() {
        let mut gate = CooldownGate::new(1_000);
        assert!(gate.ready(7, SignalSide::Buy, 0));
        gate.touch(7, SignalSide::Buy, 0);
        assert!(!gate.ready(7, SignalSide::Buy, 500));
        // Opposite side and other zones are independent keys.
        assert!(gate.ready(7, SignalSide::Sell, 500));
        assert!(gate.ready(8, SignalSide::Buy, 500));
        assert!(gate.ready(7, SignalSide::Buy, 1_000));
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(SignalSide::Buy.opposite(), SignalSide::Sell);
        assert_eq!(SignalSide::Sell.opposite(), SignalSide::Buy);
    }
}
