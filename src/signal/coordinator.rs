//! Coordinator state machine
//!
//! Each submitted candidate becomes a pending detection keyed (zone, side).
//! Confirmation wants the move-then-revisit pattern: price first travels at
//! least `min_initial_move_ticks` in the signal direction, then returns to
//! within `max_revisit_ticks` of the initial price (still on the favorable
//! side) before the deadline. An unfavorable excursion of the same size
//! discards the pending entry; so does the deadline. At most one confirmed
//! signal is emitted per coordinated detection.

use crate::anomaly::AnomalyVeto;
use crate::config::EngineConfig;
use crate::detect::{DetectorSource, SignalCandidate, SignalSide};
use crate::flow::EnrichedTrade;
use crate::metrics::{MetricsRegistry, RejectReason};
use crate::num::TickSpec;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A coordinated detection that survived price confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedSignal {
    pub candidate: SignalCandidate,

    /// Event time of the confirming trade (ms)
    pub confirmed_at: i64,

    /// Price of the confirming trade
    pub final_price: Decimal,

    /// Every detector that contributed to the merged detection
    pub sources: Vec<DetectorSource>,

    /// Best favorable excursion seen before confirmation (ticks)
    pub peak_move_ticks: i64,
}

#[derive(Debug)]
struct PendingDetection {
    candidate: SignalCandidate,
    initial_ticks: i64,
    deadline: i64,
    moved: bool,
    peak_favorable: i64,
    sources: Vec<DetectorSource>,
}

enum Outcome {
    Keep,
    Confirm,
    Discard(RejectReason),
}

pub struct SignalCoordinator {
    spec: TickSpec,
    event_cooldown_ms: i64,
    confirmation_timeout_ms: i64,
    min_initial_move_ticks: i64,
    max_revisit_ticks: i64,

    pending: HashMap<(i64, SignalSide), PendingDetection>,

    /// Last confirmed emission per (zone, side)
    last_emitted: HashMap<(i64, SignalSide), i64>,

    veto: Arc<AnomalyVeto>,
    tx: broadcast::Sender<ConfirmedSignal>,
    metrics: Arc<MetricsRegistry>,
}

impl SignalCoordinator {
    pub fn new(cfg: &EngineConfig, veto: Arc<AnomalyVeto>, metrics: Arc<MetricsRegistry>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            spec: cfg.tick_spec(),
            event_cooldown_ms: cfg.event_cooldown_ms,
            confirmation_timeout_ms: cfg.confirmation_timeout_ms,
            min_initial_move_ticks: cfg.min_initial_move_ticks,
            max_revisit_ticks: cfg.max_revisit_ticks,
            pending: HashMap::new(),
            last_emitted: HashMap::new(),
            veto,
            tx,
            metrics,
        }
    }

    /// New receiver for confirmed signals (one per downstream consumer)
    pub fn subscribe(&self) -> broadcast::Receiver<ConfirmedSignal> {
        self.tx.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Accept a candidate from a detector.
    ///
    /// Candidates for a (zone, side) already pending within the cooldown are
    /// merged: the detection confirms once, crediting every source.
    pub fn submit_signal(&mut self, candidate: SignalCandidate, now_ms: i64) {
        let key = (candidate.zone_id, candidate.side);

        if let Some(&last) = self.last_emitted.get(&key) {
            if now_ms - last < self.event_cooldown_ms {
                debug!(zone = key.0, side = ?key.1, "Candidate inside emission cooldown");
                self.metrics.reject(RejectReason::Cooldown);
                return;
            }
        }

        if let Some(pending) = self.pending.get_mut(&key) {
            if now_ms - pending.candidate.detected_at < self.event_cooldown_ms {
                if !pending.sources.contains(&candidate.source) {
                    pending.sources.push(candidate.source);
                }
                // The merged record keeps the strongest confidence seen.
                if candidate.confidence > pending.candidate.confidence {
                    pending.candidate.confidence = candidate.confidence;
                }
                debug!(
                    zone = key.0,
                    side = ?key.1,
                    sources = pending.sources.len(),
                    "Merged concurrent detection"
                );
                return;
            }
            // Stale pending past its own cooldown: the fresh candidate wins.
        }

        self.metrics.candidate_submitted();
        let initial_ticks = self.spec.to_ticks(candidate.price);
        let source = candidate.source;
        self.pending.insert(
            key,
            PendingDetection {
                initial_ticks,
                deadline: now_ms + self.confirmation_timeout_ms,
                moved: false,
                peak_favorable: 0,
                sources: vec![source],
                candidate,
            },
        );
    }

    /// Advance every pending detection against a new trade
    pub fn on_trade(&mut self, trade: &EnrichedTrade) {
        let now = trade.timestamp();
        let price_ticks = self.spec.to_ticks(trade.price());

        let mut confirmed: Vec<(i64, SignalSide)> = Vec::new();
        let mut discarded: Vec<((i64, SignalSide), RejectReason)> = Vec::new();

        for (&key, pending) in self.pending.iter_mut() {
            match Self::step(
                pending,
                key.1,
                price_ticks,
                now,
                self.min_initial_move_ticks,
                self.max_revisit_ticks,
            ) {
                Outcome::Keep => {}
                Outcome::Confirm => confirmed.push(key),
                Outcome::Discard(reason) => discarded.push((key, reason)),
            }
        }

        for (key, reason) in discarded {
            self.pending.remove(&key);
            self.metrics.reject(reason);
        }

        for key in confirmed {
            let Some(pending) = self.pending.remove(&key) else {
                continue;
            };
            self.emit(pending, trade.price(), now, key);
        }
    }

    /// Timer sweep: drop pendings past their deadline
    pub fn sweep(&mut self, now_ms: i64) {
        let before = self.pending.len();
        self.pending.retain(|_, p| now_ms <= p.deadline);
        for _ in self.pending.len()..before {
            self.metrics.reject(RejectReason::ConfirmationTimeout);
        }
        let horizon = 2 * self.event_cooldown_ms;
        self.last_emitted.retain(|_, ts| now_ms - *ts <= horizon);
    }

    fn step(
        pending: &mut PendingDetection,
        side: SignalSide,
        price_ticks: i64,
        now: i64,
        min_move: i64,
        max_revisit: i64,
    ) -> Outcome {
        if now > pending.deadline {
            return Outcome::Discard(RejectReason::ConfirmationTimeout);
        }

        // Favorable direction is positive: up for buys, down for sells.
        let delta = match side {
            SignalSide::Buy => price_ticks - pending.initial_ticks,
            SignalSide::Sell => pending.initial_ticks - price_ticks,
        };

        if delta <= -min_move {
            return Outcome::Discard(RejectReason::UnfavorableMove);
        }

        if !pending.moved {
            if delta >= min_move {
                pending.moved = true;
                pending.peak_favorable = delta;
            }
            return Outcome::Keep;
        }

        pending.peak_favorable = pending.peak_favorable.max(delta);
        if (0..=max_revisit).contains(&delta) {
            return Outcome::Confirm;
        }
        Outcome::Keep
    }

    fn emit(&mut self, pending: PendingDetection, final_price: Decimal, now: i64, key: (i64, SignalSide)) {
        if self.veto.critical_active(now) {
            info!(
                zone = key.0,
                side = ?key.1,
                "Confirmed signal suppressed by critical anomaly"
            );
            self.metrics.reject(RejectReason::AnomalyCritical);
            return;
        }

        self.last_emitted.insert(key, now);
        self.metrics.signal_confirmed();

        let signal = ConfirmedSignal {
            confirmed_at: now,
            final_price,
            sources: pending.sources.clone(),
            peak_move_ticks: pending.peak_favorable,
            candidate: pending.candidate,
        };
        info!(
            zone = key.0,
            side = ?key.1,
            source = signal.candidate.source.as_str(),
            confidence = signal.candidate.confidence,
            final_price = %final_price,
            "Confirmed signal"
        );
        // Subscribers may come and go; an empty subscriber set is fine.
        let _ = self.tx.send(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectorSource;
    use crate::flow::types::AggressiveTrade;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.min_initial_move_ticks = 10;
        cfg.max_revisit_ticks = 5;
        cfg.confirmation_timeout_ms = 60_000;
        cfg.event_cooldown_ms = 15_000;
        cfg
    }

    fn coordinator() -> (SignalCoordinator, Arc<AnomalyVeto>, Arc<MetricsRegistry>) {
        let veto = Arc::new(AnomalyVeto::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let coord = SignalCoordinator::new(&config(), Arc::clone(&veto), Arc::clone(&metrics));
        (coord, veto, metrics)
    }

    fn candidate(source: DetectorSource, side: SignalSide, price: &str, zone: i64, ts: i64) -> SignalCandidate {
        SignalCandidate::new(
            source,
            side,
            d(price),
            zone,
            Decimal::from(100),
            Decimal::from(500),
            false,
            0.8,
            ts,
            serde_json::json!({}),
        )
    }

    fn trade_at(price: &str, ts: i64) -> EnrichedTrade {
        EnrichedTrade {
            trade: AggressiveTrade {
                trade_id: ts as u64,
                price: d(price),
                quantity: Decimal::ONE,
                timestamp: ts,
                buyer_is_maker: false,
                pair: "BTCUSDT".to_string(),
            },
            passive_bid_volume: Decimal::ZERO,
            passive_ask_volume: Decimal::ZERO,
            zone_passive_bid_volume: Decimal::ZERO,
            zone_passive_ask_volume: Decimal::ZERO,
            best_bid: None,
            best_ask: None,
            zone_data: None,
        }
    }

    #[test]
    fn test_move_and_revisit_confirms_buy() {
        let (mut coord, _, _) = coordinator();
        let mut rx = coord.subscribe();

        coord.submit_signal(
            candidate(DetectorSource::Absorption, SignalSide::Buy, "100.00", 1, 0),
            0,
        );
        // Move 12 ticks up, then revisit to 3 ticks above initial.
        coord.on_trade(&trade_at("100.12", 1_000));
        coord.on_trade(&trade_at("100.03", 2_000));

        let signal = rx.try_recv().expect("confirmed signal expected");
        assert_eq!(signal.candidate.side, SignalSide::Buy);
        assert_eq!(signal.final_price, d("100.03"));
        assert_eq!(signal.confirmed_at, 2_000);
        assert!(signal.peak_move_ticks >= 12);
        assert_eq!(coord.pending_count(), 0);
    }

    #[test]
    fn test_sell_side_confirmation_is_mirrored() {
        let (mut coord, _, _) = coordinator();
        let mut rx = coord.subscribe();

        coord.submit_signal(
            candidate(DetectorSource::Exhaustion, SignalSide::Sell, "100.00", 1, 0),
            0,
        );
        coord.on_trade(&trade_at("99.88", 1_000)); // 12 ticks down: favorable
        coord.on_trade(&trade_at("99.97", 2_000)); // back within 5 ticks below

        let signal = rx.try_recv().expect("confirmed signal expected");
        assert_eq!(signal.candidate.side, SignalSide::Sell);
    }

    #[test]
    fn test_no_move_times_out_and_sweep_cleans_up() {
        let (mut coord, _, metrics) = coordinator();
        let mut rx = coord.subscribe();

        coord.submit_signal(
            candidate(DetectorSource::Cvd, SignalSide::Buy, "100.00", 1, 0),
            0,
        );
        // Price never travels 10 ticks inside the timeout.
        for i in 1..=10 {
            coord.on_trade(&trade_at("100.04", i * 5_000));
        }
        assert_eq!(coord.pending_count(), 1);

        coord.sweep(61_000);
        assert_eq!(coord.pending_count(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().confirmation_timeout, 1);
    }

    #[test]
    fn test_unfavorable_move_discards() {
        let (mut coord, _, metrics) = coordinator();
        let mut rx = coord.subscribe();

        coord.submit_signal(
            candidate(DetectorSource::Absorption, SignalSide::Buy, "100.00", 1, 0),
            0,
        );
        coord.on_trade(&trade_at("99.90", 1_000)); // 10 ticks against
        assert_eq!(coord.pending_count(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().unfavorable_move, 1);
    }

    #[test]
    fn test_concurrent_detections_merge_and_confirm_once() {
        let (mut coord, _, _) = coordinator();
        let mut rx = coord.subscribe();

        coord.submit_signal(
            candidate(DetectorSource::Absorption, SignalSide::Buy, "100.00", 1, 0),
            0,
        );
        coord.submit_signal(
            candidate(DetectorSource::Cvd, SignalSide::Buy, "100.01", 1, 500),
            500,
        );
        assert_eq!(coord.pending_count(), 1);

        coord.on_trade(&trade_at("100.12", 1_000));
        coord.on_trade(&trade_at("100.02", 2_000));

        let signal = rx.try_recv().expect("one merged confirmation");
        assert!(signal.sources.contains(&DetectorSource::Absorption));
        assert!(signal.sources.contains(&DetectorSource::Cvd));
        assert!(rx.try_recv().is_err(), "exactly one emission");
    }

    #[test]
    fn test_emission_cooldown_blocks_followup_candidate() {
        let (mut coord, _, metrics) = coordinator();
        let mut rx = coord.subscribe();

        coord.submit_signal(
            candidate(DetectorSource::Absorption, SignalSide::Buy, "100.00", 1, 0),
            0,
        );
        coord.on_trade(&trade_at("100.12", 1_000));
        coord.on_trade(&trade_at("100.02", 2_000));
        assert!(rx.try_recv().is_ok());

        // Within the cooldown the same key is rejected outright.
        coord.submit_signal(
            candidate(DetectorSource::Exhaustion, SignalSide::Buy, "100.00", 1, 3_000),
            3_000,
        );
        assert_eq!(coord.pending_count(), 0);
        assert_eq!(metrics.snapshot().cooldown, 1);
    }

    #[test]
    fn test_critical_anomaly_vetoes_emission() {
        let (mut coord, veto, metrics) = coordinator();
        let mut rx = coord.subscribe();

        coord.submit_signal(
            candidate(DetectorSource::Absorption, SignalSide::Buy, "100.00", 1, 0),
            0,
        );
        veto.raise(5_000);

        coord.on_trade(&trade_at("100.12", 1_000));
        coord.on_trade(&trade_at("100.02", 2_000));

        assert!(rx.try_recv().is_err(), "veto must suppress emission");
        assert_eq!(metrics.snapshot().anomaly_critical, 1);
        assert_eq!(metrics.snapshot().signals_confirmed, 0);
    }

    #[test]
    fn test_confirming_trade_satisfies_move_revisit_condition() {
        // Property: for every confirmed signal there was a favorable move of
        // at least min_initial_move_ticks followed by a revisit within
        // max_revisit_ticks, at or before confirmed_at.
        let (mut coord, _, _) = coordinator();
        let mut rx = coord.subscribe();

        coord.submit_signal(
            candidate(DetectorSource::Accumulation, SignalSide::Buy, "50.00", 9, 0),
            0,
        );
        let path = [
            ("50.05", 1_000),  // +5: not yet moved
            ("50.11", 2_000),  // +11: moved
            ("50.20", 3_000),  // +20: peak
            ("50.09", 4_000),  // +9: outside revisit band, keep waiting
            ("50.04", 5_000),  // +4: revisit -> confirm
        ];
        for (p, ts) in path {
            coord.on_trade(&trade_at(p, ts));
        }

        let signal = rx.try_recv().expect("confirmed");
        assert_eq!(signal.confirmed_at, 5_000);
        assert_eq!(signal.final_price, d("50.04"));
        assert_eq!(signal.peak_move_ticks, 20);
    }
}
