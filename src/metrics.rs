//! Rejection and error counters
//!
//! Cheap atomic counters the hot path can bump without locking; the metrics
//! sink itself is an external collaborator that reads `snapshot()`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why a candidate (or an input event) was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientVolume,
    Cooldown,
    BelowConfidence,
    AnomalyCritical,
    ConfirmationTimeout,
    UnfavorableMove,
    IdGapResync,
    NotReady,
    MalformedEvent,
    OutOfOrder,
    QueueOverflow,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::InsufficientVolume => "insufficient_volume",
            RejectReason::Cooldown => "cooldown",
            RejectReason::BelowConfidence => "below_confidence",
            RejectReason::AnomalyCritical => "anomaly_critical",
            RejectReason::ConfirmationTimeout => "confirmation_timeout",
            RejectReason::UnfavorableMove => "unfavorable_move",
            RejectReason::IdGapResync => "id_gap_resync",
            RejectReason::NotReady => "not_ready",
            RejectReason::MalformedEvent => "malformed_event",
            RejectReason::OutOfOrder => "out_of_order",
            RejectReason::QueueOverflow => "queue_overflow",
        }
    }
}

/// Shared counter registry (one per engine instance)
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    insufficient_volume: AtomicU64,
    cooldown: AtomicU64,
    below_confidence: AtomicU64,
    anomaly_critical: AtomicU64,
    confirmation_timeout: AtomicU64,
    unfavorable_move: AtomicU64,
    id_gap_resync: AtomicU64,
    not_ready: AtomicU64,
    malformed_event: AtomicU64,
    out_of_order: AtomicU64,
    queue_overflow: AtomicU64,

    trades_processed: AtomicU64,
    diffs_applied: AtomicU64,
    candidates_submitted: AtomicU64,
    signals_confirmed: AtomicU64,
    anomalies_emitted: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::InsufficientVolume => &self.insufficient_volume,
            RejectReason::Cooldown => &self.cooldown,
            RejectReason::BelowConfidence => &self.below_confidence,
            RejectReason::AnomalyCritical => &self.anomaly_critical,
            RejectReason::ConfirmationTimeout => &self.confirmation_timeout,
            RejectReason::UnfavorableMove => &self.unfavorable_move,
            RejectReason::IdGapResync => &self.id_gap_resync,
            RejectReason::NotReady => &self.not_ready,
            RejectReason::MalformedEvent => &self.malformed_event,
            RejectReason::OutOfOrder => &self.out_of_order,
            RejectReason::QueueOverflow => &self.queue_overflow,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn trade_processed(&self) {
        self.trades_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn diff_applied(&self) {
        self.diffs_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candidate_submitted(&self) {
        self.candidates_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signal_confirmed(&self) {
        self.signals_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn anomaly_emitted(&self) {
        self.anomalies_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            insufficient_volume: self.insufficient_volume.load(Ordering::Relaxed),
            cooldown: self.cooldown.load(Ordering::Relaxed),
            below_confidence: self.below_confidence.load(Ordering::Relaxed),
            anomaly_critical: self.anomaly_critical.load(Ordering::Relaxed),
            confirmation_timeout: self.confirmation_timeout.load(Ordering::Relaxed),
            unfavorable_move: self.unfavorable_move.load(Ordering::Relaxed),
            id_gap_resync: self.id_gap_resync.load(Ordering::Relaxed),
            not_ready: self.not_ready.load(Ordering::Relaxed),
            malformed_event: self.malformed_event.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            queue_overflow: self.queue_overflow.load(Ordering::Relaxed),
            trades_processed: self.trades_processed.load(Ordering::Relaxed),
            diffs_applied: self.diffs_applied.load(Ordering::Relaxed),
            candidates_submitted: self.candidates_submitted.load(Ordering::Relaxed),
            signals_confirmed: self.signals_confirmed.load(Ordering::Relaxed),
            anomalies_emitted: self.anomalies_emitted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub insufficient_volume: u64,
    pub cooldown: u64,
    pub below_confidence: u64,
    pub anomaly_critical: u64,
    pub confirmation_timeout: u64,
    pub unfavorable_move: u64,
    pub id_gap_resync: u64,
    pub not_ready: u64,
    pub malformed_event: u64,
    pub out_of_order: u64,
    pub queue_overflow: u64,
    pub trades_processed: u64,
    pub diffs_applied: u64,
    pub candidates_submitted: u64,
    pub signals_confirmed: u64,
    pub anomalies_emitted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_increments_matching_counter() {
        let metrics = MetricsRegistry::new();
        metrics.reject(RejectReason::Cooldown);
        metrics.reject(RejectReason::Cooldown);
        metrics.reject(RejectReason::BelowConfidence);
        let snap = metrics.snapshot();
        assert_eq!(snap.cooldown, 2);
        assert_eq!(snap.below_confidence, 1);
        assert_eq!(snap.insufficient_volume, 0);
    }

    #[test]
    fn test_reason_labels_are_stable() {
        assert_eq!(RejectReason::IdGapResync.as_str(), "id_gap_resync");
        assert_eq!(RejectReason::AnomalyCritical.as_str(), "anomaly_critical");
    }
}
