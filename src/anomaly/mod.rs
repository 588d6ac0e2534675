//! Anomaly monitor
//!
//! Runs beside the detectors on the same trade/depth events and flags market
//! conditions under which signals should not fire: flash moves, liquidity
//! voids, feed gaps, volatility regimes, and a grossly imbalanced book. A
//! critical anomaly raises the veto flag the signal coordinator consults
//! before emitting.

use crate::book::BookTop;
use crate::config::AnomalyConfig;
use crate::containers::{RingBuffer, Welford, WindowStats};
use crate::flow::EnrichedTrade;
use crate::metrics::MetricsRegistry;
use crate::num;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Feed silence that flags a gap (ms)
const API_GAP_MS: i64 = 5_000;

/// Feed silence that upgrades the gap to high severity (ms)
const API_GAP_HIGH_MS: i64 = 30_000;

/// Flash-move z-score thresholds
const FLASH_MOVE_Z: f64 = 3.0;
const FLASH_MOVE_Z_CRITICAL: f64 = 5.0;

/// Liquidity-void spread multiples over the configured normal spread
const VOID_SPREAD_MULT: f64 = 10.0;
const VOID_SPREAD_MULT_CRITICAL: f64 = 50.0;

/// Recent-over-long-run volatility ratio
const VOLATILITY_RATIO: f64 = 3.0;

/// Spread/mid ratio that flags book imbalance
const IMBALANCE_SPREAD_RATIO: f64 = 0.01;

/// Window for the recent volatility estimate (ms)
const RECENT_VOLATILITY_WINDOW_MS: i64 = 10_000;

/// Closed set of anomaly kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    FlashMove,
    LiquidityVoid,
    ApiGap,
    ExtremeVolatility,
    OrderbookImbalance,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::FlashMove => "flash_move",
            AnomalyKind::LiquidityVoid => "liquidity_void",
            AnomalyKind::ApiGap => "api_gap",
            AnomalyKind::ExtremeVolatility => "extreme_volatility",
            AnomalyKind::OrderbookImbalance => "orderbook_imbalance",
        }
    }
}

/// Severity levels, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Info,
}

/// An emitted anomaly record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub kind: AnomalyKind,
    pub severity: Severity,

    /// Event time of detection (ms)
    pub detected_at: i64,

    /// Price range observed while the condition formed
    pub affected_price_range: (Decimal, Decimal),

    pub recommended_action: String,

    pub metadata: serde_json::Value,
}

/// Shared critical-anomaly flag. The monitor raises it; the coordinator
/// reads it at emission time. One atomic keeps the stages share-nothing.
#[derive(Debug, Default)]
pub struct AnomalyVeto {
    critical_until: AtomicI64,
}

impl AnomalyVeto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the veto until `until_ms` (event time)
    pub fn raise(&self, until_ms: i64) {
        self.critical_until.fetch_max(until_ms, Ordering::Release);
    }

    pub fn critical_active(&self, now_ms: i64) -> bool {
        now_ms < self.critical_until.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
struct PricePoint {
    ts: i64,
    price: f64,
    spread: Option<f64>,
}

pub struct AnomalyMonitor {
    cfg: AnomalyConfig,

    history: RingBuffer<PricePoint>,

    /// Rolling price distribution over the bounded history
    price_stats: Welford,

    /// Long-run return dispersion (cumulative)
    long_run_returns: Welford,

    /// Recent return dispersion
    recent_returns: WindowStats,

    last_price: Option<f64>,
    last_event_ts: Option<i64>,

    last_emit: HashMap<AnomalyKind, (i64, Severity)>,

    veto: Arc<AnomalyVeto>,
    tx: broadcast::Sender<Anomaly>,
    metrics: Arc<MetricsRegistry>,
}

impl AnomalyMonitor {
    pub fn new(cfg: AnomalyConfig, veto: Arc<AnomalyVeto>, metrics: Arc<MetricsRegistry>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            history: RingBuffer::new(cfg.window_size),
            cfg,
            price_stats: Welford::new(),
            long_run_returns: Welford::new(),
            recent_returns: WindowStats::new(RECENT_VOLATILITY_WINDOW_MS),
            last_price: None,
            last_event_ts: None,
            last_emit: HashMap::new(),
            veto,
            tx,
            metrics,
        }
    }

    /// New receiver for anomaly records
    pub fn subscribe(&self) -> broadcast::Receiver<Anomaly> {
        self.tx.subscribe()
    }

    pub fn on_trade(&mut self, trade: &EnrichedTrade) {
        let ts = trade.timestamp();
        let price = num::to_f64(trade.price());
        let spread = trade.spread().map(num::to_f64);

        self.check_api_gap(ts);

        // Flash move is judged against the distribution *before* this print.
        let z = if self.price_stats.count() >= 10 && self.price_stats.std_dev() > f64::EPSILON {
            (price - self.price_stats.mean()) / self.price_stats.std_dev()
        } else {
            0.0
        };

        self.record(ts, price, spread);

        if z.abs() > FLASH_MOVE_Z {
            let severity = if z.abs() > FLASH_MOVE_Z_CRITICAL {
                Severity::Critical
            } else {
                Severity::High
            };
            self.emit(
                AnomalyKind::FlashMove,
                severity,
                ts,
                "Halt signal emission until price stabilizes".to_string(),
                serde_json::json!({ "z_score": z, "price": price }),
            );
        }

        if let Some(spread) = spread {
            self.check_spread(spread, ts);
        }

        self.check_volatility(ts);
    }

    pub fn on_depth(&mut self, top: &BookTop, ts: i64) {
        self.check_api_gap(ts);
        self.last_event_ts = Some(ts);

        if let Some(spread) = top.spread.map(num::to_f64) {
            self.check_spread(spread, ts);
        }
        if let (Some(spread), Some(mid)) = (top.spread, top.mid) {
            let ratio = num::to_f64(spread) / num::to_f64(mid).max(f64::EPSILON);
            if ratio > IMBALANCE_SPREAD_RATIO {
                self.emit(
                    AnomalyKind::OrderbookImbalance,
                    Severity::Medium,
                    ts,
                    "Use limit orders only; the book is thin".to_string(),
                    serde_json::json!({ "spread_over_mid": ratio }),
                );
            }
        }
    }

    fn record(&mut self, ts: i64, price: f64, spread: Option<f64>) {
        if let Some(evicted) = self.history.push(PricePoint { ts, price, spread }) {
            self.price_stats.remove(evicted.price);
        }
        self.price_stats.add(price);

        if let Some(last) = self.last_price {
            if last > 0.0 {
                let ret = (price - last) / last;
                self.long_run_returns.add(ret);
                self.recent_returns.push(ts, ret);
            }
        }
        self.last_price = Some(price);
        self.last_event_ts = Some(ts);
    }

    fn check_api_gap(&mut self, ts: i64) {
        let Some(last) = self.last_event_ts else {
            return;
        };
        let gap = ts - last;
        if gap > API_GAP_MS {
            let severity = if gap > API_GAP_HIGH_MS {
                Severity::High
            } else {
                Severity::Medium
            };
            self.emit(
                AnomalyKind::ApiGap,
                severity,
                ts,
                "Treat book and flow state as stale until the feed recovers".to_string(),
                serde_json::json!({ "gap_ms": gap }),
            );
        }
    }

    fn check_spread(&mut self, spread: f64, ts: i64) {
        let normal = num::to_f64(self.cfg.normal_spread);
        if normal <= 0.0 {
            return;
        }
        let mult = spread / normal;
        if mult > VOID_SPREAD_MULT {
            let severity = if mult > VOID_SPREAD_MULT_CRITICAL {
                Severity::Critical
            } else {
                Severity::High
            };
            self.emit(
                AnomalyKind::LiquidityVoid,
                severity,
                ts,
                "Liquidity vacuum: expect rapid price movement".to_string(),
                serde_json::json!({ "spread": spread, "normal_spread": normal, "multiple": mult }),
            );
        }
    }

    fn check_volatility(&mut self, ts: i64) {
        if self.long_run_returns.count() < 30 || self.recent_returns.len() < 5 {
            return;
        }
        let long_run = self.long_run_returns.std_dev();
        if long_run <= f64::EPSILON {
            return;
        }
        let recent = self.recent_returns.std_dev();
        if recent > VOLATILITY_RATIO * long_run {
            self.emit(
                AnomalyKind::ExtremeVolatility,
                Severity::Medium,
                ts,
                "Reduce size; volatility is far above its baseline".to_string(),
                serde_json::json!({ "recent_std": recent, "long_run_std": long_run }),
            );
        }
    }

    /// Emit with per-kind cooldown. A critical emission bypasses the
    /// cooldown as long as the previous emission was non-critical.
    fn emit(
        &mut self,
        kind: AnomalyKind,
        severity: Severity,
        ts: i64,
        recommended_action: String,
        mut metadata: serde_json::Value,
    ) {
        if let Some(&(last_ts, last_severity)) = self.last_emit.get(&kind) {
            let in_cooldown = ts - last_ts < self.cfg.anomaly_cooldown_ms;
            let escalation = severity == Severity::Critical && last_severity != Severity::Critical;
            if in_cooldown && !escalation {
                debug!(kind = kind.as_str(), "Anomaly suppressed by cooldown");
                return;
            }
        }
        self.last_emit.insert(kind, (ts, severity));

        if severity == Severity::Critical {
            self.veto.raise(ts + self.cfg.anomaly_cooldown_ms);
        }

        let (lo, hi) = self.observed_price_range();
        if let serde_json::Value::Object(map) = &mut metadata {
            map.insert(
                "history_span_ms".to_string(),
                serde_json::json!(self.history_span_ms()),
            );
            if let Some(avg) = self.average_spread() {
                map.insert("avg_spread".to_string(), serde_json::json!(avg));
            }
        }
        let anomaly = Anomaly {
            id: Uuid::new_v4(),
            kind,
            severity,
            detected_at: ts,
            affected_price_range: (lo, hi),
            recommended_action,
            metadata,
        };
        warn!(
            kind = kind.as_str(),
            severity = ?severity,
            detected_at = ts,
            "Market anomaly"
        );
        self.metrics.anomaly_emitted();
        let _ = self.tx.send(anomaly);
    }

    fn history_span_ms(&self) -> i64 {
        match (self.history.front(), self.history.back()) {
            (Some(first), Some(last)) => last.ts - first.ts,
            _ => 0,
        }
    }

    fn average_spread(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for point in self.history.iter() {
            if let Some(s) = point.spread {
                sum += s;
                n += 1;
            }
        }
        (n > 0).then(|| sum / n as f64)
    }

    fn observed_price_range(&self) -> (Decimal, Decimal) {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for point in self.history.iter() {
            lo = lo.min(point.price);
            hi = hi.max(point.price);
        }
        if lo > hi {
            (Decimal::ZERO, Decimal::ZERO)
        } else {
            (
                Decimal::try_from(lo).unwrap_or(Decimal::ZERO),
                Decimal::try_from(hi).unwrap_or(Decimal::ZERO),
            )
        }
    }
}
