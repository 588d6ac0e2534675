//! CVD confirmation detector
//!
//! Tracks cumulative volume delta (signed taker volume) over one or more
//! windows. The CVD slope is normalized against the rolling distribution of
//! recent slopes; momentum mode wants price and CVD agreeing, divergence
//! mode wants them fighting (price up + CVD down -> sell, price down + CVD
//! up -> buy), hybrid tries divergence first.

use crate::config::{CvdConfig, DetectionMode};
use crate::containers::{RollingCorrelation, RollingRegression, WindowStats};
use crate::detect::{
    bounded_confidence, CooldownGate, Detector, DetectorSource, SignalCandidate, SignalSide,
};
use crate::flow::EnrichedTrade;
use crate::metrics::{MetricsRegistry, RejectReason};
use crate::num::{self, TickSpec};
use rust_decimal::Decimal;
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Slope-distribution and volume-baseline memory relative to the window
const HISTORY_FACTOR: i64 = 5;

/// Slope observations required before z-scores are meaningful
const MIN_SLOPE_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy)]
struct CvdEvent {
    ts: i64,
    price: f64,
    qty: f64,
    is_buy: bool,
    institutional: bool,
}

/// One analysis window over the shared CVD series
struct CvdWindow {
    window_ms: i64,
    events: VecDeque<CvdEvent>,
    vol_sum: f64,
    buy_vol_sum: f64,
    institutional_count: u32,

    /// CVD against time
    regression: RollingRegression,

    /// Price against CVD
    correlation: RollingCorrelation,

    /// Distribution of recent slopes (z-score denominator)
    slope_history: WindowStats,

    /// Long-run volume-rate baseline for the surge bonus
    baseline_rate: WindowStats,
}

impl CvdWindow {
    fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            events: VecDeque::new(),
            vol_sum: 0.0,
            buy_vol_sum: 0.0,
            institutional_count: 0,
            regression: RollingRegression::new(window_ms),
            correlation: RollingCorrelation::new(window_ms),
            slope_history: WindowStats::new(window_ms * HISTORY_FACTOR),
            baseline_rate: WindowStats::new(window_ms * HISTORY_FACTOR),
        }
    }

    fn push(&mut self, ts: i64, price: f64, qty: f64, is_buy: bool, cvd: f64, institutional: bool) {
        self.events.push_back(CvdEvent {
            ts,
            price,
            qty,
            is_buy,
            institutional,
        });
        self.vol_sum += qty;
        if is_buy {
            self.buy_vol_sum += qty;
        }
        if institutional {
            self.institutional_count += 1;
        }
        self.regression.push(ts, cvd);
        self.correlation.push(ts, price, cvd);

        let cutoff = ts - self.window_ms;
        while let Some(front) = self.events.front() {
            if front.ts >= cutoff {
                break;
            }
            let old = self.events.pop_front().expect("front checked");
            self.vol_sum -= old.qty;
            if old.is_buy {
                self.buy_vol_sum -= old.qty;
            }
            if old.institutional {
                self.institutional_count = self.institutional_count.saturating_sub(1);
            }
        }
    }

    /// Price change across the window (last minus first in-window print)
    fn price_delta(&self) -> f64 {
        match (self.events.front(), self.events.back()) {
            (Some(first), Some(last)) => last.price - first.price,
            _ => 0.0,
        }
    }

    fn span_secs(&self) -> f64 {
        match (self.events.front(), self.events.back()) {
            (Some(first), Some(last)) if last.ts > first.ts => {
                (last.ts - first.ts) as f64 / 1000.0
            }
            _ => 0.0,
        }
    }

    fn trades_per_sec(&self) -> f64 {
        let span = self.span_secs();
        if span > 0.0 {
            self.events.len() as f64 / span
        } else {
            0.0
        }
    }

    fn vol_per_sec(&self) -> f64 {
        let span = self.span_secs();
        if span > 0.0 {
            self.vol_sum / span
        } else {
            0.0
        }
    }

    fn buy_share(&self) -> f64 {
        if self.vol_sum > 0.0 {
            self.buy_vol_sum / self.vol_sum
        } else {
            0.5
        }
    }
}

/// Inputs to the pure confidence function
#[derive(Debug, Clone, Copy)]
pub struct CvdScore {
    pub z_abs: f64,

    /// Price/CVD correlation (signed)
    pub correlation: f64,

    pub divergence: bool,

    pub volume_surge: bool,
    pub imbalance_aligned: bool,
    pub institutional: bool,
}

/// Pure, bounded confidence composition. The z-score maps through the
/// standard normal CDF so extreme slopes saturate instead of exploding.
pub fn cvd_confidence(s: &CvdScore) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("standard normal");
    let z_component = if s.z_abs.is_finite() {
        (2.0 * normal.cdf(s.z_abs) - 1.0).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let corr_component = if s.divergence {
        ((-s.correlation).clamp(0.0, 1.0) + (1.0 - s.correlation.abs()).clamp(0.0, 1.0)) / 2.0
    } else {
        s.correlation.clamp(0.0, 1.0)
    };
    let mut score = 0.6 * z_component + 0.3 * corr_component;
    if s.volume_surge {
        score += 0.1;
    }
    if s.imbalance_aligned {
        score += 0.05;
    }
    if s.institutional {
        score += 0.05;
    }
    bounded_confidence(score)
}

pub struct CvdDetector {
    spec: TickSpec,
    zone_ticks: i64,
    cfg: CvdConfig,
    windows: Vec<CvdWindow>,
    cvd: Decimal,
    cooldown: CooldownGate,
    metrics: Arc<MetricsRegistry>,
}

impl CvdDetector {
    pub fn new(
        spec: TickSpec,
        zone_ticks: i64,
        event_cooldown_ms: i64,
        cfg: CvdConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let windows = cfg
            .windows_sec
            .iter()
            .map(|&secs| CvdWindow::new(secs as i64 * 1000))
            .collect();
        Self {
            spec,
            zone_ticks,
            cfg,
            windows,
            cvd: Decimal::ZERO,
            cooldown: CooldownGate::new(event_cooldown_ms),
            metrics,
        }
    }

    pub fn cvd(&self) -> Decimal {
        self.cvd
    }

    /// Evaluate one window; returns (side, z, correlation, divergence)
    fn window_signal(
        window: &mut CvdWindow,
        cfg: &CvdConfig,
    ) -> Option<(SignalSide, f64, f64, bool)> {
        let slope = window.regression.slope()?;

        let enough_history = window.slope_history.len() >= MIN_SLOPE_SAMPLES;
        let mean = window.slope_history.mean();
        let sd = window.slope_history.std_dev();
        let ts = window.events.back().map(|e| e.ts)?;
        window.slope_history.push(ts, slope);

        if !enough_history {
            return None;
        }
        // Zero slope variance: no normalization possible, no signal.
        if sd <= f64::EPSILON {
            return None;
        }
        let z = (slope - mean) / sd;
        if !z.is_finite() {
            return None;
        }

        let corr = window.correlation.correlation()?;
        let price_delta = window.price_delta();
        let cvd_up = slope > 0.0;

        let divergence_side = if z.abs() >= cfg.min_z * 0.5 && corr <= cfg.divergence_threshold {
            if price_delta > 0.0 && !cvd_up {
                Some(SignalSide::Sell)
            } else if price_delta < 0.0 && cvd_up {
                Some(SignalSide::Buy)
            } else {
                None
            }
        } else {
            None
        };
        let momentum_side = if z.abs() >= cfg.min_z && corr >= cfg.strong_correlation_threshold {
            Some(if cvd_up { SignalSide::Buy } else { SignalSide::Sell })
        } else {
            None
        };

        let picked = match cfg.detection_mode {
            DetectionMode::Momentum => momentum_side.map(|s| (s, false)),
            DetectionMode::Divergence => divergence_side.map(|s| (s, true)),
            DetectionMode::Hybrid => divergence_side
                .map(|s| (s, true))
                .or(momentum_side.map(|s| (s, false))),
        };
        picked.map(|(side, diverging)| (side, z, corr, diverging))
    }

    fn evaluate(&mut self, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        let now = trade.timestamp();
        let mut best: Option<(SignalCandidate, f64)> = None;

        for (idx, window) in self.windows.iter_mut().enumerate() {
            let Some((side, z, corr, divergence)) = Self::window_signal(window, &self.cfg) else {
                continue;
            };

            // Activity floors apply to an otherwise-firing window.
            if window.trades_per_sec() < self.cfg.min_trades_per_sec
                || window.vol_per_sec() < self.cfg.min_vol_per_sec
            {
                self.metrics.reject(RejectReason::InsufficientVolume);
                continue;
            }

            let baseline = window.baseline_rate.mean();
            let volume_surge =
                baseline > 0.0 && window.vol_per_sec() >= baseline * self.cfg.volume_surge_multiplier;
            let buy_share = window.buy_share();
            let imbalance_aligned = match side {
                SignalSide::Buy => buy_share >= self.cfg.imbalance_threshold,
                SignalSide::Sell => (1.0 - buy_share) >= self.cfg.imbalance_threshold,
            };

            let score = CvdScore {
                z_abs: z.abs(),
                correlation: corr,
                divergence,
                volume_surge,
                imbalance_aligned,
                institutional: window.institutional_count > 0,
            };
            let confidence = cvd_confidence(&score);
            if confidence < self.cfg.final_confidence_required {
                self.metrics.reject(RejectReason::BelowConfidence);
                continue;
            }

            if best.as_ref().is_some_and(|(_, c)| *c >= confidence) {
                continue;
            }

            let zone = num::zone_id(self.spec.to_ticks(trade.price()), self.zone_ticks);
            let candidate = SignalCandidate::new(
                DetectorSource::Cvd,
                side,
                trade.price(),
                zone,
                Decimal::try_from(window.vol_sum).unwrap_or(Decimal::ZERO),
                trade.passive_bid_volume + trade.passive_ask_volume,
                false,
                confidence,
                now,
                serde_json::json!({
                    "window_sec": self.cfg.windows_sec[idx],
                    "z_score": z,
                    "correlation": corr,
                    "mode": if divergence { "divergence" } else { "momentum" },
                    "cvd": num::to_f64(self.cvd),
                }),
            );
            best = Some((candidate, confidence));
        }

        let (candidate, _) = best?;
        if !self.cooldown.ready(candidate.zone_id, candidate.side, now) {
            self.metrics.reject(RejectReason::Cooldown);
            return None;
        }
        self.cooldown.touch(candidate.zone_id, candidate.side, now);

        debug!(
            zone = candidate.zone_id,
            side = ?candidate.side,
            confidence = candidate.confidence,
            "CVD candidate"
        );
        Some(candidate)
    }
}

impl Detector for CvdDetector {
    fn source(&self) -> DetectorSource {
        DetectorSource::Cvd
    }

    fn on_trade(&mut self, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        self.cvd += trade.trade.signed_quantity();
        let ts = trade.timestamp();
        let price = num::to_f64(trade.price());
        let qty = num::to_f64(trade.quantity());
        let cvd = num::to_f64(self.cvd);
        let institutional = trade.quantity() >= self.cfg.institutional_threshold;

        for window in &mut self.windows {
            window.push(ts, price, qty, trade.is_aggressive_buy(), cvd, institutional);
            let rate = window.vol_per_sec();
            if rate > 0.0 {
                window.baseline_rate.push(ts, rate);
            }
        }

        self.evaluate(trade)
    }

    fn cleanup(&mut self, now_ms: i64) {
        let horizon = self
            .windows
            .iter()
            .map(|w| 2 * w.window_ms)
            .max()
            .unwrap_or(0);
        self.cooldown.cleanup(now_ms, horizon);
        for window in &mut self.windows {
            window.slope_history.evict(now_ms);
            window.baseline_rate.evict(now_ms);
        }
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

    fn cfg(mode: DetectionMode) -> CvdConfig {
        CvdConfig {
            windows_sec: vec![60],
            detection_mode: mode,
            min_z: 1.5,
            min_trades_per_sec: 0.5,
            min_vol_per_sec: 0.5,
            strong_correlation_threshold: 0.5,
            divergence_threshold: 0.3,
            volume_surge_multiplier: 2.0,
            imbalance_threshold: 0.65,
            institutional_threshold: Decimal::from(1_000),
            final_confidence_required: 0.5,
        }
    }

    fn detector(mode: DetectionMode) -> CvdDetector {
        CvdDetector::new(
            TickSpec::new(2, 8),
            10,
            15_000,
            cfg(mode),
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn enriched(id: u64, price: f64, qty: &str, ts: i64, buyer_is_maker: bool) -> EnrichedTrade {
        EnrichedTrade {
            trade: AggressiveTrade {
                trade_id: id,
                price: Decimal::try_from(price).unwrap(),
                quantity: d(qty),
                timestamp: ts,
                buyer_is_maker,
                pair: "BTCUSDT".to_string(),
            },
            passive_bid_volume: d("100"),
            passive_ask_volume: d("100"),
            zone_passive_bid_volume: d("100"),
            zone_passive_ask_volume: d("100"),
            best_bid: None,
            best_ask: None,
            zone_data: None,
        }
    }

    /// 45s of balanced churn, then a 10s one-sided buy burst with rising
    /// price and heavy prints at the end.
    #[test]
    fn test_momentum_burst_emits_buy() {
        let mut det = detector(DetectionMode::Momentum);
        let mut id = 0u64;
        let mut candidates = Vec::new();

        for i in 0..50i64 {
            id += 1;
            let ts = i * 900; // ~45s of warmup
            let buyer_is_maker = i % 2 == 0;
            let price = 85.0 + if buyer_is_maker { -0.01 } else { 0.01 };
            if let Some(c) = det.on_trade(&enriched(id, price, "2", ts, buyer_is_maker)) {
                candidates.push(c);
            }
        }
        for i in 0..25i64 {
            id += 1;
            let ts = 45_000 + i * 400;
            let price = 85.0 + 0.01 * i as f64;
            if let Some(c) = det.on_trade(&enriched(id, price, "5", ts, false)) {
                candidates.push(c);
            }
        }
        for i in 0..5i64 {
            id += 1;
            let ts = 55_000 + i * 400;
            let price = 85.25 + 0.01 * i as f64;
            if let Some(c) = det.on_trade(&enriched(id, price, "20", ts, false)) {
                candidates.push(c);
            }
        }

        assert!(!candidates.is_empty(), "momentum burst should emit");
        let c = candidates.last().unwrap();
        assert_eq!(c.side, SignalSide::Buy);
        assert!(c.confidence >= 0.5);
        assert_eq!(c.source, DetectorSource::Cvd);
    }

    /// Price grinds up while CVD turns sharply negative: bearish divergence.
    #[test]
    fn test_divergence_bearish_emits_sell() {
        let mut det = detector(DetectionMode::Divergence);
        let mut id = 0u64;
        let mut candidates = Vec::new();

        // Price rises 88.50 -> 88.55 on balanced flow.
        for i in 0..50i64 {
            id += 1;
            let ts = i * 900;
            let price = 88.50 + 0.001 * i as f64;
            if let Some(c) = det.on_trade(&enriched(id, price, "2", ts, i % 2 == 0)) {
                candidates.push(c);
            }
        }
        // Large sells hammer CVD down while price holds its highs.
        for i in 0..10i64 {
            id += 1;
            let ts = 45_000 + i * 200;
            let price = 88.55 + 0.001 * (i % 2) as f64;
            if let Some(c) = det.on_trade(&enriched(id, price, "30", ts, true)) {
                candidates.push(c);
            }
        }

        assert!(!candidates.is_empty(), "bearish divergence should emit");
        assert_eq!(candidates.last().unwrap().side, SignalSide::Sell);
    }

    /// Identical alternating trades: the slope distribution degenerates and
    /// no z-score can be formed.
    #[test]
    fn test_zero_variance_emits_nothing() {
        let mut det = detector(DetectionMode::Hybrid);
        for i in 0..200u64 {
            let trade = enriched(i + 1, 100.0, "1", i as i64 * 500, i % 2 == 0);
            assert!(det.on_trade(&trade).is_none());
        }
    }

    /// One-sided flow with enough samples must emit on that side in
    /// momentum mode.
    #[test]
    fn test_one_sided_flow_matches_direction() {
        let mut det = detector(DetectionMode::Momentum);
        let mut sides = Vec::new();
        for i in 0..120u64 {
            // Accelerating sell pressure: quadratically growing clip sizes
            // push CVD down ever faster, so late slopes sit far below the
            // slope history.
            let qty = format!("{}", 1 + (i * i) / 100);
            let price = 100.0 - 0.005 * i as f64;
            if let Some(c) = det.on_trade(&enriched(i + 1, price, &qty, i as i64 * 400, true)) {
                sides.push(c.side);
            }
        }
        assert!(!sides.is_empty(), "sustained one-sided flow should emit");
        assert!(sides.iter().all(|s| *s == SignalSide::Sell));
    }

    #[test]
    fn test_activity_floor_rejections_are_counted() {
        let metrics = Arc::new(MetricsRegistry::new());
        let mut config = cfg(DetectionMode::Momentum);
        config.min_trades_per_sec = 1_000.0; // unreachable floor
        let mut det = CvdDetector::new(
            TickSpec::new(2, 8),
            10,
            15_000,
            config,
            Arc::clone(&metrics),
        );

        for i in 0..120u64 {
            let qty = format!("{}", 1 + (i * i) / 100);
            let price = 100.0 - 0.005 * i as f64;
            assert!(det
                .on_trade(&enriched(i + 1, price, &qty, i as i64 * 400, true))
                .is_none());
        }
        assert!(metrics.snapshot().insufficient_volume > 0);
    }

    #[test]
    fn test_cvd_confidence_bounds() {
        let momentum = CvdScore {
            z_abs: 3.0,
            correlation: 0.9,
            divergence: false,
            volume_surge: true,
            imbalance_aligned: true,
            institutional: true,
        };
        let c = cvd_confidence(&momentum);
        assert!((0.0..=1.0).contains(&c));
        assert!(c > 0.8);

        let junk = CvdScore {
            z_abs: f64::NAN,
            correlation: f64::INFINITY,
            divergence: true,
            volume_surge: false,
            imbalance_aligned: false,
            institutional: false,
        };
        let c = cvd_confidence(&junk);
        assert!(c.is_finite() && (0.0..=1.0).contains(&c));
    }
}
