//! Authoritative order-book state for one trading pair
//!
//! Levels are keyed by integer price ticks to avoid floating-point drift.
//! Two ordered side indexes give O(log n) writes and O(1) best-quote reads.
//! Diff application follows the exchange sequencing contract:
//! - stale diff (`final_update_id <= last_update_id`): ignored
//! - first diff after a snapshot must straddle `last_update_id + 1`
//! - every later diff must chain exactly; a gap is a sync failure and the
//!   caller must resync
//!
//! Quote-ordering rescue: a nonzero write on one side clears crossed levels
//! of the other side (the later-arriving side wins), so `best_bid <= best_ask`
//! holds after every apply.

use crate::config::BookConfig;
use crate::error::SyncError;
use crate::health::{ComponentHealth, HealthStatus};
use crate::num::TickSpec;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

use super::level::PassiveLevel;

/// Parsed depth snapshot (wire strings already validated by the caller)
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub last_update_id: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Parsed incremental depth update
#[derive(Debug, Clone)]
pub struct BookDiff {
    pub first_update_id: i64,
    pub final_update_id: i64,
    pub event_time: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Book lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    /// No snapshot applied yet (startup or resync in progress)
    AwaitingSnapshot,
    Ready,
    /// Circuit breaker open; preprocessing is paused until re-initialization
    Degraded,
}

/// Best-quote summary with documented empty-side sentinels:
/// bid -> -inf, ask -> +inf
#[derive(Debug, Clone, Copy)]
pub struct BookTop {
    pub bid: f64,
    pub ask: f64,
    pub spread: Option<Decimal>,
    pub mid: Option<Decimal>,
}

/// Result of a banded sum around a center price
#[derive(Debug, Clone, Copy)]
pub struct BandSum {
    pub bid: Decimal,
    pub ask: Decimal,
    pub spread: Option<Decimal>,
    pub mid_price: Option<Decimal>,
}

#[derive(Debug)]
pub struct OrderBookEngine {
    symbol: String,
    spec: TickSpec,
    cfg: BookConfig,

    levels: BTreeMap<i64, PassiveLevel>,
    bid_index: BTreeSet<i64>,
    ask_index: BTreeSet<i64>,

    last_update_id: i64,
    state: BookState,
    first_diff_applied: bool,

    /// Timestamps of recent apply failures (sliding window)
    apply_failures: VecDeque<i64>,

    /// Event time of the last applied update (ms)
    last_update_ms: i64,
}

impl OrderBookEngine {
    pub fn new(symbol: impl Into<String>, spec: TickSpec, cfg: BookConfig) -> Self {
        Self {
            symbol: symbol.into(),
            spec,
            cfg,
            levels: BTreeMap::new(),
            bid_index: BTreeSet::new(),
            ask_index: BTreeSet::new(),
            last_update_id: 0,
            state: BookState::AwaitingSnapshot,
            first_diff_applied: false,
            apply_failures: VecDeque::new(),
            last_update_ms: 0,
        }
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == BookState::Ready
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Copy of a level (tests and refill tracking)
    pub fn level_at(&self, price: Decimal) -> Option<PassiveLevel> {
        self.levels.get(&self.spec.to_ticks(price)).cloned()
    }

    /// Populate from a depth snapshot and enter READY state
    pub fn initialize_from_snapshot(&mut self, snapshot: &BookSnapshot, now_ms: i64) {
        self.levels.clear();
        self.bid_index.clear();
        self.ask_index.clear();
        self.apply_failures.clear();

        for &(price, qty) in &snapshot.bids {
            if qty > Decimal::ZERO {
                self.write_bid(self.spec.to_ticks(price), qty, now_ms);
            }
        }
        for &(price, qty) in &snapshot.asks {
            if qty > Decimal::ZERO {
                self.write_ask(self.spec.to_ticks(price), qty, now_ms);
            }
        }

        self.last_update_id = snapshot.last_update_id;
        self.last_update_ms = now_ms;
        self.first_diff_applied = false;
        self.state = BookState::Ready;

        debug!(
            symbol = %self.symbol,
            last_update_id = self.last_update_id,
            bid_levels = self.bid_index.len(),
            ask_levels = self.ask_index.len(),
            "Order book initialized from snapshot"
        );
    }

    /// Drop back to AwaitingSnapshot; the caller re-fetches a snapshot and
    /// replays buffered diffs
    pub fn invalidate(&mut self) {
        self.state = BookState::AwaitingSnapshot;
        self.first_diff_applied = false;
    }

    /// Apply one incremental update, validating id continuity.
    ///
    /// Returns `Ok(false)` for a stale diff (ignored), `Ok(true)` when
    /// applied. A continuity violation leaves the book untouched and the
    /// caller must resync.
    pub fn apply_diff(&mut self, diff: &BookDiff) -> Result<bool, SyncError> {
        match self.state {
            BookState::AwaitingSnapshot => return Err(SyncError::NotReady),
            BookState::Degraded => {
                return Err(SyncError::CircuitOpen {
                    failures: self.apply_failures.len(),
                    window_ms: self.cfg.error_window_ms,
                })
            }
            BookState::Ready => {}
        }

        if diff.final_update_id <= self.last_update_id {
            debug!(
                symbol = %self.symbol,
                final_update_id = diff.final_update_id,
                last_update_id = self.last_update_id,
                "Ignoring stale depth diff"
            );
            return Ok(false);
        }

        if !self.first_diff_applied {
            // First diff after snapshot must straddle last_update_id + 1
            let next = self.last_update_id + 1;
            if diff.first_update_id > next || diff.final_update_id < next {
                return Err(SyncError::SnapshotNotCovered {
                    snapshot_id: self.last_update_id,
                    first: diff.first_update_id,
                    last: diff.final_update_id,
                });
            }
        } else if diff.first_update_id != self.last_update_id + 1 {
            return Err(SyncError::IdGap {
                expected: self.last_update_id + 1,
                got: diff.first_update_id,
            });
        }

        for &(price, qty) in &diff.bids {
            self.write_bid(self.spec.to_ticks(price), qty, diff.event_time);
        }
        for &(price, qty) in &diff.asks {
            self.write_ask(self.spec.to_ticks(price), qty, diff.event_time);
        }

        self.last_update_id = diff.final_update_id;
        self.last_update_ms = diff.event_time;
        self.first_diff_applied = true;

        debug_assert!(self.ordering_holds(), "bid/ask ordering violated");
        Ok(true)
    }

    /// Count an apply failure; opens the circuit breaker when the sliding
    /// window overflows `max_error_rate`
    pub fn record_apply_failure(&mut self, now_ms: i64) {
        self.apply_failures.push_back(now_ms);
        let cutoff = now_ms - self.cfg.error_window_ms;
        while self
            .apply_failures
            .front()
            .is_some_and(|&ts| ts < cutoff)
        {
            self.apply_failures.pop_front();
        }
        if self.apply_failures.len() > self.cfg.max_error_rate {
            warn!(
                symbol = %self.symbol,
                failures = self.apply_failures.len(),
                window_ms = self.cfg.error_window_ms,
                "Apply-error circuit breaker tripped; book degraded"
            );
            self.state = BookState::Degraded;
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bid_index.iter().next_back().map(|&t| self.spec.to_price(t))
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.ask_index.iter().next().map(|&t| self.spec.to_price(t))
    }

    /// `best_ask - best_bid`; None when either side is empty
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    /// Midpoint of the best quotes. With a one-sided book, falls back to the
    /// midpoint of the populated price extremes.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::from(2)),
            _ => {
                let lo = self.levels.keys().next()?;
                let hi = self.levels.keys().next_back()?;
                Some((self.spec.to_price(*lo) + self.spec.to_price(*hi)) / Decimal::from(2))
            }
        }
    }

    /// Best-quote summary with -inf/+inf sentinels for empty sides
    pub fn top(&self) -> BookTop {
        BookTop {
            bid: self
                .best_bid()
                .map(crate::num::to_f64)
                .unwrap_or(f64::NEG_INFINITY),
            ask: self
                .best_ask()
                .map(crate::num::to_f64)
                .unwrap_or(f64::INFINITY),
            spread: self.spread(),
            mid: self.mid_price(),
        }
    }

    /// Sum bid and ask quantities across every populated level within
    /// `center ± ticks` grid steps (inclusive)
    pub fn sum_band(&self, center: Decimal, ticks: i64) -> BandSum {
        let center_ticks = self.spec.to_ticks(center);
        let (bid, ask) = self.sum_ticks_range(center_ticks - ticks, center_ticks + ticks);
        BandSum {
            bid,
            ask,
            spread: self.spread(),
            mid_price: self.mid_price(),
        }
    }

    /// Banded sum over an inclusive tick range (zone queries)
    pub fn sum_ticks_range(&self, lo: i64, hi: i64) -> (Decimal, Decimal) {
        let mut bid = Decimal::ZERO;
        let mut ask = Decimal::ZERO;
        for level in self.levels.range(lo..=hi).map(|(_, l)| l) {
            bid += level.bid_qty;
            ask += level.ask_qty;
        }
        (bid, ask)
    }

    /// Drop levels past `max_price_distance` of mid and enforce `max_levels`
    /// per side (outermost levels go first)
    pub fn prune(&mut self) {
        let Some(mid) = self.mid_price() else {
            return;
        };
        let max_dist =
            mid * Decimal::try_from(self.cfg.max_price_distance).unwrap_or(Decimal::ONE);
        if max_dist > Decimal::ZERO {
            let lo = self.spec.to_ticks(mid - max_dist);
            let hi = self.spec.to_ticks(mid + max_dist);
            let far: Vec<i64> = self
                .levels
                .keys()
                .copied()
                .filter(|t| *t < lo || *t > hi)
                .collect();
            for ticks in far {
                self.remove_level(ticks);
            }
        }

        while self.bid_index.len() > self.cfg.max_levels {
            let lowest = self.bid_index.iter().next().copied();
            let Some(lowest) = lowest else { break };
            self.remove_level(lowest);
        }
        while self.ask_index.len() > self.cfg.max_levels {
            let highest = self.ask_index.iter().next_back().copied();
            let Some(highest) = highest else { break };
            self.remove_level(highest);
        }
    }

    pub fn health(&self, now_ms: i64) -> ComponentHealth {
        let (status, reason) = match self.state {
            BookState::AwaitingSnapshot => (
                HealthStatus::Degraded,
                Some("awaiting depth snapshot".to_string()),
            ),
            BookState::Degraded => (
                HealthStatus::Error,
                Some("apply-error circuit breaker open".to_string()),
            ),
            BookState::Ready => {
                let age = now_ms - self.last_update_ms;
                if age > self.cfg.stale_threshold_ms {
                    (
                        HealthStatus::Degraded,
                        Some(format!("book is stale ({}ms old)", age)),
                    )
                } else {
                    (HealthStatus::Ok, None)
                }
            }
        };
        ComponentHealth {
            component: "order_book",
            status,
            reason,
        }
    }

    fn ordering_holds(&self) -> bool {
        match (self.bid_index.iter().next_back(), self.ask_index.iter().next()) {
            (Some(&b), Some(&a)) => b <= a,
            _ => true,
        }
    }

    fn write_bid(&mut self, ticks: i64, qty: Decimal, now_ms: i64) {
        if qty > Decimal::ZERO {
            // Newer side wins: clear any crossed ask at or below this price.
            let crossed: Vec<i64> = self
                .ask_index
                .range(..=ticks)
                .copied()
                .collect();
            for t in crossed {
                if t == ticks {
                    continue; // same-price exclusivity handled by the level itself
                }
                if let Some(level) = self.levels.get_mut(&t) {
                    level.clear_ask();
                    self.ask_index.remove(&t);
                    if level.is_empty() {
                        self.levels.remove(&t);
                    }
                }
            }
        } else if !self.levels.contains_key(&ticks) {
            // Zero write at a nonexistent level is a no-op.
            return;
        }

        let price = self.spec.to_price(ticks);
        let level = self
            .levels
            .entry(ticks)
            .or_insert_with(|| PassiveLevel::new(price, now_ms));
        level.set_bid(qty, now_ms);
        self.sync_indexes(ticks);
    }

    fn write_ask(&mut self, ticks: i64, qty: Decimal, now_ms: i64) {
        if qty > Decimal::ZERO {
            let crossed: Vec<i64> = self
                .bid_index
                .range(ticks..)
                .copied()
                .collect();
            for t in crossed {
                if t == ticks {
                    continue;
                }
                if let Some(level) = self.levels.get_mut(&t) {
                    level.clear_bid();
                    self.bid_index.remove(&t);
                    if level.is_empty() {
                        self.levels.remove(&t);
                    }
                }
            }
        } else if !self.levels.contains_key(&ticks) {
            return;
        }

        let price = self.spec.to_price(ticks);
        let level = self
            .levels
            .entry(ticks)
            .or_insert_with(|| PassiveLevel::new(price, now_ms));
        level.set_ask(qty, now_ms);
        self.sync_indexes(ticks);
    }

    fn sync_indexes(&mut self, ticks: i64) {
        match self.levels.get(&ticks) {
            Some(level) => {
                if level.bid_qty > Decimal::ZERO {
                    self.bid_index.insert(ticks);
                } else {
                    self.bid_index.remove(&ticks);
                }
                if level.ask_qty > Decimal::ZERO {
                    self.ask_index.insert(ticks);
                } else {
                    self.ask_index.remove(&ticks);
                }
                if level.is_empty() {
                    self.levels.remove(&ticks);
                }
            }
            None => {
                self.bid_index.remove(&ticks);
                self.ask_index.remove(&ticks);
            }
        }
    }

    fn remove_level(&mut self, ticks: i64) {
        self.levels.remove(&ticks);
        self.bid_index.remove(&ticks);
        self.ask_index.remove(&ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ready_book() -> OrderBookEngine {
        let mut book = OrderBookEngine::new("BTCUSDT", TickSpec::new(2, 8), BookConfig::default());
        book.initialize_from_snapshot(
            &BookSnapshot {
                last_update_id: 100,
                bids: vec![],
                asks: vec![],
            },
            0,
        );
        book
    }

    fn diff(first: i64, last: i64, bids: Vec<(&str, &str)>, asks: Vec<(&str, &str)>) -> BookDiff {
        BookDiff {
            first_update_id: first,
            final_update_id: last,
            event_time: 1_000,
            bids: bids.into_iter().map(|(p, q)| (d(p), d(q))).collect(),
            asks: asks.into_iter().map(|(p, q)| (d(p), d(q))).collect(),
        }
    }

    #[test]
    fn test_bid_ask_separation_at_same_price() {
        let mut book = ready_book();
        book.apply_diff(&diff(101, 101, vec![], vec![("50.00", "100")]))
            .unwrap();
        book.apply_diff(&diff(102, 102, vec![("50.00", "200")], vec![]))
            .unwrap();

        let level = book.level_at(d("50.00")).unwrap();
        assert_eq!(level.bid_qty, d("200"));
        assert_eq!(level.ask_qty, Decimal::ZERO);
        assert_eq!(level.added_bid, d("200"));
        assert_eq!(level.added_ask, Decimal::ZERO);
        assert_eq!(book.best_bid(), Some(d("50.00")));
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn test_quote_inversion_rescue() {
        let mut book = ready_book();
        book.apply_diff(&diff(
            101,
            101,
            vec![("50.00", "100")],
            vec![("50.10", "200")],
        ))
        .unwrap();

        // Bid takes over 50.10; the stale ask there is cleared by the newer side.
        book.apply_diff(&diff(
            102,
            102,
            vec![("50.10", "150")],
            vec![("50.10", "0")],
        ))
        .unwrap();

        assert_eq!(book.best_bid(), Some(d("50.10")));
        assert_eq!(book.best_ask(), None);
        let top = book.top();
        assert_eq!(top.ask, f64::INFINITY);
        assert!(top.spread.is_none());
    }

    #[test]
    fn test_crossing_bid_clears_lower_asks() {
        let mut book = ready_book();
        book.apply_diff(&diff(
            101,
            101,
            vec![],
            vec![("50.05", "10"), ("50.10", "20")],
        ))
        .unwrap();
        book.apply_diff(&diff(102, 102, vec![("50.07", "5")], vec![]))
            .unwrap();

        // The ask below the new bid is gone, the one above survives.
        assert_eq!(book.best_bid(), Some(d("50.07")));
        assert_eq!(book.best_ask(), Some(d("50.10")));
        assert!(book.spread().unwrap() >= Decimal::ZERO);
    }

    #[test]
    fn test_zero_write_at_missing_level_is_noop() {
        let mut book = ready_book();
        book.apply_diff(&diff(101, 101, vec![("49.00", "0")], vec![]))
            .unwrap();
        assert_eq!(book.level_count(), 0);
    }

    #[test]
    fn test_insert_then_zero_restores_book() {
        let mut book = ready_book();
        book.apply_diff(&diff(101, 101, vec![("49.50", "100")], vec![]))
            .unwrap();
        assert_eq!(book.level_count(), 1);
        book.apply_diff(&diff(102, 102, vec![("49.50", "0")], vec![]))
            .unwrap();
        assert_eq!(book.level_count(), 0);
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn test_first_diff_must_cover_snapshot_id() {
        let mut book = ready_book();
        // Snapshot id 100: diff starting past 101 is a gap.
        let err = book
            .apply_diff(&diff(105, 106, vec![("50.00", "1")], vec![]))
            .unwrap_err();
        assert!(matches!(err, SyncError::SnapshotNotCovered { .. }));

        // A straddling diff is fine.
        assert!(book
            .apply_diff(&diff(99, 101, vec![("50.00", "1")], vec![]))
            .unwrap());
    }

    #[test]
    fn test_subsequent_diffs_must_chain() {
        let mut book = ready_book();
        book.apply_diff(&diff(101, 105, vec![("50.00", "1")], vec![]))
            .unwrap();
        let err = book
            .apply_diff(&diff(108, 110, vec![("50.00", "2")], vec![]))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::IdGap {
                expected: 106,
                got: 108
            }
        ));
    }

    #[test]
    fn test_stale_diff_is_ignored() {
        let mut book = ready_book();
        book.apply_diff(&diff(101, 105, vec![("50.00", "1")], vec![]))
            .unwrap();
        assert!(!book
            .apply_diff(&diff(90, 105, vec![("50.00", "99")], vec![]))
            .unwrap());
        assert_eq!(book.level_at(d("50.00")).unwrap().bid_qty, d("1"));
    }

    #[test]
    fn test_sum_band_zero_ticks_is_exact_level() {
        let mut book = ready_book();
        book.apply_diff(&diff(
            101,
            101,
            vec![("50.00", "7"), ("49.99", "3")],
            vec![("50.02", "11")],
        ))
        .unwrap();

        let band = book.sum_band(d("50.00"), 0);
        assert_eq!(band.bid, d("7"));
        assert_eq!(band.ask, Decimal::ZERO);

        let wide = book.sum_band(d("50.00"), 2);
        assert_eq!(wide.bid, d("10"));
        assert_eq!(wide.ask, d("11"));
    }

    #[test]
    fn test_mid_price_one_sided_fallback() {
        let mut book = ready_book();
        book.apply_diff(&diff(
            101,
            101,
            vec![("49.00", "1"), ("50.00", "2")],
            vec![],
        ))
        .unwrap();
        assert_eq!(book.mid_price(), Some(d("49.50")));
    }

    #[test]
    fn test_circuit_breaker_opens_on_error_rate() {
        let mut book = ready_book();
        for i in 0..=BookConfig::default().max_error_rate {
            book.record_apply_failure(i as i64 * 10);
        }
        assert_eq!(book.state(), BookState::Degraded);
        let err = book
            .apply_diff(&diff(101, 102, vec![], vec![]))
            .unwrap_err();
        assert!(matches!(err, SyncError::CircuitOpen { .. }));
    }

    #[test]
    fn test_not_ready_before_snapshot() {
        let mut book =
            OrderBookEngine::new("BTCUSDT", TickSpec::new(2, 8), BookConfig::default());
        let err = book
            .apply_diff(&diff(1, 2, vec![], vec![]))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotReady));
    }

    #[test]
    fn test_prune_drops_far_levels() {
        let mut cfg = BookConfig::default();
        cfg.max_price_distance = 0.01; // 1% of mid
        let mut book = OrderBookEngine::new("BTCUSDT", TickSpec::new(2, 8), cfg);
        book.initialize_from_snapshot(
            &BookSnapshot {
                last_update_id: 1,
                bids: vec![(d("100.00"), d("1")), (d("50.00"), d("1"))],
                asks: vec![(d("100.10"), d("1")), (d("200.00"), d("1"))],
            },
            0,
        );
        book.prune();
        assert!(book.level_at(d("50.00")).is_none());
        assert!(book.level_at(d("200.00")).is_none());
        assert!(book.level_at(d("100.00")).is_some());
        assert!(book.level_at(d("100.10")).is_some());
    }
}
