//! Single price level
//!
//! A level may hold passive quantity on at most one side at a time: writing a
//! nonzero quantity on one side clears the other side *and* its tracking
//! counters (replace-whole-side, so counters never leak across ownership
//! changes). A zero write only touches its own side.

use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassiveLevel {
    pub price: Decimal,
    pub bid_qty: Decimal,
    pub ask_qty: Decimal,

    /// Event time of the last write (ms)
    pub timestamp: i64,

    /// Cumulative quantity added on each side since the side was last claimed
    pub added_bid: Decimal,
    pub added_ask: Decimal,

    /// Cumulative quantity removed on each side since the side was last claimed
    pub consumed_bid: Decimal,
    pub consumed_ask: Decimal,
}

impl PassiveLevel {
    pub fn new(price: Decimal, now_ms: i64) -> Self {
        Self {
            price,
            bid_qty: Decimal::ZERO,
            ask_qty: Decimal::ZERO,
            timestamp: now_ms,
            added_bid: Decimal::ZERO,
            added_ask: Decimal::ZERO,
            consumed_bid: Decimal::ZERO,
            consumed_ask: Decimal::ZERO,
        }
    }

    pub fn set_bid(&mut self, qty: Decimal, now_ms: i64) {
        if qty > Decimal::ZERO && self.ask_qty > Decimal::ZERO {
            self.clear_ask();
        }
        if qty > self.bid_qty {
            self.added_bid += qty - self.bid_qty;
        } else {
            self.consumed_bid += self.bid_qty - qty;
        }
        self.bid_qty = qty;
        self.timestamp = now_ms;
    }

    pub fn set_ask(&mut self, qty: Decimal, now_ms: i64) {
        if qty > Decimal::ZERO && self.bid_qty > Decimal::ZERO {
            self.clear_bid();
        }
        if qty > self.ask_qty {
            self.added_ask += qty - self.ask_qty;
        } else {
            self.consumed_ask += self.ask_qty - qty;
        }
        self.ask_qty = qty;
        self.timestamp = now_ms;
    }

    /// Vacate the ask side, resetting its counters
    pub fn clear_ask(&mut self) {
        self.ask_qty = Decimal::ZERO;
        self.added_ask = Decimal::ZERO;
        self.consumed_ask = Decimal::ZERO;
    }

    /// Vacate the bid side, resetting its counters
    pub fn clear_bid(&mut self) {
        self.bid_qty = Decimal::ZERO;
        self.added_bid = Decimal::ZERO;
        self.consumed_bid = Decimal::ZERO;
    }

    /// Both sides empty: the level can be dropped from the book
    pub fn is_empty(&self) -> bool {
        self.bid_qty.is_zero() && self.ask_qty.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn test_nonzero_bid_clears_ask_and_resets_counters() {
        let mut level = PassiveLevel::new(Decimal::from(50), 0);
        level.set_ask(d(100), 1);
        assert_eq!(level.added_ask, d(100));

        level.set_bid(d(200), 2);
        assert_eq!(level.bid_qty, d(200));
        assert_eq!(level.ask_qty, Decimal::ZERO);
        assert_eq!(level.added_bid, d(200));
        assert_eq!(level.added_ask, Decimal::ZERO);
        assert_eq!(level.consumed_ask, Decimal::ZERO);
    }

    #[test]
    fn test_zero_bid_does_not_clear_ask() {
        let mut level = PassiveLevel::new(Decimal::from(50), 0);
        level.set_ask(d(100), 1);
        level.set_bid(Decimal::ZERO, 2);
        assert_eq!(level.ask_qty, d(100));
        assert_eq!(level.added_ask, d(100));
    }

    #[test]
    fn test_consumption_tracking() {
        let mut level = PassiveLevel::new(Decimal::from(50), 0);
        level.set_bid(d(100), 1);
        level.set_bid(d(40), 2);
        assert_eq!(level.consumed_bid, d(60));
        level.set_bid(d(70), 3);
        assert_eq!(level.added_bid, d(130));
        assert_eq!(level.consumed_bid, d(60));
    }

    #[test]
    fn test_insert_then_zero_is_empty() {
        let mut level = PassiveLevel::new(Decimal::from(50), 0);
        level.set_bid(d(100), 1);
        level.set_bid(Decimal::ZERO, 2);
        assert!(level.is_empty());
    }
}
