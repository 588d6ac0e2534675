//! Fixed-precision price and quantity helpers
//!
//! Prices are keyed as integer ticks (`round(price / tick_size)`) everywhere
//! a map key or a price comparison is needed, so repeated decimal division
//! never drifts. Decimal arithmetic stays in `rust_decimal`; conversion to
//! f64 happens only at the derived-statistics edges.

use crate::error::DataError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Price grid for one trading pair: tick size is 10^-pricePrecision
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickSpec {
    /// Decimal places of the price grid
    pub price_precision: u32,

    /// Minimum price increment (10^-price_precision)
    pub tick_size: Decimal,

    /// Decimal places of quantities
    pub quantity_precision: u32,
}

impl TickSpec {
    pub fn new(price_precision: u32, quantity_precision: u32) -> Self {
        Self {
            price_precision,
            tick_size: Decimal::new(1, price_precision),
            quantity_precision,
        }
    }

    /// Nearest-tick key for a price. Midpoints round away from zero so the
    /// same decimal always maps to the same key.
    pub fn to_ticks(&self, price: Decimal) -> i64 {
        (price / self.tick_size)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or(0)
    }

    /// Price at an integer tick key
    pub fn to_price(&self, ticks: i64) -> Decimal {
        Decimal::from(ticks) * self.tick_size
    }

    /// Snap a price onto the grid
    pub fn round_price(&self, price: Decimal) -> Decimal {
        self.to_price(self.to_ticks(price))
    }
}

/// Zone id for a tick key: floor division, so a price exactly on a zone
/// boundary belongs to the zone it starts (deterministic toward -inf,
/// including negative tick keys).
pub fn zone_id(price_ticks: i64, zone_ticks: i64) -> i64 {
    debug_assert!(zone_ticks > 0);
    price_ticks.div_euclid(zone_ticks)
}

/// Center price tick of a zone (rounded down for odd widths)
pub fn zone_center_ticks(zone: i64, zone_ticks: i64) -> i64 {
    zone * zone_ticks + zone_ticks / 2
}

/// Inclusive tick range covered by a zone
pub fn zone_bounds_ticks(zone: i64, zone_ticks: i64) -> (i64, i64) {
    let lo = zone * zone_ticks;
    (lo, lo + zone_ticks - 1)
}

/// Parse a wire price string, rejecting non-positive values
pub fn parse_price(s: &str) -> Result<Decimal, DataError> {
    let d = Decimal::from_str(s).map_err(|_| DataError::MalformedPrice(s.to_string()))?;
    if d <= Decimal::ZERO {
        return Err(DataError::OutOfRange {
            field: "price",
            value: s.to_string(),
        });
    }
    Ok(d)
}

/// Parse a wire quantity string; zero is legal (a zero write deletes a level)
pub fn parse_quantity(s: &str) -> Result<Decimal, DataError> {
    let d = Decimal::from_str(s).map_err(|_| DataError::MalformedQuantity(s.to_string()))?;
    if d < Decimal::ZERO {
        return Err(DataError::OutOfRange {
            field: "quantity",
            value: s.to_string(),
        });
    }
    Ok(d)
}

/// f64 view of a Decimal for statistics; NaN is mapped to 0.0 so it can
/// never propagate into a confidence score
pub fn to_f64(d: Decimal) -> f64 {
    let v = d.to_f64().unwrap_or(0.0);
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_tick_roundtrip() {
        let spec = TickSpec::new(2, 8);
        assert_eq!(spec.tick_size, d("0.01"));
        assert_eq!(spec.to_ticks(d("50.00")), 5000);
        assert_eq!(spec.to_price(5000), d("50.00"));
        assert_eq!(spec.round_price(d("50.004")), d("50.00"));
        assert_eq!(spec.round_price(d("50.005")), d("50.01"));
    }

    #[test]
    fn test_zone_floor_is_deterministic_on_boundaries() {
        // zone width 10 ticks: ticks 0..=9 -> zone 0, 10..=19 -> zone 1
        assert_eq!(zone_id(9, 10), 0);
        assert_eq!(zone_id(10, 10), 1);
        assert_eq!(zone_id(-1, 10), -1);
        assert_eq!(zone_bounds_ticks(1, 10), (10, 19));
        assert_eq!(zone_center_ticks(1, 10), 15);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_price("abc").is_err());
        assert!(parse_price("-1.0").is_err());
        assert!(parse_quantity("-0.5").is_err());
        assert_eq!(parse_quantity("0").unwrap(), Decimal::ZERO);
    }
}
