//! Bounded containers used by the hot path
//!
//! Everything here is fixed-capacity or time-bounded: sustained streams must
//! never grow memory without bound.

pub mod ring;
pub mod rolling;
pub mod time_cache;

pub use ring::RingBuffer;
pub use rolling::{RollingCorrelation, RollingRegression, Welford, WindowStats};
pub use time_cache::TimeCache;
