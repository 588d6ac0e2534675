//! Order-book state engine
//!
//! Maintains the authoritative per-price bid/ask quantities for one pair and
//! answers best-quote, spread, mid-price, and banded-sum queries. The book is
//! mutated only by the preprocessor stage; every query returns copies.

pub mod engine;
pub mod level;

pub use engine::{BandSum, BookDiff, BookSnapshot, BookState, BookTop, OrderBookEngine};
pub use level::PassiveLevel;
