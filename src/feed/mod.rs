//! Exchange feed adapters
//!
//! Narrow interfaces to the exchange: a diff-depth stream, an aggregated
//! trade stream, and a REST depth-snapshot fetch behind a client-side rate
//! limiter. Everything downstream consumes the parsed events through mpsc
//! channels; nothing else in the engine touches the network.

pub mod depth;
pub mod rate_limiter;
pub mod rest;
pub mod trades;
pub mod types;

pub use depth::DepthStreamClient;
pub use rate_limiter::RateLimiter;
pub use rest::SnapshotClient;
pub use trades::TradeStreamClient;
pub use types::{AggTradeEvent, DepthSnapshot, DiffDepthEvent};
