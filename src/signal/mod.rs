//! Signal coordination
//!
//! Candidates from every detector funnel through one coordinator that
//! deduplicates concurrent detections, enforces the per-zone emission
//! cooldown, runs the price-confirmation protocol, and applies the anomaly
//! veto before anything reaches downstream subscribers.

pub mod coordinator;

pub use coordinator::{ConfirmedSignal, SignalCoordinator};
