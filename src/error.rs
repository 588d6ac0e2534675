//! Error taxonomy shared by every stage of the pipeline
//!
//! Five kinds: configuration errors are fatal at startup, sync errors recover
//! via resync, data errors drop the offending event, resource errors degrade
//! health, logic errors mark a component DEGRADED. Each variant carries the
//! metric label used by the rejection counters.

use thiserror::Error;

/// Crate-level error wrapping per-component errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Resource exhausted: {0}")]
    Resource(String),

    #[error("Invariant violated: {0}")]
    Logic(String),
}

impl EngineError {
    /// Stable label for metrics counters
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Sync(_) => "sync",
            EngineError::Data(_) => "data",
            EngineError::Feed(_) => "feed",
            EngineError::Resource(_) => "resource",
            EngineError::Logic(_) => "logic",
        }
    }

    /// Fatal errors terminate the engine; everything else recovers in place
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Config(_))
    }
}

/// Invalid or missing startup parameters; always fatal
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Depth-stream synchronization failures; recoverable via resync
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Update-id gap: expected first_update_id {expected}, got {got}")]
    IdGap { expected: i64, got: i64 },

    #[error("Diff does not cover snapshot last_update_id {snapshot_id} (range {first}..={last})")]
    SnapshotNotCovered {
        snapshot_id: i64,
        first: i64,
        last: i64,
    },

    #[error("Order book not initialized (awaiting snapshot)")]
    NotReady,

    #[error("Apply-error circuit breaker open ({failures} failures in {window_ms}ms)")]
    CircuitOpen { failures: usize, window_ms: i64 },

    #[error("Resync failed after {attempts} attempts")]
    ResyncExhausted { attempts: u32 },
}

/// Malformed or out-of-range event payloads; the event is dropped and counted
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Malformed price: {0:?}")]
    MalformedPrice(String),

    #[error("Malformed quantity: {0:?}")]
    MalformedQuantity(String),

    #[error("Non-positive {field}: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("Trade id {got} not after {last} (feed order violated)")]
    NonMonotonicTradeId { last: u64, got: u64 },
}

/// Transport-level failures in the feed adapters
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Snapshot request failed: {0}")]
    Snapshot(String),

    #[error("Rate limit queue timeout after {0}s")]
    RateLimitTimeout(u64),

    #[error("Stream closed")]
    StreamClosed,
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Connection(_) | FeedError::Snapshot(_) | FeedError::StreamClosed
        )
    }
}
