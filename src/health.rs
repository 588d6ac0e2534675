//! Component health aggregation
//!
//! Operational visibility for the pipeline stages: each component reports
//! Ok / Degraded / Error with an optional reason, and the engine folds them
//! into one status (worst wins).

use serde::{Deserialize, Serialize};

/// Health status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Ok,

    /// Partial functionality (stale data, open circuit on a non-core path)
    Degraded,

    /// Critical failure
    Error,
}

impl HealthStatus {
    fn rank(self) -> u8 {
        match self {
            HealthStatus::Ok => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Error => 2,
        }
    }
}

/// One component's health report
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: &'static str,
    pub status: HealthStatus,
    pub reason: Option<String>,
}

/// Engine-wide health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,

    /// Health check time (ms since Unix epoch)
    pub timestamp: i64,
}

/// Fold component reports into a single status: the worst component wins
pub fn aggregate(components: Vec<ComponentHealth>, timestamp: i64) -> EngineHealth {
    let status = components
        .iter()
        .map(|c| c.status)
        .max_by_key(|s| s.rank())
        .unwrap_or(HealthStatus::Ok);
    EngineHealth {
        status,
        components,
        timestamp,
    }
}
