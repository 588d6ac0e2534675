//! Configuration management
//!
//! Every knob the engine recognizes lives here as a typed field with a
//! default, deserialized from a JSON file (partial files are fine, missing
//! sections take defaults). `EngineConfig::validate` runs once at startup;
//! any violation is a fatal [`ConfigError`].

use crate::error::ConfigError;
use crate::num::TickSpec;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Top-level configuration for one engine instance (one trading pair)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Trading pair, uppercase (e.g. "BTCUSDT")
    pub symbol: String,

    /// Decimal places of the price grid; tick size is 10^-precision
    pub price_precision: u32,

    /// Decimal places of quantities
    pub quantity_precision: u32,

    /// Rolling aggregation window shared by the detectors (ms)
    pub window_ms: i64,

    /// Minimum spacing between emissions for one (zone, side) key (ms)
    pub event_cooldown_ms: i64,

    /// How long a pending detection may wait for price confirmation (ms)
    pub confirmation_timeout_ms: i64,

    /// Favorable move required before a confirmation can arm (ticks)
    pub min_initial_move_ticks: i64,

    /// Revisit distance from the initial price that completes confirmation (ticks)
    pub max_revisit_ticks: i64,

    /// Cadence of detector/coordinator state sweeps (ms)
    pub cleanup_interval_ms: i64,

    pub book: BookConfig,
    pub preprocessor: PreprocessorConfig,
    pub absorption: AbsorptionConfig,
    pub exhaustion: ExhaustionConfig,
    pub zones: ZoneDetectorConfig,
    pub cvd: CvdConfig,
    pub anomaly: AnomalyConfig,
    pub feed: FeedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            price_precision: 2,
            quantity_precision: 8,
            window_ms: 60_000,
            event_cooldown_ms: 15_000,
            confirmation_timeout_ms: 60_000,
            min_initial_move_ticks: 10,
            max_revisit_ticks: 5,
            cleanup_interval_ms: 30_000,
            book: BookConfig::default(),
            preprocessor: PreprocessorConfig::default(),
            absorption: AbsorptionConfig::default(),
            exhaustion: ExhaustionConfig::default(),
            zones: ZoneDetectorConfig::default(),
            cvd: CvdConfig::default(),
            anomaly: AnomalyConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, falling back to defaults for absent fields
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::InvalidParameter {
                name: "config_file",
                reason: e.to_string(),
            }
        })?;
        let cfg: EngineConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidParameter {
                name: "config_file",
                reason: e.to_string(),
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn tick_spec(&self) -> TickSpec {
        TickSpec::new(self.price_precision, self.quantity_precision)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::MissingParameter("symbol"));
        }
        if self.price_precision > 12 {
            return Err(invalid("price_precision", "must be <= 12"));
        }
        require_positive("window_ms", self.window_ms)?;
        require_positive("event_cooldown_ms", self.event_cooldown_ms)?;
        require_positive("confirmation_timeout_ms", self.confirmation_timeout_ms)?;
        require_positive("min_initial_move_ticks", self.min_initial_move_ticks)?;
        if self.max_revisit_ticks < 0 {
            return Err(invalid("max_revisit_ticks", "must be >= 0"));
        }
        if self.max_revisit_ticks >= self.min_initial_move_ticks {
            return Err(invalid(
                "max_revisit_ticks",
                "must be below min_initial_move_ticks or confirmation is instant",
            ));
        }
        require_positive("cleanup_interval_ms", self.cleanup_interval_ms)?;
        self.book.validate()?;
        self.preprocessor.validate()?;
        self.absorption.validate()?;
        self.exhaustion.validate()?;
        self.zones.validate()?;
        self.cvd.validate()?;
        self.anomaly.validate()?;
        self.feed.validate()?;
        Ok(())
    }
}

/// Order-book state engine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    /// Hard cap on resident price levels
    pub max_levels: usize,

    /// Levels farther than this fraction of mid-price are pruned
    pub max_price_distance: f64,

    /// Cadence of the prune sweep (ms)
    pub prune_interval_ms: i64,

    /// Book age beyond which health degrades (ms)
    pub stale_threshold_ms: i64,

    /// Apply failures tolerated inside `error_window_ms` before the circuit opens
    pub max_error_rate: usize,

    /// Sliding window for the apply-failure counter (ms)
    pub error_window_ms: i64,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            max_levels: 5_000,
            max_price_distance: 0.10,
            prune_interval_ms: 30_000,
            stale_threshold_ms: 5_000,
            max_error_rate: 10,
            error_window_ms: 60_000,
        }
    }
}

impl BookConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_levels == 0 {
            return Err(invalid("book.max_levels", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.max_price_distance) {
            return Err(invalid("book.max_price_distance", "must be in [0, 1]"));
        }
        if self.max_error_rate == 0 {
            return Err(invalid("book.max_error_rate", "must be > 0"));
        }
        require_positive("book.error_window_ms", self.error_window_ms)?;
        require_positive("book.prune_interval_ms", self.prune_interval_ms)?;
        Ok(())
    }
}

/// Enrichment and standardized-zone settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    /// Half-width of the passive band around the trade price (ticks)
    pub band_ticks: i64,

    /// Attach multi-resolution zone snapshots to every enriched trade
    pub enable_standardized_zones: bool,

    pub standard_zones: StandardZoneConfig,

    /// Zone-table entries idle longer than this are recycled (ms)
    pub max_zone_cache_age_ms: i64,

    /// Fixed size of the zone table per resolution
    pub zone_cache_size: usize,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            band_ticks: 5,
            enable_standardized_zones: true,
            standard_zones: StandardZoneConfig::default(),
            max_zone_cache_age_ms: 90_000,
            zone_cache_size: 256,
        }
    }
}

impl PreprocessorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("preprocessor.band_ticks", self.band_ticks)?;
        require_positive(
            "preprocessor.max_zone_cache_age_ms",
            self.max_zone_cache_age_ms,
        )?;
        if self.zone_cache_size == 0 {
            return Err(invalid("preprocessor.zone_cache_size", "must be > 0"));
        }
        self.standard_zones.validate()
    }
}

/// Multi-resolution zone grid: widths base_ticks x multipliers, one rolling
/// window per resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardZoneConfig {
    pub base_ticks: i64,

    /// Must stay [1, 2, 4]: detectors assume the three standard widths
    pub zone_multipliers: Vec<i64>,

    /// Rolling window per resolution (ms)
    pub time_windows_ms: Vec<i64>,

    /// Minimum aggressive volume for a zone snapshot to be attached, per
    /// resolution; zero disables the filter
    pub volume_thresholds: Vec<Decimal>,
}

impl Default for StandardZoneConfig {
    fn default() -> Self {
        Self {
            base_ticks: 10,
            zone_multipliers: vec![1, 2, 4],
            time_windows_ms: vec![45_000, 90_000, 180_000],
            volume_thresholds: vec![Decimal::ZERO, Decimal::ZERO, Decimal::ZERO],
        }
    }
}

impl StandardZoneConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("standard_zones.base_ticks", self.base_ticks)?;
        if self.zone_multipliers != vec![1, 2, 4] {
            return Err(invalid("standard_zones.zone_multipliers", "must be [1, 2, 4]"));
        }
        if self.time_windows_ms.len() != 3 || self.time_windows_ms.iter().any(|w| *w <= 0) {
            return Err(invalid(
                "standard_zones.time_windows_ms",
                "must be three positive windows",
            ));
        }
        if self.volume_thresholds.len() != 3 {
            return Err(invalid(
                "standard_zones.volume_thresholds",
                "must have one entry per resolution",
            ));
        }
        Ok(())
    }
}

/// Absorption detector thresholds (see detector docs for the scoring model)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsorptionConfig {
    /// Minimum in-window aggressive volume at the zone
    pub min_agg_volume: Decimal,

    /// Passive/aggressive ratio above which the score saturates
    pub absorption_threshold: f64,

    /// Aggressive/passive ratio at or above which the zone is exhaustion, not absorption
    pub max_absorption_ratio: f64,

    /// Price efficiency below which the zone counts as absorbing
    pub price_efficiency_threshold: f64,

    /// Required passive volume as a multiple of aggressive volume
    pub min_passive_multiplier: f64,

    /// Scales expected movement in the efficiency model
    pub movement_scaler: f64,

    /// Candidates below this confidence are not submitted
    pub final_confidence_threshold: f64,

    pub features: AbsorptionFeatures,
}

impl Default for AbsorptionConfig {
    fn default() -> Self {
        Self {
            min_agg_volume: Decimal::from(50),
            absorption_threshold: 1.5,
            max_absorption_ratio: 2.0,
            price_efficiency_threshold: 0.35,
            min_passive_multiplier: 1.2,
            movement_scaler: 1.0,
            final_confidence_threshold: 0.6,
            features: AbsorptionFeatures::default(),
        }
    }
}

/// Optional absorption features, all off by default
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsorptionFeatures {
    /// Track passive refills at the absorbing side
    pub refill_detection: bool,

    /// Require deeper liquidity at the zone than in the neighboring band
    pub liquidity_gradient: bool,

    /// Weigh the rate of aggressive events into the score
    pub absorption_velocity: bool,

    /// Reject when the spread blew out during the window
    pub spread_impact: bool,
}

impl AbsorptionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_agg_volume <= Decimal::ZERO {
            return Err(invalid("absorption.min_agg_volume", "must be > 0"));
        }
        require_unit_interval("absorption.price_efficiency_threshold", self.price_efficiency_threshold)?;
        require_unit_interval(
            "absorption.final_confidence_threshold",
            self.final_confidence_threshold,
        )?;
        if self.max_absorption_ratio <= 0.0 {
            return Err(invalid("absorption.max_absorption_ratio", "must be > 0"));
        }
        if self.absorption_threshold <= 0.0 {
            return Err(invalid("absorption.absorption_threshold", "must be > 0"));
        }
        if self.min_passive_multiplier < 0.0 {
            return Err(invalid("absorption.min_passive_multiplier", "must be >= 0"));
        }
        if self.movement_scaler <= 0.0 {
            return Err(invalid("absorption.movement_scaler", "must be > 0"));
        }
        Ok(())
    }
}

/// Exhaustion detector thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExhaustionConfig {
    /// Minimum in-window aggressive volume at the zone
    pub min_agg_volume: Decimal,

    /// Minimum absolute passive volume consumed over the window
    pub depletion_volume_threshold: Decimal,

    /// Minimum (avg - current)/avg passive depletion
    pub depletion_ratio_threshold: f64,

    /// Aggressive volume must exceed remaining passive by this factor
    pub passive_volume_exhaustion_ratio: f64,

    pub final_confidence_threshold: f64,

    pub features: ExhaustionFeatures,
}

impl Default for ExhaustionConfig {
    fn default() -> Self {
        Self {
            min_agg_volume: Decimal::from(50),
            depletion_volume_threshold: Decimal::from(25),
            depletion_ratio_threshold: 0.5,
            passive_volume_exhaustion_ratio: 1.5,
            final_confidence_threshold: 0.6,
            features: ExhaustionFeatures::default(),
        }
    }
}

/// Optional exhaustion features, all off by default
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExhaustionFeatures {
    /// Weigh the speed of depletion into the score
    pub depletion_velocity: bool,

    /// Discount the score when the spread widened with the depletion
    pub spread_adjustment: bool,

    /// Reject when the depleted side refilled within the window
    pub refill_gap: bool,
}

impl ExhaustionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_agg_volume <= Decimal::ZERO {
            return Err(invalid("exhaustion.min_agg_volume", "must be > 0"));
        }
        require_unit_interval(
            "exhaustion.depletion_ratio_threshold",
            self.depletion_ratio_threshold,
        )?;
        require_unit_interval(
            "exhaustion.final_confidence_threshold",
            self.final_confidence_threshold,
        )?;
        if self.passive_volume_exhaustion_ratio <= 0.0 {
            return Err(invalid(
                "exhaustion.passive_volume_exhaustion_ratio",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

/// Accumulation/distribution zone-tracking thresholds (one config drives
/// both detectors; distribution inverts the dominance test)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneDetectorConfig {
    /// A candidate must live at least this long before it can emit (ms)
    pub min_duration_ms: i64,

    /// Sell-volume share required for accumulation
    pub min_sell_ratio: f64,

    /// Buy-volume share required for distribution
    pub min_buy_ratio: f64,

    /// Most recent in-zone trade must be younger than this (ms)
    pub min_recent_activity_ms: i64,

    /// Minimum total traded volume inside the zone
    pub min_zone_volume: Decimal,

    pub min_trade_count: u64,

    /// Price stability in [0,1] required to emit
    pub price_stability_threshold: f64,

    /// Stability above this upgrades confidence
    pub strong_zone_threshold: f64,

    /// Stability below this invalidates the candidate
    pub weak_zone_threshold: f64,

    /// Consecutive out-of-zone trades after which a candidate is dropped
    pub max_breakout_trades: u32,

    /// Bounded candidate set per detector
    pub max_candidates: usize,

    pub final_confidence_threshold: f64,
}

impl Default for ZoneDetectorConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: 120_000,
            min_sell_ratio: 0.55,
            min_buy_ratio: 0.55,
            min_recent_activity_ms: 30_000,
            min_zone_volume: Decimal::from(100),
            min_trade_count: 20,
            price_stability_threshold: 0.6,
            strong_zone_threshold: 0.8,
            weak_zone_threshold: 0.3,
            max_breakout_trades: 10,
            max_candidates: 5,
            final_confidence_threshold: 0.6,
        }
    }
}

impl ZoneDetectorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("zones.min_duration_ms", self.min_duration_ms)?;
        require_positive("zones.min_recent_activity_ms", self.min_recent_activity_ms)?;
        require_unit_interval("zones.min_sell_ratio", self.min_sell_ratio)?;
        require_unit_interval("zones.min_buy_ratio", self.min_buy_ratio)?;
        require_unit_interval("zones.price_stability_threshold", self.price_stability_threshold)?;
        require_unit_interval("zones.strong_zone_threshold", self.strong_zone_threshold)?;
        require_unit_interval("zones.weak_zone_threshold", self.weak_zone_threshold)?;
        if self.weak_zone_threshold >= self.price_stability_threshold {
            return Err(invalid(
                "zones.weak_zone_threshold",
                "must be below price_stability_threshold",
            ));
        }
        if self.max_candidates == 0 {
            return Err(invalid("zones.max_candidates", "must be > 0"));
        }
        require_unit_interval(
            "zones.final_confidence_threshold",
            self.final_confidence_threshold,
        )?;
        Ok(())
    }
}

/// CVD confirmation detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CvdConfig {
    /// Analysis windows, seconds; one CVD series per window
    pub windows_sec: Vec<u32>,

    pub detection_mode: DetectionMode,

    /// Slope z-score required in momentum mode (divergence uses half)
    pub min_z: f64,

    /// Activity floor: trades per second over the window
    pub min_trades_per_sec: f64,

    /// Activity floor: volume per second over the window
    pub min_vol_per_sec: f64,

    /// Price/CVD correlation required for momentum
    pub strong_correlation_threshold: f64,

    /// Price/CVD correlation ceiling for divergence
    pub divergence_threshold: f64,

    /// Volume-rate multiple over baseline that boosts confidence
    pub volume_surge_multiplier: f64,

    /// Buy-share (or sell-share) of window volume that boosts confidence
    pub imbalance_threshold: f64,

    /// Single-trade quantity treated as institutional flow
    pub institutional_threshold: Decimal,

    pub final_confidence_required: f64,
}

/// Closed set of CVD detection modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Momentum,
    Divergence,
    Hybrid,
}

impl Default for CvdConfig {
    fn default() -> Self {
        Self {
            windows_sec: vec![60],
            detection_mode: DetectionMode::Hybrid,
            min_z: 2.0,
            min_trades_per_sec: 1.0,
            min_vol_per_sec: 5.0,
            strong_correlation_threshold: 0.7,
            divergence_threshold: 0.3,
            volume_surge_multiplier: 2.0,
            imbalance_threshold: 0.65,
            institutional_threshold: Decimal::from(10),
            final_confidence_required: 0.65,
        }
    }
}

impl CvdConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.windows_sec.is_empty() {
            return Err(invalid("cvd.windows_sec", "must not be empty"));
        }
        if self.windows_sec.iter().any(|w| *w == 0) {
            return Err(invalid("cvd.windows_sec", "windows must be > 0"));
        }
        if self.min_z <= 0.0 {
            return Err(invalid("cvd.min_z", "must be > 0"));
        }
        require_unit_interval(
            "cvd.strong_correlation_threshold",
            self.strong_correlation_threshold,
        )?;
        require_unit_interval("cvd.divergence_threshold", self.divergence_threshold)?;
        require_unit_interval("cvd.imbalance_threshold", self.imbalance_threshold)?;
        require_unit_interval("cvd.final_confidence_required", self.final_confidence_required)?;
        if self.min_trades_per_sec < 0.0 || self.min_vol_per_sec < 0.0 {
            return Err(invalid("cvd.activity_floors", "must be >= 0"));
        }
        Ok(())
    }
}

/// Anomaly monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Bounded price-history length (points)
    pub window_size: usize,

    /// Baseline spread for the liquidity-void check
    pub normal_spread: Decimal,

    /// Minimum spacing between emissions of one anomaly kind (ms);
    /// critical escalations bypass it
    pub anomaly_cooldown_ms: i64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 200,
            normal_spread: Decimal::from_str("0.01").unwrap(),
            anomaly_cooldown_ms: 30_000,
        }
    }
}

impl AnomalyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < 10 {
            return Err(invalid("anomaly.window_size", "must be >= 10"));
        }
        if self.normal_spread <= Decimal::ZERO {
            return Err(invalid("anomaly.normal_spread", "must be > 0"));
        }
        require_positive("anomaly.anomaly_cooldown_ms", self.anomaly_cooldown_ms)?;
        Ok(())
    }
}

/// Feed adapter endpoints and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub ws_base_url: String,
    pub rest_base_url: String,

    /// Depth levels requested per snapshot
    pub depth_snapshot_limit: u32,

    /// Client-side REST budget
    pub requests_per_minute: u32,

    /// Maximum wait in the rate-limit queue
    pub queue_timeout_secs: u64,

    /// Consecutive failed resyncs before the engine exits
    pub max_resync_attempts: u32,

    /// Out-of-order diffs held for reordering before a gap is declared
    pub reorder_buffer_max: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "wss://stream.binance.com:9443/ws".to_string(),
            rest_base_url: "https://api.binance.com".to_string(),
            depth_snapshot_limit: 1000,
            requests_per_minute: 300,
            queue_timeout_secs: 30,
            max_resync_attempts: 5,
            reorder_buffer_max: 64,
        }
    }
}

impl FeedConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ws_base_url.is_empty() || self.rest_base_url.is_empty() {
            return Err(ConfigError::MissingParameter("feed urls"));
        }
        if self.requests_per_minute == 0 {
            return Err(invalid("feed.requests_per_minute", "must be > 0"));
        }
        if self.max_resync_attempts == 0 {
            return Err(invalid("feed.max_resync_attempts", "must be > 0"));
        }
        if self.reorder_buffer_max == 0 {
            return Err(invalid("feed.reorder_buffer_max", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        name,
        reason: reason.to_string(),
    }
}

fn require_positive(name: &'static str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        Err(invalid(name, "must be > 0"))
    } else {
        Ok(())
    }
}

fn require_unit_interval(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        Err(invalid(name, "must be in [0, 1]"))
    } else {
        Ok(())
    }
}
