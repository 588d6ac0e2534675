//! Per-pair pipeline assembly
//!
//! One cooperative event loop per trading pair: depth diffs, trades, and
//! timer sweeps are applied strictly in arrival order, detectors run
//! synchronously inside trade handling, and downstream consumers get
//! broadcast channels. [`EnginePipeline`] is the network-free core (driven
//! directly by the scenario tests); [`FlowEngine`] straps the feed adapters
//! and the resync protocol around it.

use crate::anomaly::{Anomaly, AnomalyMonitor, AnomalyVeto};
use crate::config::EngineConfig;
use crate::detect::{
    AbsorptionDetector, CvdDetector, Detector, ExhaustionDetector, ZoneKind,
    ZoneLifecycleDetector,
};
use crate::error::{EngineError, SyncError};
use crate::feed::{
    AggTradeEvent, DepthSnapshot, DepthStreamClient, DiffDepthEvent, SnapshotClient,
    TradeStreamClient,
};
use crate::flow::Preprocessor;
use crate::health::{self, ComponentHealth, EngineHealth, HealthStatus};
use crate::metrics::{MetricsRegistry, MetricsSnapshot, RejectReason};
use crate::signal::{ConfirmedSignal, SignalCoordinator};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Feed channel depth before back-pressure pushes into the reader tasks
const FEED_CHANNEL_DEPTH: usize = 1024;

/// The assembled stages for one pair, without any I/O
pub struct EnginePipeline {
    cfg: EngineConfig,
    preprocessor: Preprocessor,
    detectors: Vec<Box<dyn Detector>>,
    coordinator: SignalCoordinator,
    anomaly: AnomalyMonitor,
    metrics: Arc<MetricsRegistry>,

    /// Out-of-order diffs parked until their predecessor arrives
    reorder: BTreeMap<i64, DiffDepthEvent>,
}

impl EnginePipeline {
    pub fn new(cfg: EngineConfig) -> Result<Self, EngineError> {
        cfg.validate()?;

        let metrics = Arc::new(MetricsRegistry::new());
        let veto = Arc::new(AnomalyVeto::new());
        let spec = cfg.tick_spec();
        let zone_ticks = cfg.preprocessor.standard_zones.base_ticks;

        let detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(AbsorptionDetector::new(
                spec,
                zone_ticks,
                cfg.window_ms,
                cfg.event_cooldown_ms,
                cfg.absorption.clone(),
                Arc::clone(&metrics),
            )),
            Box::new(ExhaustionDetector::new(
                spec,
                zone_ticks,
                cfg.window_ms,
                cfg.event_cooldown_ms,
                cfg.exhaustion.clone(),
                Arc::clone(&metrics),
            )),
            Box::new(ZoneLifecycleDetector::new(
                ZoneKind::Accumulation,
                spec,
                zone_ticks,
                cfg.window_ms,
                cfg.event_cooldown_ms,
                cfg.zones.clone(),
                Arc::clone(&metrics),
            )),
            Box::new(ZoneLifecycleDetector::new(
                ZoneKind::Distribution,
                spec,
                zone_ticks,
                cfg.window_ms,
                cfg.event_cooldown_ms,
                cfg.zones.clone(),
                Arc::clone(&metrics),
            )),
            Box::new(CvdDetector::new(
                spec,
                zone_ticks,
                cfg.event_cooldown_ms,
                cfg.cvd.clone(),
                Arc::clone(&metrics),
            )),
        ];

        Ok(Self {
            preprocessor: Preprocessor::new(&cfg, Arc::clone(&metrics)),
            coordinator: SignalCoordinator::new(&cfg, Arc::clone(&veto), Arc::clone(&metrics)),
            anomaly: AnomalyMonitor::new(
                cfg.anomaly.clone(),
                Arc::clone(&veto),
                Arc::clone(&metrics),
            ),
            detectors,
            metrics,
            reorder: BTreeMap::new(),
            cfg,
        })
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<ConfirmedSignal> {
        self.coordinator.subscribe()
    }

    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<Anomaly> {
        self.anomaly.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn book_ready(&self) -> bool {
        self.preprocessor.book().is_ready()
    }

    pub fn book(&self) -> &crate::book::OrderBookEngine {
        self.preprocessor.book()
    }

    pub fn pending_confirmations(&self) -> usize {
        self.coordinator.pending_count()
    }

    /// Apply (or re-apply, on resync) a depth snapshot, then drain whatever
    /// parked diffs now chain onto it
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot, now_ms: i64) -> Result<(), EngineError> {
        self.preprocessor.initialize_book(snapshot, now_ms)?;
        info!(
            symbol = %self.cfg.symbol,
            last_update_id = snapshot.last_update_id,
            "Depth snapshot applied"
        );
        self.pump_depth().map_err(EngineError::Sync)
    }

    /// Park the diff in update-id order and apply every diff that chains.
    ///
    /// `Err(Sync)` means the caller must run the resync protocol; everything
    /// buffered is kept for replay after the fresh snapshot.
    pub fn handle_depth_event(&mut self, event: DiffDepthEvent) -> Result<(), SyncError> {
        self.reorder.insert(event.first_update_id, event);
        self.pump_depth()
    }

    /// Enrich one trade and run it through the anomaly monitor, the pending
    /// confirmations, and every detector, in that order
    pub fn handle_trade_event(&mut self, event: &AggTradeEvent) {
        let Some(enriched) = self.preprocessor.handle_agg_trade(event) else {
            return;
        };

        self.anomaly.on_trade(&enriched);
        self.coordinator.on_trade(&enriched);

        for detector in &mut self.detectors {
            if let Some(candidate) = detector.on_trade(&enriched) {
                self.coordinator.submit_signal(candidate, enriched.timestamp());
            }
        }
    }

    /// Timer sweep: detector zone cleanup, pending-confirmation sweep, zone
    /// cache eviction, and book pruning
    pub fn cleanup(&mut self, now_ms: i64) {
        for detector in &mut self.detectors {
            detector.cleanup(now_ms);
        }
        self.coordinator.sweep(now_ms);
        self.preprocessor.cleanup(now_ms);
    }

    pub fn health(&self, now_ms: i64) -> EngineHealth {
        let mut components = vec![self.preprocessor.book().health(now_ms)];
        components.push(ComponentHealth {
            component: "coordinator",
            status: HealthStatus::Ok,
            reason: None,
        });
        health::aggregate(components, now_ms)
    }

    fn pump_depth(&mut self) -> Result<(), SyncError> {
        loop {
            let next_id = self.reorder.keys().next().copied();
            let Some(first_id) = next_id else {
                return Ok(());
            };
            let event = self.reorder.remove(&first_id).expect("key just observed");
            match self.preprocessor.handle_depth(&event) {
                Ok(applied) => {
                    if applied {
                        let top = self.preprocessor.book().top();
                        self.anomaly.on_depth(&top, event.event_time);
                    }
                }
                Err(SyncError::NotReady) => {
                    // Startup: keep buffering until the snapshot lands.
                    self.park(first_id, event);
                    return Ok(());
                }
                Err(e @ (SyncError::IdGap { .. } | SyncError::SnapshotNotCovered { .. })) => {
                    // The predecessor may simply not have arrived yet; wait
                    // until the reorder buffer overflows before declaring a
                    // real gap.
                    self.reorder.insert(first_id, event);
                    if self.reorder.len() > self.cfg.feed.reorder_buffer_max {
                        warn!(symbol = %self.cfg.symbol, error = %e, "Depth gap confirmed; resync required");
                        self.metrics.reject(RejectReason::IdGapResync);
                        return Err(e);
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn park(&mut self, first_id: i64, event: DiffDepthEvent) {
        self.reorder.insert(first_id, event);
        if self.reorder.len() > self.cfg.feed.reorder_buffer_max {
            // Shed the oldest parked diff; it is the most likely to be
            // stale once the snapshot arrives anyway.
            let oldest = self.reorder.keys().next().copied();
            if let Some(oldest) = oldest {
                self.reorder.remove(&oldest);
                self.metrics.reject(RejectReason::QueueOverflow);
            }
        }
    }

    /// Invalidate the book ahead of a snapshot re-fetch
    pub fn begin_resync(&mut self) {
        self.preprocessor.book_mut().invalidate();
    }
}

/// The live engine: feed adapters + pipeline + resync protocol
pub struct FlowEngine {
    pipeline: EnginePipeline,
}

impl FlowEngine {
    pub fn new(cfg: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            pipeline: EnginePipeline::new(cfg)?,
        })
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<ConfirmedSignal> {
        self.pipeline.subscribe_signals()
    }

    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<Anomaly> {
        self.pipeline.subscribe_anomalies()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics()
    }

    /// Run until the shutdown signal fires or a fatal error occurs.
    ///
    /// Stages drain in dependency order on shutdown: the feed receivers are
    /// closed first, queued events are drained through the pipeline, timers
    /// are cancelled, and expired pendings are discarded without emission.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), EngineError> {
        let cfg = self.pipeline.cfg.clone();

        let (depth_client, mut depth_rx) =
            DepthStreamClient::new(&cfg.feed.ws_base_url, &cfg.symbol, FEED_CHANNEL_DEPTH);
        let (trade_client, mut trade_rx) =
            TradeStreamClient::new(&cfg.feed.ws_base_url, &cfg.symbol, FEED_CHANNEL_DEPTH);
        let depth_task = depth_client.start();
        let trade_task = trade_client.start();

        let snapshots = SnapshotClient::new(&cfg.feed);
        self.sync_book(&snapshots, &cfg.symbol, cfg.feed.max_resync_attempts)
            .await?;

        let mut sweep = tokio::time::interval(Duration::from_millis(
            cfg.cleanup_interval_ms.max(1) as u64,
        ));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(symbol = %cfg.symbol, "Order-flow engine running");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!(symbol = %cfg.symbol, "Shutdown signal received");
                    break;
                }

                Some(diff) = depth_rx.recv() => {
                    if let Err(e) = self.pipeline.handle_depth_event(diff) {
                        warn!(symbol = %cfg.symbol, error = %e, "Depth sync lost; resyncing");
                        self.sync_book(&snapshots, &cfg.symbol, cfg.feed.max_resync_attempts)
                            .await?;
                    }
                }

                Some(trade) = trade_rx.recv() => {
                    self.pipeline.handle_trade_event(&trade);
                }

                _ = sweep.tick() => {
                    let now = chrono::Utc::now().timestamp_millis();
                    self.pipeline.cleanup(now);
                }
            }
        }

        // Drain: stop the feeds, flush whatever is already queued, then run
        // a final sweep so expired pendings are dropped without emission.
        depth_rx.close();
        trade_rx.close();
        while let Ok(diff) = depth_rx.try_recv() {
            let _ = self.pipeline.handle_depth_event(diff);
        }
        while let Ok(trade) = trade_rx.try_recv() {
            self.pipeline.handle_trade_event(&trade);
        }
        self.pipeline.cleanup(chrono::Utc::now().timestamp_millis());
        depth_task.abort();
        trade_task.abort();

        info!(symbol = %cfg.symbol, "Order-flow engine stopped");
        Ok(())
    }

    /// Fetch-and-apply a snapshot with bounded retries; parked diffs newer
    /// than the snapshot replay automatically
    async fn sync_book(
        &mut self,
        snapshots: &SnapshotClient,
        symbol: &str,
        max_attempts: u32,
    ) -> Result<(), EngineError> {
        self.pipeline.begin_resync();

        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=max_attempts {
            match snapshots.fetch_depth_snapshot(symbol).await {
                Ok(snapshot) => {
                    let now = chrono::Utc::now().timestamp_millis();
                    match self.pipeline.apply_snapshot(&snapshot, now) {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            warn!(symbol = %symbol, attempt, error = %e, "Snapshot did not restore sync");
                        }
                    }
                }
                Err(e) => {
                    error!(symbol = %symbol, attempt, error = %e, "Snapshot fetch failed");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, Duration::from_secs(30));
        }

        Err(EngineError::Sync(SyncError::ResyncExhausted {
            attempts: max_attempts,
        }))
    }
}
