//! Per-session sampling worker.
//!
//! One task per session, the only writer of the session's estimator. Each
//! tick starts a measurement on every enabled adapter that is not already
//! measuring. Measurements run as their own tasks and hand the adapter back
//! when they finish, so a slow modality never holds up a fast one.
//!
//! Samples and injected sensor events are committed to the estimator in
//! timestamp order. An event is committed once nothing older can still
//! arrive: no in-flight measurement started before it, and it has aged past
//! the reorder window. Younger events are fused into a copy of the
//! committed estimator for publication only.

use nalgebra::{Unit, Vector3};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use echoscan_env::{ScanContext, SessionId};

use super::{
    boresight, FusionUpdate, ModalitySlot, SensorEvent, SessionEvent, SessionStatus, SessionSummary, SharedSession,
    Termination,
};
use crate::adapters::RangingAdapter;
use crate::cancel::CancelToken;
use crate::config::SessionConfig;
use crate::error::{FusionError, RangingError};
use crate::fusion::FusionEstimator;
use crate::types::{Modality, RangingSample};

/// Channel ends owned by the worker.
pub(crate) struct WorkerChannels {
    pub(crate) cancel: CancelToken,
    pub(crate) stop_rx: watch::Receiver<bool>,
    pub(crate) sensor_rx: mpsc::Receiver<SensorEvent>,
    pub(crate) snapshot_tx: watch::Sender<crate::fusion::FusionState>,
    pub(crate) events_tx: broadcast::Sender<SessionEvent>,
    pub(crate) summary_tx: oneshot::Sender<SessionSummary>,
}

/// A finished measurement task, returning the adapter it borrowed.
struct Measurement {
    modality: Modality,
    adapter: Box<dyn RangingAdapter>,
    result: Result<RangingSample, RangingError>,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: u64,
    inertial: u64,
    accepted: BTreeMap<Modality, u64>,
    rejected: BTreeMap<Modality, u64>,
    disabled: BTreeMap<Modality, String>,
    latest: BTreeMap<Modality, RangingSample>,
    unreleased: BTreeSet<Modality>,
}

impl Counters {
    fn accept(&mut self, sample: RangingSample) {
        *self.accepted.entry(sample.modality()).or_insert(0) += 1;
        self.latest.insert(sample.modality(), sample);
    }

    fn reject(&mut self, modality: Modality) {
        *self.rejected.entry(modality).or_insert(0) += 1;
    }
}

pub(crate) struct SessionWorker<Ctx: ScanContext> {
    ctx: Arc<Ctx>,
    config: SessionConfig,
    shared: SharedSession,
    id: SessionId,
    requested: Vec<Modality>,
    slots: Vec<ModalitySlot>,
    estimator: FusionEstimator,
    channels: WorkerChannels,
    direction: Unit<Vector3<f64>>,
    counters: Counters,

    results_tx: mpsc::Sender<Measurement>,
    results_rx: mpsc::Receiver<Measurement>,
    /// Start time of each measurement still running
    in_flight: BTreeMap<Modality, f64>,
    /// Events not yet committed, sorted on every flush
    pending: Vec<SensorEvent>,
    /// Something arrived since the last publication
    dirty: bool,
    reorder_window: f64,
}

impl<Ctx: ScanContext> SessionWorker<Ctx> {
    pub(crate) fn new(
        ctx: Arc<Ctx>,
        config: SessionConfig,
        shared: SharedSession,
        requested: Vec<Modality>,
        slots: Vec<ModalitySlot>,
        estimator: FusionEstimator,
        channels: WorkerChannels,
    ) -> Self {
        let id = shared.get().id;
        let direction = boresight(&config);
        let reorder_window = Duration::from_millis(config.reorder_window_ms).as_secs_f64();
        // One measurement per slot at most, so sends never wait
        let (results_tx, results_rx) = mpsc::channel(slots.len().max(1));
        Self {
            ctx,
            config,
            shared,
            id,
            requested,
            slots,
            estimator,
            channels,
            direction,
            counters: Counters::default(),
            results_tx,
            results_rx,
            in_flight: BTreeMap::new(),
            pending: Vec::new(),
            dirty: false,
            reorder_window,
        }
    }

    pub(crate) async fn run(mut self) {
        let rate = self.shared.get().target_update_rate_hz;
        let period = Duration::from_secs_f64(1.0 / rate);
        let ctx = self.ctx.clone();
        let mut next_tick = ctx.now() + period;

        let termination = loop {
            let wait = next_tick.saturating_sub(ctx.now());
            tokio::select! {
                biased;
                _ = self.channels.stop_rx.changed() => break Termination::Requested,
                Some(measurement) = self.results_rx.recv() => {
                    self.on_measurement(measurement).await;
                    if !self.slots.iter().any(|s| s.enabled) {
                        break Termination::ModalitiesExhausted;
                    }
                    self.flush(false);
                }
                _ = ctx.sleep(wait) => {
                    self.counters.ticks += 1;
                    self.dispatch();
                    self.flush(false);
                    // A slow tick skips the missed slots instead of bursting
                    next_tick = (next_tick + period).max(ctx.now());
                }
            }
        };

        self.finish(termination).await;
    }

    /// Starts a measurement on every enabled, idle adapter.
    fn dispatch(&mut self) {
        let now = self.ctx.now_secs();
        let timeout = Duration::from_millis(self.config.measure_timeout_ms);

        for slot in self.slots.iter_mut().filter(|s| s.enabled) {
            // Still measuring from an earlier tick
            let Some(mut adapter) = slot.adapter.take() else {
                continue;
            };
            let modality = slot.modality;
            self.in_flight.insert(modality, now);

            let ctx = self.ctx.clone();
            let cancel = self.channels.cancel.clone();
            let stop = self.channels.stop_rx.clone();
            let results = self.results_tx.clone();
            let direction = self.direction;
            self.ctx.spawn(&format!("measure-{}-{}", modality, self.id), async move {
                let result = tokio::select! {
                    biased;
                    result = adapter.measure(direction, &cancel) => result,
                    _ = ctx.sleep(timeout) => Err(RangingError::CaptureTimeout { captured: 0, expected: 0 }),
                    _ = stop_requested(stop) => Err(RangingError::Cancelled),
                };
                let measurement = Measurement {
                    modality,
                    adapter,
                    result,
                };
                if let Err(mpsc::error::SendError(mut orphan)) = results.send(measurement).await {
                    // The worker is gone and cannot release it
                    orphan.adapter.stop_session().await;
                }
            });
        }
    }

    async fn on_measurement(&mut self, measurement: Measurement) {
        let Measurement {
            modality,
            adapter,
            result,
        } = measurement;
        self.in_flight.remove(&modality);
        if let Some(slot) = self.slot_mut(modality) {
            slot.adapter = Some(adapter);
        }

        match result {
            Ok(sample) => match self.validate(&sample) {
                Ok(()) => {
                    if let Some(slot) = self.slot_mut(modality) {
                        slot.consecutive_failures = 0;
                    }
                    self.enqueue(SensorEvent::Ranging(sample));
                }
                Err(e) => self.record_failure(modality, e).await,
            },
            // Stop in progress, not the adapter's fault
            Err(RangingError::Cancelled) => {}
            Err(e) => self.record_failure(modality, e).await,
        }
    }

    /// Moves queued external events into the pending set.
    fn drain_sensor_events(&mut self) {
        while let Ok(event) = self.channels.sensor_rx.try_recv() {
            match event {
                SensorEvent::Inertial(imu) => {
                    self.counters.inertial += 1;
                    self.enqueue(SensorEvent::Inertial(imu));
                }
                SensorEvent::Ranging(sample) => {
                    let modality = sample.modality();
                    if !self.is_enabled(modality) {
                        debug!("Session {}: dropping {} sample, modality not active", self.id, modality);
                        self.counters.reject(modality);
                        continue;
                    }
                    match self.validate(&sample) {
                        Ok(()) => self.enqueue(SensorEvent::Ranging(sample)),
                        Err(e) => {
                            debug!("Session {}: external {} sample refused: {}", self.id, modality, e);
                            self.counters.reject(modality);
                        }
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, event: SensorEvent) {
        if !event.timestamp().is_finite() {
            debug!("Session {}: event with non-finite timestamp dropped", self.id);
            if let SensorEvent::Ranging(sample) = &event {
                self.counters.reject(sample.modality());
            }
            return;
        }
        self.pending.push(event);
        self.dirty = true;
    }

    /// Commits every event nothing older can still precede, then publishes
    /// if anything arrived since the last publication.
    fn flush(&mut self, everything: bool) {
        self.drain_sensor_events();

        self.pending.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));
        let horizon = if everything { f64::INFINITY } else { self.horizon() };
        let ready = self.pending.partition_point(|e| e.timestamp() <= horizon);
        let committed: Vec<SensorEvent> = self.pending.drain(..ready).collect();
        for event in committed {
            self.commit(event);
        }

        if std::mem::take(&mut self.dirty) {
            self.publish();
        }
    }

    /// Newest timestamp that no future event can precede.
    fn horizon(&self) -> f64 {
        let settled = self.ctx.now_secs() - self.reorder_window;
        self.in_flight.values().copied().fold(settled, f64::min)
    }

    fn commit(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Inertial(imu) => {
                if let Err(e) = self.estimator.predict(&imu) {
                    self.on_fusion_error(e);
                }
            }
            SensorEvent::Ranging(sample) => self.apply_range(sample),
        }
    }

    fn apply_range(&mut self, sample: RangingSample) {
        let modality = sample.modality();
        let Some(accuracy) = self.accuracy(modality) else {
            self.counters.reject(modality);
            return;
        };
        match self.estimator.correct(&sample, accuracy) {
            Ok(outcome) => {
                debug!(
                    "Session {}: {} {:.3}m innovation {:.3} gain {:.2}",
                    self.id,
                    modality,
                    sample.distance_m(),
                    outcome.innovation,
                    outcome.gain
                );
                self.counters.accept(sample);
            }
            Err(e) => {
                self.counters.reject(modality);
                self.on_fusion_error(e);
            }
        }
    }

    fn on_fusion_error(&mut self, error: FusionError) {
        match error {
            FusionError::StateCorruption(reason) => {
                warn!("Session {}: fusion state reset: {}", self.id, reason);
                let _ = self.channels.events_tx.send(SessionEvent::StateReset { reason });
            }
            FusionError::InvalidInput(reason) => {
                debug!("Session {}: input skipped: {}", self.id, reason);
            }
        }
    }

    /// Range check against the capability declared at initialization.
    fn validate(&self, sample: &RangingSample) -> Result<(), RangingError> {
        let modality = sample.modality();
        let slot = self
            .slots
            .iter()
            .find(|s| s.modality == modality)
            .ok_or(RangingError::HardwareUnavailable(modality))?;
        slot.capability.range.validate(modality, sample.distance_m()).map(|_| ())
    }

    async fn record_failure(&mut self, modality: Modality, error: RangingError) {
        self.counters.reject(modality);
        let limit = self.config.max_consecutive_failures;
        let Some(slot) = self.slot_mut(modality) else {
            return;
        };
        slot.consecutive_failures += 1;
        let failures = slot.consecutive_failures;
        debug!("Session {}: {} failed ({} in a row): {}", self.id, modality, failures, error);

        if error.disables_modality() {
            self.disable(modality, error.to_string()).await;
        } else if failures >= limit {
            self.disable(modality, format!("{} consecutive failures, last: {}", failures, error))
                .await;
        }
    }

    async fn disable(&mut self, modality: Modality, reason: String) {
        let budget = Duration::from_millis(self.config.measure_timeout_ms);
        let ctx = self.ctx.clone();
        let Some(slot) = self.slot_mut(modality).filter(|s| s.enabled) else {
            return;
        };
        slot.enabled = false;
        let released = match slot.adapter.as_mut() {
            Some(adapter) => release(ctx.as_ref(), &mut **adapter, budget).await,
            None => false,
        };
        if !released {
            // Dropping the adapter lets its handle go
            slot.adapter = None;
            self.counters.unreleased.insert(modality);
        }

        warn!("Session {}: disabling {}: {}", self.id, modality, reason);
        self.shared.update(|s| {
            s.active_modalities.remove(&modality);
        });
        self.counters.disabled.insert(modality, reason.clone());
        let _ = self
            .channels
            .events_tx
            .send(SessionEvent::ModalityDisabled { modality, reason });
    }

    /// Publishes the committed state advanced by every pending event.
    fn publish(&self) {
        let now = self.ctx.now_secs();
        let mut view = self.estimator.clone();
        let mut latest = self.counters.latest.clone();
        for event in &self.pending {
            match event {
                SensorEvent::Inertial(imu) => {
                    let _ = view.predict(imu);
                }
                SensorEvent::Ranging(sample) => {
                    let Some(accuracy) = self.accuracy(sample.modality()) else {
                        continue;
                    };
                    if view.correct(sample, accuracy).is_ok() {
                        latest.insert(sample.modality(), sample.clone());
                    }
                }
            }
        }

        let state = view.state();
        self.channels.snapshot_tx.send_replace(state.clone());

        let update = FusionUpdate {
            session_id: self.id,
            tick: self.counters.ticks,
            timestamp: now,
            distance_m: view.distance_along(&self.direction),
            confidence: view.session_confidence(now),
            state,
            latest,
            active_modalities: self.enabled_modalities(),
        };
        // No subscribers is fine
        let _ = self.channels.events_tx.send(SessionEvent::Update(update));
    }

    /// Collects in-flight measurements, commits what is left and releases
    /// every adapter, all within a bounded share of the stop timeout.
    async fn finish(mut self, termination: Termination) {
        self.channels.cancel.cancel();
        let ctx = self.ctx.clone();
        let stop_timeout = Duration::from_millis(self.config.stop_timeout_ms);

        // Measurement tasks watch the stop signal and return at once
        let collect_deadline = ctx.now() + stop_timeout / 4;
        while !self.in_flight.is_empty() {
            let wait = collect_deadline.saturating_sub(ctx.now());
            let received = tokio::select! {
                biased;
                measurement = self.results_rx.recv() => measurement,
                _ = ctx.sleep(wait) => None,
            };
            let Some(measurement) = received else {
                break;
            };
            self.in_flight.remove(&measurement.modality);
            if let Some(slot) = self.slot_mut(measurement.modality) {
                slot.adapter = Some(measurement.adapter);
            }
        }
        self.flush(true);

        let release_deadline = ctx.now() + stop_timeout / 2;
        for slot in self.slots.iter_mut() {
            let released = match slot.adapter.as_mut() {
                Some(adapter) => {
                    let budget = release_deadline.saturating_sub(ctx.now());
                    release(ctx.as_ref(), &mut **adapter, budget).await
                }
                // Disabled earlier and already accounted for
                None if !self.in_flight.contains_key(&slot.modality) => continue,
                // The measurement task releases it once it sees the worker gone
                None => false,
            };
            if !released {
                warn!("Session {}: {} not released in time, dropping it", self.id, slot.modality);
                slot.adapter = None;
                self.counters.unreleased.insert(slot.modality);
            }
        }

        let now = ctx.now_secs();
        let start_time = self.shared.get().start_time;
        self.shared.update(|s| s.status = SessionStatus::Stopped);

        let summary = SessionSummary {
            session_id: self.id,
            algorithm: self.estimator.algorithm(),
            requested_modalities: self.requested.clone(),
            final_modalities: self.enabled_modalities(),
            disabled: std::mem::take(&mut self.counters.disabled),
            duration_s: (now - start_time).max(0.0),
            ticks: self.counters.ticks,
            inertial_samples: self.counters.inertial,
            accepted: std::mem::take(&mut self.counters.accepted),
            rejected: std::mem::take(&mut self.counters.rejected),
            state_resets: self.estimator.resets(),
            final_state: self.estimator.state(),
            final_distance_m: self.estimator.distance_along(&self.direction),
            final_confidence: self.estimator.session_confidence(now),
            unreleased: self.counters.unreleased.iter().copied().collect(),
            termination,
        };
        info!(
            "Session {} ended ({:?}): {} ticks, {} samples fused, {:.3}m @ {:.2}",
            self.id,
            termination,
            summary.ticks,
            summary.total_accepted(),
            summary.final_distance_m,
            summary.final_confidence
        );

        let _ = self.channels.events_tx.send(SessionEvent::Ended(summary.clone()));
        let _ = self.channels.summary_tx.send(summary);
    }

    fn enabled_modalities(&self) -> Vec<Modality> {
        self.slots.iter().filter(|s| s.enabled).map(|s| s.modality).collect()
    }

    fn is_enabled(&self, modality: Modality) -> bool {
        self.slots.iter().any(|s| s.modality == modality && s.enabled)
    }

    fn accuracy(&self, modality: Modality) -> Option<f64> {
        self.slots
            .iter()
            .find(|s| s.modality == modality)
            .map(|s| s.capability.accuracy_m)
    }

    fn slot_mut(&mut self, modality: Modality) -> Option<&mut ModalitySlot> {
        self.slots.iter_mut().find(|s| s.modality == modality)
    }
}

/// Resolves once a stop is requested or the manager is gone.
async fn stop_requested(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// `stop_session` bounded by `budget`; false if it did not return in time.
async fn release<Ctx: ScanContext>(ctx: &Ctx, adapter: &mut dyn RangingAdapter, budget: Duration) -> bool {
    tokio::select! {
        biased;
        _ = adapter.stop_session() => true,
        _ = ctx.sleep(budget) => false,
    }
}
