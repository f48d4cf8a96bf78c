//! The Session Manager - lifecycle, gating and the sampling worker.
//!
//! # State machine
//!
//! ```text
//!          start()                 gating ok               stop()
//!   Idle ──────────► Initializing ─────────► Active ─────────────► Stopping ──► Stopped
//!                        │                     │                                 ▲
//!                        │ required modality   │ every modality disabled         │
//!                        ▼ failed              └─────────────────────────────────┘
//!                      Idle (error, nothing left acquired)
//! ```
//!
//! Gating per requested modality, in canonical order:
//! 1. capability (present on the device)
//! 2. permission for every piece of hardware it needs
//! 3. adapter `initialize()` then `start_session()`
//!
//! An optional modality that fails any step is dropped with a warning. A
//! required one aborts the start and releases whatever was already acquired.

use nalgebra::{Unit, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

use echoscan_env::{PermissionGate, ScanContext, SessionId};

use crate::adapters::{AdapterProvider, RangingAdapter};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::{RangingError, SessionError};
use crate::fusion::{FusionAlgorithm, FusionEstimator, FusionState};
use crate::reporter::CapabilityReporter;
use crate::types::{DeviceCapabilities, InertialSample, Modality, ModalityCapability, RangingSample};

mod worker;

use worker::{SessionWorker, WorkerChannels};

/// Default target update rate for `SessionRequest::new`.
pub const DEFAULT_UPDATE_RATE_HZ: f64 = 20.0;

// ============================================================================
// SESSION DATA
// ============================================================================

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Idle,
    Initializing,
    Active,
    Stopping,
    Stopped,
}

impl SessionStatus {
    /// Returns true once the session can no longer produce updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped)
    }
}

/// Caller-visible description of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangingSession {
    pub id: SessionId,
    pub active_modalities: BTreeSet<Modality>,
    pub algorithm: FusionAlgorithm,
    pub target_update_rate_hz: f64,
    /// Context time at start (seconds)
    pub start_time: f64,
    pub status: SessionStatus,
}

/// What to start.
///
/// Modalities in `optional` may be dropped during gating; everything else
/// in `modalities` is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub modalities: BTreeSet<Modality>,
    pub optional: BTreeSet<Modality>,
    pub algorithm: FusionAlgorithm,
    pub update_rate_hz: f64,
}

impl SessionRequest {
    /// All given modalities required, Kalman fusion, 20 Hz.
    pub fn new(modalities: impl IntoIterator<Item = Modality>) -> Self {
        Self {
            modalities: modalities.into_iter().collect(),
            optional: BTreeSet::new(),
            algorithm: FusionAlgorithm::default(),
            update_rate_hz: DEFAULT_UPDATE_RATE_HZ,
        }
    }

    pub fn with_optional(mut self, modalities: impl IntoIterator<Item = Modality>) -> Self {
        for modality in modalities {
            self.modalities.insert(modality);
            self.optional.insert(modality);
        }
        self
    }

    pub fn with_algorithm(mut self, algorithm: FusionAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_update_rate(mut self, hz: f64) -> Self {
        self.update_rate_hz = hz;
        self
    }

    pub fn is_optional(&self, modality: Modality) -> bool {
        self.optional.contains(&modality)
    }
}

/// Externally delivered sensor data, fused with the session's own
/// measurements in timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Inertial(InertialSample),
    Ranging(RangingSample),
}

impl SensorEvent {
    pub fn timestamp(&self) -> f64 {
        match self {
            SensorEvent::Inertial(imu) => imu.timestamp,
            SensorEvent::Ranging(sample) => sample.timestamp(),
        }
    }
}

/// Published whenever new samples reached the session.
///
/// The state includes samples still waiting for an older in-flight
/// measurement; the summary only ever reflects committed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionUpdate {
    pub session_id: SessionId,
    pub tick: u64,
    /// Context time of publication (seconds)
    pub timestamp: f64,
    pub state: FusionState,
    /// Fused distance along the session boresight
    pub distance_m: f64,
    pub confidence: f64,
    /// Latest accepted sample per modality
    pub latest: BTreeMap<Modality, RangingSample>,
    pub active_modalities: Vec<Modality>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// `stop()` was called (or the manager went away)
    Requested,
    /// Every modality was disabled
    ModalitiesExhausted,
}

/// Terminal report of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub algorithm: FusionAlgorithm,
    pub requested_modalities: Vec<Modality>,
    pub final_modalities: Vec<Modality>,
    /// Modalities disabled mid-session, with the reason
    pub disabled: BTreeMap<Modality, String>,
    pub duration_s: f64,
    pub ticks: u64,
    pub inertial_samples: u64,
    /// Samples fused, per modality
    pub accepted: BTreeMap<Modality, u64>,
    /// Failed measurements and samples refused by range or fusion checks
    pub rejected: BTreeMap<Modality, u64>,
    pub state_resets: u32,
    pub final_state: FusionState,
    /// Fused distance along the session boresight at the end
    pub final_distance_m: f64,
    pub final_confidence: f64,
    /// Adapters whose `stop_session` did not return in time and were dropped
    #[serde(default)]
    pub unreleased: Vec<Modality>,
    pub termination: Termination,
}

impl SessionSummary {
    pub fn total_accepted(&self) -> u64 {
        self.accepted.values().sum()
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }
}

/// Session event stream item.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Update(FusionUpdate),
    ModalityDisabled { modality: Modality, reason: String },
    StateReset { reason: String },
    Ended(SessionSummary),
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Session description shared between the manager and its worker.
#[derive(Debug, Clone)]
pub(crate) struct SharedSession(Arc<Mutex<RangingSession>>);

impl SharedSession {
    fn new(session: RangingSession) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    fn lock(&self) -> MutexGuard<'_, RangingSession> {
        // A panicked holder cannot leave the description half-written
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn get(&self) -> RangingSession {
        self.lock().clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut RangingSession)) {
        f(&mut self.lock());
    }
}

/// One acquired modality inside a running session.
pub(crate) struct ModalitySlot {
    pub(crate) modality: Modality,
    /// `None` while a measurement task holds it, or once it was dropped
    pub(crate) adapter: Option<Box<dyn RangingAdapter>>,
    pub(crate) capability: ModalityCapability,
    pub(crate) consecutive_failures: u32,
    pub(crate) enabled: bool,
}

/// Manager-side handle to a running (or finished) session.
struct SessionHandle {
    shared: SharedSession,
    cancel: CancelToken,
    stop_tx: watch::Sender<bool>,
    summary_rx: Option<oneshot::Receiver<SessionSummary>>,
    summary: Option<SessionSummary>,
    snapshot_rx: watch::Receiver<FusionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    sensor_tx: mpsc::Sender<SensorEvent>,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Owns every session started through it.
pub struct SessionManager<Ctx: ScanContext, P: PermissionGate> {
    ctx: Arc<Ctx>,
    permissions: Arc<P>,
    provider: Arc<dyn AdapterProvider>,
    config: EngineConfig,
    reporter: CapabilityReporter,
    sessions: HashMap<SessionId, SessionHandle>,
    /// Stopped sessions, oldest first; evicted past the retention limit
    retired: VecDeque<SessionId>,
}

impl<Ctx: ScanContext, P: PermissionGate> SessionManager<Ctx, P> {
    /// Validates the configuration and runs capability detection.
    pub async fn initialize(
        ctx: Arc<Ctx>,
        permissions: Arc<P>,
        provider: Arc<dyn AdapterProvider>,
        config: EngineConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let reporter = CapabilityReporter::detect(provider.as_ref(), &config).await;
        Ok(Self {
            ctx,
            permissions,
            provider,
            config,
            reporter,
            sessions: HashMap::new(),
            retired: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    /// Cached device capabilities.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.reporter.capabilities()
    }

    /// Re-probes the device capabilities.
    pub async fn reinitialize(&mut self) -> &DeviceCapabilities {
        self.reporter.reinitialize(self.provider.as_ref(), &self.config).await
    }

    /// Ids of every session this manager knows about.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Starts a session. See the module docs for the gating rules.
    pub async fn start(&mut self, request: SessionRequest) -> Result<SessionId, SessionError> {
        let rate = request.update_rate_hz;
        if !(rate.is_finite() && rate > 0.0 && rate <= self.config.session.max_update_rate_hz) {
            return Err(SessionError::invalid_config(format!(
                "update rate {} Hz outside (0, {}]",
                rate, self.config.session.max_update_rate_hz
            )));
        }
        if request.modalities.is_empty() {
            return Err(SessionError::NoUsableModalities);
        }

        let id = self.ctx.new_session_id();
        let shared = SharedSession::new(RangingSession {
            id,
            active_modalities: BTreeSet::new(),
            algorithm: request.algorithm,
            target_update_rate_hz: rate,
            start_time: self.ctx.now_secs(),
            status: SessionStatus::Initializing,
        });
        info!(
            "Session {} initializing: {:?} ({}, {} Hz)",
            id, request.modalities, request.algorithm, rate
        );

        let slots = match self.acquire(id, &request).await {
            Ok(slots) => slots,
            Err(e) => {
                shared.update(|s| s.status = SessionStatus::Idle);
                warn!("Session {} failed to start: {}", id, e);
                return Err(e);
            }
        };

        let active: BTreeSet<Modality> = slots.iter().map(|s| s.modality).collect();
        let start_time = self.ctx.now_secs();
        shared.update(|s| {
            s.active_modalities = active.clone();
            s.start_time = start_time;
            s.status = SessionStatus::Active;
        });

        let estimator = FusionEstimator::new(
            request.algorithm,
            self.config.fusion.clone(),
            self.config.confidence.clone(),
            start_time,
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(estimator.state());
        let (events_tx, _) = broadcast::channel(self.config.session.event_buffer);
        let (sensor_tx, sensor_rx) = mpsc::channel(self.config.session.sensor_buffer);
        let (summary_tx, summary_rx) = oneshot::channel();
        let cancel = CancelToken::new();

        let worker = SessionWorker::new(
            self.ctx.clone(),
            self.config.session.clone(),
            shared.clone(),
            request.modalities.iter().copied().collect(),
            slots,
            estimator,
            WorkerChannels {
                cancel: cancel.clone(),
                stop_rx,
                sensor_rx,
                snapshot_tx,
                events_tx: events_tx.clone(),
                summary_tx,
            },
        );
        self.ctx.spawn(&format!("session-{}", id), worker.run());

        self.sessions.insert(
            id,
            SessionHandle {
                shared,
                cancel,
                stop_tx,
                summary_rx: Some(summary_rx),
                summary: None,
                snapshot_rx,
                events_tx,
                sensor_tx,
            },
        );
        info!("Session {} active with {:?}", id, active);
        Ok(id)
    }

    /// Stops a session and returns its summary.
    ///
    /// Idempotent while the session is retained: later calls return the
    /// identical summary. Only the most recent `max_retained_sessions`
    /// stopped sessions are kept; older ones become unknown. Adapters are
    /// released (or dropped and listed in `unreleased`) before the first
    /// call returns.
    pub async fn stop(&mut self, id: SessionId) -> Result<SessionSummary, SessionError> {
        let timeout = Duration::from_millis(self.config.session.stop_timeout_ms);
        let ctx = self.ctx.clone();
        let handle = self.sessions.get_mut(&id).ok_or(SessionError::UnknownSession(id))?;

        if let Some(summary) = &handle.summary {
            return Ok(summary.clone());
        }

        handle.shared.update(|s| {
            if !s.status.is_terminal() {
                s.status = SessionStatus::Stopping;
            }
        });
        handle.cancel.cancel();
        // The worker may already have ended on its own
        let _ = handle.stop_tx.send(true);

        let Some(summary_rx) = handle.summary_rx.as_mut() else {
            return Err(SessionError::lifecycle(format!("session {} has no worker", id)));
        };

        let received = tokio::select! {
            biased;
            result = summary_rx => Some(result),
            _ = ctx.sleep(timeout) => None,
        };

        let result = match received {
            Some(Ok(summary)) => {
                handle.summary_rx = None;
                handle.summary = Some(summary.clone());
                if !summary.unreleased.is_empty() {
                    warn!("Session {}: dropped unreleased adapters {:?}", id, summary.unreleased);
                }
                info!("Session {} stopped after {:.2}s", id, summary.duration_s);
                Ok(summary)
            }
            Some(Err(_)) => {
                handle.summary_rx = None;
                handle.shared.update(|s| s.status = SessionStatus::Stopped);
                Err(SessionError::lifecycle(format!("session {} worker exited without a summary", id)))
            }
            None => {
                return Err(SessionError::lifecycle(format!(
                    "session {} did not stop within {}ms",
                    id, self.config.session.stop_timeout_ms
                )))
            }
        };

        self.retire(id);
        result
    }

    /// Records a finished session and evicts the oldest past the limit.
    fn retire(&mut self, id: SessionId) {
        self.retired.push_back(id);
        while self.retired.len() > self.config.session.max_retained_sessions {
            if let Some(evicted) = self.retired.pop_front() {
                self.sessions.remove(&evicted);
            }
        }
    }

    pub fn status(&self, id: SessionId) -> Result<SessionStatus, SessionError> {
        Ok(self.handle(id)?.shared.get().status)
    }

    pub fn session(&self, id: SessionId) -> Result<RangingSession, SessionError> {
        Ok(self.handle(id)?.shared.get())
    }

    /// Latest fusion state (a copy).
    pub fn snapshot(&self, id: SessionId) -> Result<FusionState, SessionError> {
        Ok(self.handle(id)?.snapshot_rx.borrow().clone())
    }

    /// Subscribes to the session event stream.
    ///
    /// Slow receivers lag (and skip events) instead of blocking the worker.
    pub fn subscribe(&self, id: SessionId) -> Result<broadcast::Receiver<SessionEvent>, SessionError> {
        Ok(self.handle(id)?.events_tx.subscribe())
    }

    /// Queue for platform or synthetic sensor events.
    pub fn sensor_sender(&self, id: SessionId) -> Result<mpsc::Sender<SensorEvent>, SessionError> {
        Ok(self.handle(id)?.sensor_tx.clone())
    }

    fn handle(&self, id: SessionId) -> Result<&SessionHandle, SessionError> {
        self.sessions.get(&id).ok_or(SessionError::UnknownSession(id))
    }

    /// A live session currently holding the audio transducer, if any.
    fn audio_in_use(&self) -> Option<SessionId> {
        self.sessions.iter().find_map(|(id, handle)| {
            let session = handle.shared.get();
            let live = !session.status.is_terminal() && handle.summary.is_none();
            (live && session.active_modalities.iter().any(|m| m.uses_audio())).then_some(*id)
        })
    }

    /// Gating: capability, permission, initialize, start.
    async fn acquire(&self, id: SessionId, request: &SessionRequest) -> Result<Vec<ModalitySlot>, SessionError> {
        let mut slots: Vec<ModalitySlot> = Vec::new();

        for &modality in &request.modalities {
            match self.acquire_one(modality).await {
                Ok(slot) => slots.push(slot),
                Err(e) if request.is_optional(modality) => {
                    warn!("Session {}: dropping optional {}: {}", id, modality, e);
                }
                Err(e) => {
                    release_all(&mut slots).await;
                    return Err(e);
                }
            }
        }

        if slots.is_empty() {
            return Err(SessionError::NoUsableModalities);
        }
        Ok(slots)
    }

    async fn acquire_one(&self, modality: Modality) -> Result<ModalitySlot, SessionError> {
        if !self.reporter.capabilities().supports(modality) {
            return Err(SessionError::HardwareUnavailable(modality));
        }
        if modality.uses_audio() {
            if let Some(holder) = self.audio_in_use() {
                warn!("audio transducer is held by session {}", holder);
                return Err(SessionError::HardwareUnavailable(modality));
            }
        }

        for &hardware in modality.required_hardware() {
            if !self.permissions.request(hardware).await.is_granted() {
                return Err(SessionError::PermissionDenied { modality, hardware });
            }
        }

        let mut adapter = self
            .provider
            .create(modality, &self.config)
            .ok_or(SessionError::HardwareUnavailable(modality))?;

        let capability = adapter
            .initialize()
            .await
            .map_err(|source| init_error(modality, source))?;

        if let Err(source) = adapter.start_session().await {
            adapter.stop_session().await;
            return Err(init_error(modality, source));
        }

        Ok(ModalitySlot {
            modality,
            adapter: Some(adapter),
            capability,
            consecutive_failures: 0,
            enabled: true,
        })
    }
}

fn init_error(modality: Modality, source: RangingError) -> SessionError {
    match source {
        RangingError::HardwareUnavailable(m) => SessionError::HardwareUnavailable(m),
        RangingError::PermissionDenied(hardware) => SessionError::PermissionDenied { modality, hardware },
        source => SessionError::InitializationFailed { modality, source },
    }
}

async fn release_all(slots: &mut [ModalitySlot]) {
    for adapter in slots.iter_mut().filter_map(|s| s.adapter.as_mut()) {
        adapter.stop_session().await;
    }
}

/// Parses the configured boresight, falling back to body +X.
pub(crate) fn boresight(config: &crate::config::SessionConfig) -> Unit<Vector3<f64>> {
    Unit::try_new(Vector3::from(config.boresight), 1e-9).unwrap_or_else(Vector3::x_axis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DistanceRange;
    use async_trait::async_trait;
    use echoscan_env::{GrantAll, Hardware, PermissionStatus, TokioContext};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Debug, Clone)]
    enum Behaviour {
        Distance(f64),
        /// Stamped when the measurement starts, returned `after` later
        Slow(f64, Duration),
        Fail(RangingError),
        Hang,
    }

    #[derive(Debug, Clone)]
    struct Fake {
        fail_start: bool,
        hang_stop: bool,
        behaviour: Behaviour,
    }

    fn fake(behaviour: Behaviour) -> Fake {
        Fake {
            fail_start: false,
            hang_stop: false,
            behaviour,
        }
    }

    struct ScriptedAdapter {
        modality: Modality,
        fake: Fake,
        ctx: Arc<TokioContext>,
        log: Log,
        active: bool,
    }

    #[async_trait]
    impl RangingAdapter for ScriptedAdapter {
        fn modality(&self) -> Modality {
            self.modality
        }

        async fn initialize(&mut self) -> Result<ModalityCapability, RangingError> {
            Ok(ModalityCapability {
                modality: self.modality,
                range: DistanceRange::new(0.1, 5.0),
                accuracy_m: 0.01,
            })
        }

        async fn start_session(&mut self) -> Result<(), RangingError> {
            if self.fake.fail_start {
                return Err(RangingError::device("busy"));
            }
            self.active = true;
            self.log.lock().unwrap().push(format!("start {}", self.modality));
            Ok(())
        }

        async fn measure(&mut self, direction: Unit<Vector3<f64>>, _cancel: &CancelToken) -> Result<RangingSample, RangingError> {
            match &self.fake.behaviour {
                Behaviour::Distance(d) => Ok(RangingSample::new(self.modality, *d, 0.9, self.ctx.now_secs(), direction)),
                Behaviour::Slow(d, after) => {
                    let started = self.ctx.now_secs();
                    self.ctx.sleep(*after).await;
                    Ok(RangingSample::new(self.modality, *d, 0.9, started, direction))
                }
                Behaviour::Fail(e) => Err(e.clone()),
                Behaviour::Hang => std::future::pending().await,
            }
        }

        async fn stop_session(&mut self) {
            if self.fake.hang_stop {
                std::future::pending::<()>().await;
            }
            if self.active {
                self.active = false;
                self.log.lock().unwrap().push(format!("stop {}", self.modality));
            }
        }
    }

    impl Drop for ScriptedAdapter {
        fn drop(&mut self) {
            if self.active {
                self.log.lock().unwrap().push(format!("drop {}", self.modality));
            }
        }
    }

    struct TestProvider {
        ctx: Arc<TokioContext>,
        fakes: BTreeMap<Modality, Fake>,
        log: Log,
    }

    impl AdapterProvider for TestProvider {
        fn create(&self, modality: Modality, _config: &EngineConfig) -> Option<Box<dyn RangingAdapter>> {
            let fake = self.fakes.get(&modality)?.clone();
            Some(Box::new(ScriptedAdapter {
                modality,
                fake,
                ctx: self.ctx.clone(),
                log: self.log.clone(),
                active: false,
            }))
        }
    }

    struct DenyGate(Hardware);

    #[async_trait]
    impl PermissionGate for DenyGate {
        async fn request(&self, hardware: Hardware) -> PermissionStatus {
            if hardware == self.0 {
                PermissionStatus::Denied
            } else {
                PermissionStatus::Granted
            }
        }
    }

    async fn manager<P: PermissionGate>(
        gate: P,
        fakes: Vec<(Modality, Fake)>,
    ) -> (SessionManager<TokioContext, P>, Log) {
        manager_with(gate, fakes, EngineConfig::default()).await
    }

    async fn manager_with<P: PermissionGate>(
        gate: P,
        fakes: Vec<(Modality, Fake)>,
        config: EngineConfig,
    ) -> (SessionManager<TokioContext, P>, Log) {
        let ctx = TokioContext::shared();
        let log = Log::default();
        let provider = TestProvider {
            ctx: ctx.clone(),
            fakes: fakes.into_iter().collect(),
            log: log.clone(),
        };
        let manager = SessionManager::initialize(ctx, Arc::new(gate), Arc::new(provider), config)
            .await
            .unwrap();
        (manager, log)
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_modalities_fuse_to_wall_distance() {
        let (mut manager, _log) = manager(
            GrantAll,
            vec![
                (Modality::Sonar, fake(Behaviour::Distance(2.0))),
                (Modality::Tof, fake(Behaviour::Distance(2.02))),
            ],
        )
        .await;

        let id = manager.start(SessionRequest::new([Modality::Sonar, Modality::Tof])).await.unwrap();
        let mut events = manager.subscribe(id).unwrap();
        assert_eq!(manager.status(id).unwrap(), SessionStatus::Active);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = manager.snapshot(id).unwrap();
        assert!((snapshot.distance_along(&Vector3::x_axis()) - 2.01).abs() < 0.05);

        let summary = manager.stop(id).await.unwrap();
        assert_eq!(summary.termination, Termination::Requested);
        assert_eq!(summary.final_modalities, vec![Modality::Sonar, Modality::Tof]);
        assert!((summary.final_distance_m - 2.01).abs() < 0.05);
        assert!(summary.final_confidence >= 0.8, "confidence {}", summary.final_confidence);
        assert!(summary.accepted[&Modality::Sonar] >= 10);

        let events = drain(&mut events);
        let updates = events.iter().filter(|e| matches!(e, SessionEvent::Update(_))).count();
        assert!(updates >= 10);
        assert!(matches!(events.last(), Some(SessionEvent::Ended(s)) if *s == summary));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_samples_fuse_end_to_end() {
        // Adapters never answer; only the injected samples reach the filter
        let (mut manager, _log) = manager(
            GrantAll,
            vec![
                (Modality::Sonar, fake(Behaviour::Hang)),
                (Modality::Tof, fake(Behaviour::Hang)),
            ],
        )
        .await;
        let id = manager.start(SessionRequest::new([Modality::Sonar, Modality::Tof])).await.unwrap();
        let mut events = manager.subscribe(id).unwrap();
        let sensors = manager.sensor_sender(id).unwrap();

        for i in 0..10 {
            let (modality, distance) = if i % 2 == 0 { (Modality::Sonar, 2.02) } else { (Modality::Tof, 1.98) };
            let sample = RangingSample::new(modality, distance, 0.85, 0.001 * i as f64, Vector3::x_axis());
            sensors.send(SensorEvent::Ranging(sample)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let update = drain(&mut events)
            .into_iter()
            .find_map(|e| match e {
                SessionEvent::Update(update) => Some(update),
                _ => None,
            })
            .unwrap();
        assert!((update.distance_m - 2.0).abs() < 0.05, "distance {}", update.distance_m);
        assert!(update.confidence >= 0.8, "confidence {}", update.confidence);
        assert_eq!(update.latest.len(), 2);

        let summary = manager.stop(id).await.unwrap();
        assert_eq!(summary.total_accepted(), 10);
        assert_eq!(summary.total_rejected(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_releases_hardware() {
        let (mut manager, log) = manager(GrantAll, vec![(Modality::Sonar, fake(Behaviour::Distance(1.5)))]).await;
        let id = manager.start(SessionRequest::new([Modality::Sonar])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let first = manager.stop(id).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["start sonar", "stop sonar"]);
        assert_eq!(manager.status(id).unwrap(), SessionStatus::Stopped);

        let second = manager.stop(id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_modality_dropped_on_denial() {
        let (mut manager, _log) = manager(
            DenyGate(Hardware::Camera),
            vec![
                (Modality::Sonar, fake(Behaviour::Distance(2.0))),
                (Modality::Depth, fake(Behaviour::Distance(2.0))),
            ],
        )
        .await;

        let request = SessionRequest::new([Modality::Sonar]).with_optional([Modality::Depth]);
        let id = manager.start(request).await.unwrap();
        let session = manager.session(id).unwrap();
        assert_eq!(session.active_modalities, BTreeSet::from([Modality::Sonar]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_permission_denied() {
        let (mut manager, log) = manager(
            DenyGate(Hardware::Microphone),
            vec![(Modality::Sonar, fake(Behaviour::Distance(2.0)))],
        )
        .await;

        let err = manager.start(SessionRequest::new([Modality::Sonar])).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::PermissionDenied {
                modality: Modality::Sonar,
                hardware: Hardware::Microphone
            }
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_start_failure_releases_acquired() {
        let (mut manager, log) = manager(
            GrantAll,
            vec![
                (Modality::Sonar, fake(Behaviour::Distance(2.0))),
                (
                    Modality::Tof,
                    Fake {
                        fail_start: true,
                        ..fake(Behaviour::Distance(2.0))
                    },
                ),
            ],
        )
        .await;

        let err = manager
            .start(SessionRequest::new([Modality::Sonar, Modality::Tof]))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InitializationFailed { modality: Modality::Tof, .. }));
        assert_eq!(*log.lock().unwrap(), vec!["start sonar", "stop sonar"]);
        assert!(manager.session_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_ends_when_every_modality_fails() {
        let (mut manager, log) = manager(GrantAll, vec![(Modality::Sonar, fake(Behaviour::Fail(RangingError::NoEcho)))]).await;
        let id = manager.start(SessionRequest::new([Modality::Sonar])).await.unwrap();
        let mut events = manager.subscribe(id).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.status(id).unwrap(), SessionStatus::Stopped);

        let summary = manager.stop(id).await.unwrap();
        assert_eq!(summary.termination, Termination::ModalitiesExhausted);
        assert!(summary.final_modalities.is_empty());
        assert!(summary.disabled.contains_key(&Modality::Sonar));
        assert_eq!(summary.rejected[&Modality::Sonar], 3);
        assert_eq!(*log.lock().unwrap(), vec!["start sonar", "stop sonar"]);

        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ModalityDisabled { modality: Modality::Sonar, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_adapter_times_out_and_is_disabled() {
        let (mut manager, _log) = manager(
            GrantAll,
            vec![
                (Modality::Sonar, fake(Behaviour::Distance(2.0))),
                (Modality::Tof, fake(Behaviour::Hang)),
            ],
        )
        .await;
        let id = manager.start(SessionRequest::new([Modality::Sonar, Modality::Tof])).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let session = manager.session(id).unwrap();
        assert_eq!(session.active_modalities, BTreeSet::from([Modality::Sonar]));
        assert_eq!(session.status, SessionStatus::Active);

        let summary = manager.stop(id).await.unwrap();
        assert_eq!(summary.termination, Termination::Requested);
        assert_eq!(summary.rejected[&Modality::Tof], 3);
        assert!(summary.disabled[&Modality::Tof].contains("Capture timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_inertial_sample_resets_state() {
        let (mut manager, _log) = manager(GrantAll, vec![(Modality::Tof, fake(Behaviour::Distance(1.0)))]).await;
        let id = manager.start(SessionRequest::new([Modality::Tof])).await.unwrap();
        let mut events = manager.subscribe(id).unwrap();
        let sensors = manager.sensor_sender(id).unwrap();

        // Arrives a full second after newer samples were committed
        tokio::time::sleep(Duration::from_secs(1)).await;
        sensors
            .send(SensorEvent::Inertial(InertialSample::stationary(0.2, 9.80665)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let summary = manager.stop(id).await.unwrap();
        assert_eq!(summary.state_resets, 1);
        assert_eq!(summary.inertial_samples, 1);
        assert!(summary.final_state.last_update >= 1.0);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::StateReset { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reordered_batch_is_fused_in_timestamp_order() {
        let (mut manager, _log) = manager(GrantAll, vec![(Modality::Tof, fake(Behaviour::Hang))]).await;
        let id = manager.start(SessionRequest::new([Modality::Tof])).await.unwrap();
        let sensors = manager.sensor_sender(id).unwrap();

        for t in [0.004, 0.001, 0.003, 0.002] {
            sensors
                .send(SensorEvent::Inertial(InertialSample::stationary(t, 9.80665)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let summary = manager.stop(id).await.unwrap();
        assert_eq!(summary.inertial_samples, 4);
        assert_eq!(summary.state_resets, 0);
        assert_eq!(summary.final_state.last_update, 0.004);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inertial_stream_with_slow_ranging_never_resets() {
        let (mut manager, _log) = manager(
            GrantAll,
            vec![(Modality::Tof, fake(Behaviour::Slow(1.0, Duration::from_millis(20))))],
        )
        .await;
        let id = manager.start(SessionRequest::new([Modality::Tof])).await.unwrap();
        let sensors = manager.sensor_sender(id).unwrap();

        // 100 Hz IMU, stamped on the same clock as the measurements
        let ctx = manager.context().clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let imu = InertialSample::stationary(ctx.now_secs(), 9.80665);
                if sensors.send(SensorEvent::Inertial(imu)).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_secs(2)).await;

        let summary = manager.stop(id).await.unwrap();
        assert_eq!(summary.state_resets, 0);
        assert!(summary.inertial_samples >= 190, "{} inertial", summary.inertial_samples);
        assert!(summary.accepted[&Modality::Tof] >= 30, "{:?}", summary.accepted);
        assert_eq!(summary.total_rejected(), 0);
        assert!((summary.final_distance_m - 1.0).abs() < 0.05, "distance {}", summary.final_distance_m);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sonar_does_not_throttle_tof() {
        let (mut manager, _log) = manager(
            GrantAll,
            vec![
                (Modality::Sonar, fake(Behaviour::Slow(2.0, Duration::from_secs(1)))),
                (Modality::Tof, fake(Behaviour::Distance(2.0))),
            ],
        )
        .await;
        let id = manager.start(SessionRequest::new([Modality::Sonar, Modality::Tof])).await.unwrap();

        // Mid-way through a sonar measurement, fresh ToF still gets published
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let mut events = manager.subscribe(id).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = manager.context().now_secs();
        let update = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Update(update) => Some(update),
                _ => None,
            })
            .last()
            .unwrap();
        let tof = update.latest[&Modality::Tof].timestamp();
        assert!(tof > now - 0.1, "ToF sample from {} published at {}", tof, now);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        let summary = manager.stop(id).await.unwrap();
        // 20 Hz for 3 s, against one sonar reading per second
        assert!(summary.accepted[&Modality::Tof] >= 50, "{:?}", summary.accepted);
        assert!(summary.accepted[&Modality::Sonar] >= 2, "{:?}", summary.accepted);
        assert_eq!(summary.state_resets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_measurement_in_flight() {
        let (mut manager, log) = manager(GrantAll, vec![(Modality::Tof, fake(Behaviour::Hang))]).await;
        let id = manager.start(SessionRequest::new([Modality::Tof])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let before = tokio::time::Instant::now();
        let summary = manager.stop(id).await.unwrap();
        assert!(before.elapsed() < Duration::from_millis(10));
        assert!(summary.unreleased.is_empty());
        assert_eq!(summary.total_rejected(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["start tof", "stop tof"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_release_is_dropped_within_stop_timeout() {
        let stuck = Fake {
            hang_stop: true,
            ..fake(Behaviour::Distance(1.5))
        };
        let (mut manager, log) = manager(GrantAll, vec![(Modality::Sonar, stuck)]).await;
        let id = manager.start(SessionRequest::new([Modality::Sonar])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let before = tokio::time::Instant::now();
        let summary = manager.stop(id).await.unwrap();
        let limit = Duration::from_millis(manager.config().session.stop_timeout_ms);
        assert!(before.elapsed() < limit);
        assert_eq!(summary.unreleased, vec![Modality::Sonar]);
        assert_eq!(*log.lock().unwrap(), vec!["start sonar", "drop sonar"]);
        assert_eq!(manager.status(id).unwrap(), SessionStatus::Stopped);

        // The transducer is free again
        assert!(manager.start(SessionRequest::new([Modality::Sonar])).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sessions_are_evicted_past_retention() {
        let mut config = EngineConfig::default();
        config.session.max_retained_sessions = 2;
        let (mut manager, _log) =
            manager_with(GrantAll, vec![(Modality::Tof, fake(Behaviour::Distance(1.0)))], config).await;

        let mut ids = Vec::new();
        let mut summaries = Vec::new();
        for _ in 0..3 {
            let id = manager.start(SessionRequest::new([Modality::Tof])).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            summaries.push(manager.stop(id).await.unwrap());
            ids.push(id);
        }

        assert_eq!(manager.session_ids().len(), 2);
        assert_eq!(manager.stop(ids[0]).await.unwrap_err(), SessionError::UnknownSession(ids[0]));
        assert_eq!(manager.stop(ids[1]).await.unwrap(), summaries[1]);
        assert_eq!(manager.stop(ids[2]).await.unwrap(), summaries[2]);

        // Repeated stops do not evict anything further
        assert_eq!(manager.session_ids().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_transducer_is_exclusive() {
        let (mut manager, _log) = manager(GrantAll, vec![(Modality::Sonar, fake(Behaviour::Distance(2.0)))]).await;
        let first = manager.start(SessionRequest::new([Modality::Sonar])).await.unwrap();

        let err = manager.start(SessionRequest::new([Modality::Sonar])).await.unwrap_err();
        assert_eq!(err, SessionError::HardwareUnavailable(Modality::Sonar));

        manager.stop(first).await.unwrap();
        assert!(manager.start(SessionRequest::new([Modality::Sonar])).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_validation() {
        let (mut manager, _log) = manager(GrantAll, vec![(Modality::Sonar, fake(Behaviour::Distance(2.0)))]).await;

        let empty = SessionRequest::new(Vec::<Modality>::new());
        assert_eq!(manager.start(empty).await.unwrap_err(), SessionError::NoUsableModalities);

        let absent_optional = SessionRequest::new(Vec::<Modality>::new()).with_optional([Modality::Depth]);
        assert_eq!(manager.start(absent_optional).await.unwrap_err(), SessionError::NoUsableModalities);

        let absent = SessionRequest::new([Modality::Depth]);
        assert_eq!(
            manager.start(absent).await.unwrap_err(),
            SessionError::HardwareUnavailable(Modality::Depth)
        );

        for rate in [0.0, 500.0, f64::NAN] {
            let request = SessionRequest::new([Modality::Sonar]).with_update_rate(rate);
            assert!(matches!(manager.start(request).await, Err(SessionError::InvalidConfig(_))));
        }

        let unknown = SessionId::new();
        assert_eq!(manager.stop(unknown).await.unwrap_err(), SessionError::UnknownSession(unknown));
        assert!(matches!(manager.snapshot(unknown), Err(SessionError::UnknownSession(_))));
    }
}
