//! Scenario runner - drives the real session manager against a simulated room.

use crate::context::SimContext;
use crate::devices::{FaultProfile, ScriptedPermissions, SimAdapterProvider};
use crate::room::{Room, Trajectory};
use crate::scenarios::ScenarioId;

use echoscan_core::{
    EngineConfig, FusionAlgorithm, Modality, SensorEvent, SessionError, SessionManager, SessionRequest,
    SessionStatus, SessionSummary, Termination,
};
use echoscan_env::{Hardware, ScanContext, SessionId};
use nalgebra::Vector3;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// IMU feed period (100 Hz)
const IMU_PERIOD: Duration = Duration::from_millis(10);

/// RNG streams for IMU feeders start here, clear of the device streams
const IMU_STREAM_BASE: u64 = 1 << 32;

/// Fused-vs-true distance tolerance for a still device (m)
const STATIC_TOLERANCE_M: f64 = 0.05;

/// Fused-vs-true distance tolerance after a walk (m)
const MOVING_TOLERANCE_M: f64 = 0.1;

/// Minimum session confidence with every modality healthy
const MIN_STATIC_CONFIDENCE: f64 = 0.5;

/// Orientation drift allowed for the orientation-only filter (rad)
const MAX_ORIENTATION_DRIFT_RAD: f64 = 0.05;

/// Engine configuration tuned for simulation.
///
/// Sonar captures are shortened to 150 ms: long enough for a 20 m round
/// trip, short enough to keep the worker near its tick rate.
pub fn sim_engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sonar.capture_duration_s = 0.15;
    config
}

/// Errors that abort a scenario before its checks run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// True distance to the wall at the end, if the device was in the room
    pub true_distance_m: Option<f64>,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// One summary per session the scenario ran
    pub summaries: Vec<SessionSummary>,
}

impl ScenarioResult {
    /// Fused distance reported by the last session.
    pub fn final_distance_m(&self) -> Option<f64> {
        self.summaries.last().map(|s| s.final_distance_m)
    }
}

/// What a scenario body hands back to the runner.
#[derive(Debug, Default)]
struct Outcome {
    final_time_secs: f64,
    true_distance_m: Option<f64>,
    summaries: Vec<SessionSummary>,
    failures: Vec<String>,
}

impl Outcome {
    fn check(&mut self, ok: bool, message: impl FnOnce() -> String) {
        if !ok {
            let message = message();
            debug!("check failed: {}", message);
            self.failures.push(message);
        }
    }

    fn check_distance(&mut self, summary: &SessionSummary, truth: Option<f64>, tolerance: f64) {
        match truth {
            Some(truth) => {
                let err = (summary.final_distance_m - truth).abs();
                self.check(err < tolerance, || {
                    format!(
                        "{} distance {:.3}m vs truth {:.3}m (err {:.3}m > {:.3}m)",
                        summary.algorithm, summary.final_distance_m, truth, err, tolerance
                    )
                });
            }
            None => self.check(false, || "device left the room".to_string()),
        }
    }

    fn check_requested(&mut self, summary: &SessionSummary) {
        self.check(summary.termination == Termination::Requested, || {
            format!("session ended by {:?}", summary.termination)
        });
    }
}

/// One simulated phone: room, devices, permissions and a session manager.
struct Rig {
    ctx: Arc<SimContext>,
    room: Arc<Room>,
    manager: SessionManager<SimContext, ScriptedPermissions>,
    feeders: u64,
}

impl Rig {
    async fn new(
        seed: u64,
        room: Room,
        permissions: ScriptedPermissions,
        faults: Vec<(Modality, FaultProfile)>,
        config: EngineConfig,
    ) -> Result<Self, SessionError> {
        let ctx = SimContext::shared(seed);
        let room = Arc::new(room);
        let provider = faults
            .into_iter()
            .fold(SimAdapterProvider::new(ctx.clone(), room.clone()), |p, (modality, profile)| {
                p.with_fault(modality, profile)
            });
        let manager = SessionManager::initialize(ctx.clone(), Arc::new(permissions), Arc::new(provider), config).await?;
        Ok(Self {
            ctx,
            room,
            manager,
            feeders: 0,
        })
    }

    /// Starts a session and an IMU feeder for it.
    async fn start(&mut self, request: SessionRequest) -> Result<SessionId, SessionError> {
        let id = self.manager.start(request).await?;
        let sender = self.manager.sensor_sender(id)?;

        let mut rng = self.ctx.device_rng(IMU_STREAM_BASE + self.feeders);
        self.feeders += 1;
        let (ctx, room) = (self.ctx.clone(), self.room.clone());
        self.ctx.spawn("imu-feeder", async move {
            loop {
                ctx.sleep(IMU_PERIOD).await;
                let sample = room.inertial_sample(ctx.now_secs(), &mut rng);
                // The worker is gone once the session ends
                if sender.send(SensorEvent::Inertial(sample)).await.is_err() {
                    break;
                }
            }
        });
        Ok(id)
    }

    async fn run_for(&self, secs: f64) {
        self.ctx.sleep(Duration::from_secs_f64(secs.max(0.0))).await;
    }

    async fn stop(&mut self, id: SessionId) -> Result<SessionSummary, SessionError> {
        self.manager.stop(id).await
    }

    /// True distance along the boresight right now.
    fn truth(&self) -> Option<f64> {
        self.room.true_range(self.ctx.now_secs(), &Vector3::x_axis())
    }
}

/// Runs capture scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Session length in seconds
    duration_secs: f64,

    /// Fusion algorithm override (the sweep ignores it)
    algorithm: Option<FusionAlgorithm>,

    /// Engine configuration handed to every manager
    config: EngineConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            duration_secs: 5.0,
            algorithm: None,
            config: sim_engine_config(),
        }
    }

    /// Sets the session length.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Forces a fusion algorithm.
    pub fn with_algorithm(mut self, algorithm: Option<FusionAlgorithm>) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Replaces the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = SimContext::runtime()
            .map_err(SimError::from)
            .and_then(|runtime| runtime.block_on(self.execute(scenario)));

        match outcome {
            Ok(outcome) => {
                let passed = outcome.failures.is_empty();
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed,
                    final_time_secs: outcome.final_time_secs,
                    true_distance_m: outcome.true_distance_m,
                    failure_reason: (!passed).then(|| outcome.failures.join("; ")),
                    summaries: outcome.summaries,
                }
            }
            Err(e) => {
                error!("{} aborted: {}", scenario.name(), e);
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    final_time_secs: 0.0,
                    true_distance_m: None,
                    failure_reason: Some(e.to_string()),
                    summaries: Vec::new(),
                }
            }
        }
    }

    async fn execute(&self, scenario: ScenarioId) -> Result<Outcome, SimError> {
        let outcome = match scenario {
            ScenarioId::StaticWall => self.run_static_wall().await?,
            ScenarioId::Approach => self.run_approach().await?,
            ScenarioId::SonarDropout => self.run_sonar_dropout().await?,
            ScenarioId::MicDenied => self.run_mic_denied().await?,
            ScenarioId::Exhaustion => self.run_exhaustion().await?,
            ScenarioId::AlgorithmSweep => self.run_algorithm_sweep().await?,
        };
        Ok(outcome)
    }

    fn algorithm(&self) -> FusionAlgorithm {
        self.algorithm.unwrap_or_default()
    }

    fn wall_room() -> Room {
        Room::standard(Trajectory::stationary(Vector3::new(2.5, 2.0, 1.2)))
    }

    fn all_modalities(&self) -> SessionRequest {
        SessionRequest::new(Modality::all()).with_algorithm(self.algorithm())
    }

    async fn rig(
        &self,
        room: Room,
        permissions: ScriptedPermissions,
        faults: Vec<(Modality, FaultProfile)>,
    ) -> Result<Rig, SessionError> {
        Rig::new(self.seed, room, permissions, faults, self.config.clone()).await
    }

    /// Checks the fused distance, or the attitude if the filter does not
    /// estimate translation.
    fn check_estimate(outcome: &mut Outcome, summary: &SessionSummary, truth: Option<f64>, tolerance: f64) {
        if summary.algorithm.estimates_translation() {
            outcome.check_distance(summary, truth, tolerance);
        } else {
            let drift = summary.final_state.orientation.angle();
            outcome.check(drift < MAX_ORIENTATION_DRIFT_RAD, || {
                format!("{} orientation drifted {:.4} rad", summary.algorithm, drift)
            });
        }
    }

    /// SIM-001: still device, all three modalities.
    async fn run_static_wall(&self) -> Result<Outcome, SessionError> {
        let mut rig = self.rig(Self::wall_room(), ScriptedPermissions::grant_all(), Vec::new()).await?;
        let id = rig.start(self.all_modalities()).await?;
        rig.run_for(self.duration_secs).await;
        let summary = rig.stop(id).await?;

        let mut outcome = Outcome::default();
        let truth = rig.truth();
        outcome.check_requested(&summary);
        Self::check_estimate(&mut outcome, &summary, truth, STATIC_TOLERANCE_M);
        outcome.check(summary.disabled.is_empty(), || format!("modalities disabled: {:?}", summary.disabled));
        outcome.check(summary.state_resets == 0, || format!("{} state resets", summary.state_resets));
        outcome.check(summary.final_confidence >= MIN_STATIC_CONFIDENCE, || {
            format!("confidence {:.3} below {:.2}", summary.final_confidence, MIN_STATIC_CONFIDENCE)
        });
        for modality in Modality::all() {
            let accepted = summary.accepted.get(&modality).copied().unwrap_or(0);
            outcome.check(accepted > 0, || format!("no {} samples fused", modality));
        }

        outcome.final_time_secs = rig.ctx.now_secs();
        outcome.true_distance_m = truth;
        outcome.summaries.push(summary);
        Ok(outcome)
    }

    /// SIM-002: device walked from 3 m to 2 m, then held still.
    async fn run_approach(&self) -> Result<Outcome, SessionError> {
        let walk_s = (self.duration_secs * 0.8).max(0.1);
        let trajectory = Trajectory::linear(Vector3::new(2.0, 2.0, 1.2), Vector3::new(1.0 / walk_s, 0.0, 0.0), walk_s);
        let mut rig = self.rig(Room::standard(trajectory), ScriptedPermissions::grant_all(), Vec::new()).await?;

        let id = rig.start(self.all_modalities()).await?;
        rig.run_for(self.duration_secs).await;
        let summary = rig.stop(id).await?;

        let mut outcome = Outcome::default();
        let truth = rig.truth();
        outcome.check_requested(&summary);
        Self::check_estimate(&mut outcome, &summary, truth, MOVING_TOLERANCE_M);

        outcome.final_time_secs = rig.ctx.now_secs();
        outcome.true_distance_m = truth;
        outcome.summaries.push(summary);
        Ok(outcome)
    }

    /// SIM-003: audio route lost after one second.
    async fn run_sonar_dropout(&self) -> Result<Outcome, SessionError> {
        let faults = vec![(Modality::Sonar, FaultProfile::fail_after(1.0))];
        let mut rig = self.rig(Self::wall_room(), ScriptedPermissions::grant_all(), faults).await?;

        let id = rig.start(self.all_modalities()).await?;
        rig.run_for(self.duration_secs.max(2.0)).await;
        let active = rig.manager.session(id)?.active_modalities;
        let summary = rig.stop(id).await?;

        let mut outcome = Outcome::default();
        let truth = rig.truth();
        outcome.check_requested(&summary);
        outcome.check(summary.disabled.contains_key(&Modality::Sonar), || "sonar was never disabled".to_string());
        outcome.check(
            summary.final_modalities == vec![Modality::Tof, Modality::Depth],
            || format!("final modalities {:?}", summary.final_modalities),
        );
        outcome.check(!active.contains(&Modality::Sonar), || format!("session still lists {:?}", active));
        Self::check_estimate(&mut outcome, &summary, truth, STATIC_TOLERANCE_M);

        outcome.final_time_secs = rig.ctx.now_secs();
        outcome.true_distance_m = truth;
        outcome.summaries.push(summary);
        Ok(outcome)
    }

    /// SIM-004: microphone refused.
    async fn run_mic_denied(&self) -> Result<Outcome, SessionError> {
        let permissions = ScriptedPermissions::grant_all().deny(Hardware::Microphone);
        let mut rig = self.rig(Self::wall_room(), permissions, Vec::new()).await?;
        let mut outcome = Outcome::default();

        // Sonar required: the whole start is refused
        match rig.start(self.all_modalities()).await {
            Err(SessionError::PermissionDenied { modality, hardware }) => {
                outcome.check(modality == Modality::Sonar && hardware == Hardware::Microphone, || {
                    format!("denied {} for {}, expected microphone for sonar", hardware, modality)
                });
            }
            Err(e) => outcome.check(false, || format!("required sonar failed with {}", e)),
            Ok(id) => {
                outcome.check(false, || "required sonar started without a microphone".to_string());
                outcome.summaries.push(rig.stop(id).await?);
            }
        }

        // Sonar optional: dropped, the rest runs
        let request = SessionRequest::new([Modality::Tof])
            .with_optional([Modality::Sonar, Modality::Depth])
            .with_algorithm(self.algorithm());
        let id = rig.start(request).await?;
        let active = rig.manager.session(id)?.active_modalities;
        let expected: BTreeSet<Modality> = [Modality::Tof, Modality::Depth].into_iter().collect();
        outcome.check(active == expected, || format!("active modalities {:?}", active));

        rig.run_for(self.duration_secs).await;
        let summary = rig.stop(id).await?;
        let truth = rig.truth();
        outcome.check_requested(&summary);
        Self::check_estimate(&mut outcome, &summary, truth, STATIC_TOLERANCE_M);

        outcome.final_time_secs = rig.ctx.now_secs();
        outcome.true_distance_m = truth;
        outcome.summaries.push(summary);
        Ok(outcome)
    }

    /// SIM-005: optical readings never come back.
    async fn run_exhaustion(&self) -> Result<Outcome, SessionError> {
        let faults = vec![
            (Modality::Tof, FaultProfile::dropout(1.0)),
            (Modality::Depth, FaultProfile::dropout(1.0)),
        ];
        let mut rig = self.rig(Self::wall_room(), ScriptedPermissions::grant_all(), faults).await?;

        let request = SessionRequest::new([Modality::Tof, Modality::Depth]).with_algorithm(self.algorithm());
        let id = rig.start(request).await?;
        rig.run_for(self.duration_secs.max(1.0)).await;
        let status = rig.manager.status(id)?;
        let summary = rig.stop(id).await?;

        let mut outcome = Outcome::default();
        outcome.check(status == SessionStatus::Stopped, || format!("session still {:?}", status));
        outcome.check(summary.termination == Termination::ModalitiesExhausted, || {
            format!("session ended by {:?}", summary.termination)
        });
        outcome.check(summary.final_modalities.is_empty(), || {
            format!("modalities survived: {:?}", summary.final_modalities)
        });
        outcome.check(summary.total_accepted() == 0, || {
            format!("{} samples fused from dead sensors", summary.total_accepted())
        });

        outcome.final_time_secs = rig.ctx.now_secs();
        outcome.true_distance_m = rig.truth();
        outcome.summaries.push(summary);
        Ok(outcome)
    }

    /// SIM-006: the static wall under every algorithm, one session each.
    async fn run_algorithm_sweep(&self) -> Result<Outcome, SessionError> {
        let mut rig = self.rig(Self::wall_room(), ScriptedPermissions::grant_all(), Vec::new()).await?;
        let mut outcome = Outcome::default();
        let per_algorithm = (self.duration_secs / 3.0).max(1.0);

        for algorithm in FusionAlgorithm::all() {
            let id = rig.start(SessionRequest::new(Modality::all()).with_algorithm(algorithm)).await?;
            rig.run_for(per_algorithm).await;
            let summary = rig.stop(id).await?;
            info!(
                "  {}: distance={:.3}m confidence={:.2} resets={}",
                algorithm, summary.final_distance_m, summary.final_confidence, summary.state_resets
            );

            let truth = rig.truth();
            outcome.check_requested(&summary);
            outcome.check(summary.algorithm == algorithm, || {
                format!("ran {} instead of {}", summary.algorithm, algorithm)
            });
            outcome.check(summary.state_resets == 0, || {
                format!("{} reset {} times", algorithm, summary.state_resets)
            });
            Self::check_estimate(&mut outcome, &summary, truth, STATIC_TOLERANCE_M);
            outcome.true_distance_m = truth;
            outcome.summaries.push(summary);
        }

        outcome.final_time_secs = rig.ctx.now_secs();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_wall_passes() {
        let result = ScenarioRunner::new(42).with_duration(2.0).run(ScenarioId::StaticWall);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.true_distance_m, Some(2.5));
        assert!(result.final_time_secs >= 2.0);
    }

    #[test]
    fn test_same_seed_same_result() {
        let runner = ScenarioRunner::new(7).with_duration(1.0);
        let a = runner.run(ScenarioId::StaticWall);
        let b = runner.run(ScenarioId::StaticWall);
        assert_eq!(a.summaries, b.summaries);
        assert_eq!(a.final_distance_m(), b.final_distance_m());
    }

    #[test]
    fn test_sonar_dropout_degrades() {
        let result = ScenarioRunner::new(42).with_duration(2.0).run(ScenarioId::SonarDropout);
        assert!(result.passed, "{:?}", result.failure_reason);
        let summary = &result.summaries[0];
        assert!(summary.disabled.contains_key(&Modality::Sonar));
        assert!(summary.accepted.get(&Modality::Sonar).copied().unwrap_or(0) > 0);
    }

    #[test]
    fn test_mic_denied() {
        let result = ScenarioRunner::new(42).with_duration(1.0).run(ScenarioId::MicDenied);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.summaries.len(), 1);
        assert_eq!(result.summaries[0].final_modalities, vec![Modality::Tof, Modality::Depth]);
    }

    #[test]
    fn test_exhaustion_ends_session() {
        let result = ScenarioRunner::new(42).with_duration(1.0).run(ScenarioId::Exhaustion);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.summaries[0].termination, Termination::ModalitiesExhausted);
    }

    #[test]
    fn test_algorithm_sweep_runs_each_filter() {
        let result = ScenarioRunner::new(42).with_duration(3.0).run(ScenarioId::AlgorithmSweep);
        assert!(result.passed, "{:?}", result.failure_reason);
        let algorithms: Vec<FusionAlgorithm> = result.summaries.iter().map(|s| s.algorithm).collect();
        assert_eq!(algorithms, FusionAlgorithm::all().to_vec());
    }

    #[test]
    fn test_bad_config_fails_cleanly() {
        let mut config = sim_engine_config();
        config.session.max_consecutive_failures = 0;
        let result = ScenarioRunner::new(1).with_config(config).run(ScenarioId::StaticWall);
        assert!(!result.passed);
        assert!(result.failure_reason.is_some());
        assert!(result.summaries.is_empty());
    }
}
