//! Simulated sensors.
//!
//! Each device implements the platform trait its adapter expects and
//! reads ground truth from the shared [`Room`]. Faults are injected per
//! device through a [`FaultProfile`].

use async_trait::async_trait;
use nalgebra::{Unit, Vector3};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use echoscan_core::adapters::{
    AudioCapture, AudioTransducer, DepthFrame, DepthSampler, DepthSource, SonarRanger, TofRanger, TofReading,
    TofSensor,
};
use echoscan_core::{AdapterProvider, EngineConfig, Modality, RangingAdapter};
use echoscan_env::{EnvError, Hardware, PermissionGate, PermissionStatus, ScanContext};

use crate::context::SimContext;
use crate::room::{gaussian, Room};

/// ToF status code for "signal fail"
const TOF_STATUS_SIGNAL_FAIL: u8 = 4;
/// ToF status code for "out of bounds"
const TOF_STATUS_OUT_OF_BOUNDS: u8 = 2;
/// Beyond this the simulated ToF emitter gets no return
const TOF_MAX_RANGE_M: f64 = 4.0;
/// Beyond this the simulated depth camera has no data
const DEPTH_MAX_RANGE_M: f64 = 5.0;

// ============================================================================
// FAULTS
// ============================================================================

/// Fault injection for one simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultProfile {
    /// Hardware exists on the device
    pub present: bool,
    /// Probability that a single reading carries no signal
    pub dropout_probability: f64,
    /// From this time on every operation fails (seconds)
    pub fail_after_s: Option<f64>,
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self::healthy()
    }
}

impl FaultProfile {
    pub fn healthy() -> Self {
        Self {
            present: true,
            dropout_probability: 0.0,
            fail_after_s: None,
        }
    }

    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::healthy()
        }
    }

    pub fn dropout(probability: f64) -> Self {
        Self {
            dropout_probability: probability.clamp(0.0, 1.0),
            ..Self::healthy()
        }
    }

    pub fn fail_after(seconds: f64) -> Self {
        Self {
            fail_after_s: Some(seconds),
            ..Self::healthy()
        }
    }

    pub fn failed_at(&self, t: f64) -> bool {
        self.fail_after_s.is_some_and(|after| t >= after)
    }

    fn drops<R: Rng>(&self, rng: &mut R) -> bool {
        self.dropout_probability > 0.0 && rng.gen_bool(self.dropout_probability)
    }

    fn probe(&self, what: &str) -> Result<(), EnvError> {
        if self.present {
            Ok(())
        } else {
            Err(EnvError::device(format!("no {} on this device", what)))
        }
    }
}

// ============================================================================
// SONAR
// ============================================================================

/// Speaker/microphone pair that hears the wall in front of the device.
pub struct SimAudio {
    ctx: Arc<SimContext>,
    room: Arc<Room>,
    rng: ChaCha8Rng,
    faults: FaultProfile,
    speed_of_sound: f64,
    /// Microphone noise floor (one sigma, full scale = 1)
    noise: f64,
    open: bool,
}

impl SimAudio {
    pub fn new(ctx: Arc<SimContext>, room: Arc<Room>, rng: ChaCha8Rng, faults: FaultProfile, speed_of_sound: f64) -> Self {
        Self {
            ctx,
            room,
            rng,
            faults,
            speed_of_sound,
            noise: 0.002,
            open: false,
        }
    }

    /// Echo amplitude relative to the emitted pulse.
    fn echo_gain(distance: f64) -> f32 {
        (0.8 / (1.0 + 0.1 * distance)) as f32
    }
}

#[async_trait]
impl AudioTransducer for SimAudio {
    async fn probe(&mut self) -> Result<(), EnvError> {
        self.faults.probe("audio route")
    }

    async fn open(&mut self) -> Result<(), EnvError> {
        if self.faults.failed_at(self.ctx.now_secs()) {
            return Err(EnvError::device("audio route lost"));
        }
        self.open = true;
        Ok(())
    }

    async fn emit_and_capture(
        &mut self,
        pulse: &[f32],
        sample_rate: f64,
        capture_len: usize,
    ) -> Result<AudioCapture, EnvError> {
        if !self.open {
            return Err(EnvError::device("audio streams not open"));
        }
        let started_at = self.ctx.now_secs();
        self.ctx
            .sleep(Duration::from_secs_f64(capture_len as f64 / sample_rate))
            .await;
        if self.faults.failed_at(started_at) {
            return Err(EnvError::device("audio route lost"));
        }

        let noise = self.noise;
        let mut samples: Vec<f32> = (0..capture_len)
            .map(|_| gaussian(&mut self.rng, noise) as f32)
            .collect();

        if self.faults.drops(&mut self.rng) {
            debug!("sim sonar: echo lost at t={:.3}", started_at);
        } else if let Some(distance) = self.room.true_range(started_at, &Vector3::x_axis()) {
            let delay = (2.0 * distance / self.speed_of_sound * sample_rate).round() as usize;
            let gain = Self::echo_gain(distance);
            for (i, &s) in pulse.iter().enumerate() {
                if let Some(slot) = samples.get_mut(delay + i) {
                    *slot += gain * s;
                }
            }
        }

        Ok(AudioCapture { samples, started_at })
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

// ============================================================================
// TIME OF FLIGHT
// ============================================================================

/// Single-zone ToF sensor looking along body +X.
pub struct SimTof {
    ctx: Arc<SimContext>,
    room: Arc<Room>,
    rng: ChaCha8Rng,
    faults: FaultProfile,
    running: bool,
}

impl SimTof {
    /// Integration time of one reading
    const TIMING_BUDGET: Duration = Duration::from_millis(20);

    pub fn new(ctx: Arc<SimContext>, room: Arc<Room>, rng: ChaCha8Rng, faults: FaultProfile) -> Self {
        Self {
            ctx,
            room,
            rng,
            faults,
            running: false,
        }
    }

    fn no_signal(timestamp: f64, status: u8) -> TofReading {
        TofReading {
            timestamp,
            distance_mm: 0,
            sigma_mm: 0,
            signal_kcps: 0,
            ambient_kcps: 150,
            status,
        }
    }
}

#[async_trait]
impl TofSensor for SimTof {
    async fn probe(&mut self) -> Result<(), EnvError> {
        self.faults.probe("proximity sensor")
    }

    async fn start(&mut self) -> Result<(), EnvError> {
        self.running = true;
        Ok(())
    }

    async fn read(&mut self) -> Result<TofReading, EnvError> {
        if !self.running {
            return Err(EnvError::device("ranging not started"));
        }
        self.ctx.sleep(Self::TIMING_BUDGET).await;
        let t = self.ctx.now_secs();
        if self.faults.failed_at(t) {
            return Err(EnvError::device("i2c bus timeout"));
        }
        if self.faults.drops(&mut self.rng) {
            return Ok(Self::no_signal(t, TOF_STATUS_SIGNAL_FAIL));
        }

        let distance = match self.room.true_range(t, &Vector3::x_axis()) {
            Some(d) if d <= TOF_MAX_RANGE_M => d,
            _ => return Ok(Self::no_signal(t, TOF_STATUS_OUT_OF_BOUNDS)),
        };
        let measured_mm = ((distance + gaussian(&mut self.rng, 0.005)) * 1000.0).round();
        Ok(TofReading {
            timestamp: t,
            distance_mm: measured_mm.clamp(0.0, u16::MAX as f64) as u16,
            sigma_mm: (4.0 + distance).round() as u16,
            signal_kcps: (20_000.0 / (1.0 + distance * distance)) as u32,
            ambient_kcps: 150,
            status: 0,
        })
    }

    async fn stop(&mut self) {
        self.running = false;
    }
}

// ============================================================================
// DEPTH
// ============================================================================

/// Depth camera producing small frames around the requested direction.
pub struct SimDepth {
    ctx: Arc<SimContext>,
    room: Arc<Room>,
    rng: ChaCha8Rng,
    faults: FaultProfile,
    width: usize,
    height: usize,
    streaming: bool,
}

impl SimDepth {
    /// One frame at 30 fps
    const FRAME_TIME: Duration = Duration::from_millis(33);

    pub fn new(ctx: Arc<SimContext>, room: Arc<Room>, rng: ChaCha8Rng, faults: FaultProfile) -> Self {
        Self {
            ctx,
            room,
            rng,
            faults,
            width: 16,
            height: 12,
            streaming: false,
        }
    }
}

#[async_trait]
impl DepthSource for SimDepth {
    async fn probe(&mut self) -> Result<(), EnvError> {
        self.faults.probe("depth camera")
    }

    async fn start(&mut self) -> Result<(), EnvError> {
        self.streaming = true;
        Ok(())
    }

    async fn capture(&mut self, direction: Unit<Vector3<f64>>) -> Result<DepthFrame, EnvError> {
        if !self.streaming {
            return Err(EnvError::device("depth stream not started"));
        }
        self.ctx.sleep(Self::FRAME_TIME).await;
        let t = self.ctx.now_secs();
        if self.faults.failed_at(t) {
            return Err(EnvError::device("camera disconnected"));
        }

        let pixels = self.width * self.height;
        let mut frame = DepthFrame {
            timestamp: t,
            width: self.width,
            height: self.height,
            depths: vec![0.0; pixels],
            confidence: vec![0; pixels],
        };
        if self.faults.drops(&mut self.rng) {
            return Ok(frame);
        }
        let Some(distance) = self.room.true_range(t, &direction).filter(|d| *d <= DEPTH_MAX_RANGE_M) else {
            return Ok(frame);
        };

        for (depth, level) in frame.depths.iter_mut().zip(frame.confidence.iter_mut()) {
            *depth = (distance + gaussian(&mut self.rng, 0.01)) as f32;
            *level = if self.rng.gen_bool(0.1) { 1 } else { 2 };
        }
        Ok(frame)
    }

    async fn stop(&mut self) {
        self.streaming = false;
    }
}

// ============================================================================
// PLATFORM
// ============================================================================

/// Permission gate with a fixed set of refusals.
#[derive(Debug, Default)]
pub struct ScriptedPermissions {
    denied: BTreeSet<Hardware>,
    requests: Mutex<Vec<Hardware>>,
}

impl ScriptedPermissions {
    pub fn grant_all() -> Self {
        Self::default()
    }

    pub fn deny(mut self, hardware: Hardware) -> Self {
        self.denied.insert(hardware);
        self
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<Hardware> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PermissionGate for ScriptedPermissions {
    async fn request(&self, hardware: Hardware) -> PermissionStatus {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).push(hardware);
        if self.denied.contains(&hardware) {
            PermissionStatus::Denied
        } else {
            PermissionStatus::Granted
        }
    }
}

/// Builds the real adapters on top of simulated devices.
pub struct SimAdapterProvider {
    ctx: Arc<SimContext>,
    room: Arc<Room>,
    faults: BTreeMap<Modality, FaultProfile>,
    streams: AtomicU64,
}

impl SimAdapterProvider {
    pub fn new(ctx: Arc<SimContext>, room: Arc<Room>) -> Self {
        Self {
            ctx,
            room,
            faults: BTreeMap::new(),
            streams: AtomicU64::new(0),
        }
    }

    pub fn with_fault(mut self, modality: Modality, profile: FaultProfile) -> Self {
        self.faults.insert(modality, profile);
        self
    }
}

impl AdapterProvider for SimAdapterProvider {
    fn create(&self, modality: Modality, config: &EngineConfig) -> Option<Box<dyn RangingAdapter>> {
        let faults = self.faults.get(&modality).cloned().unwrap_or_default();
        let rng = self.ctx.device_rng(self.streams.fetch_add(1, Ordering::SeqCst));
        let (ctx, room) = (self.ctx.clone(), self.room.clone());

        let adapter: Box<dyn RangingAdapter> = match modality {
            Modality::Sonar => {
                let speed = config.sonar.correlator.speed_of_sound;
                Box::new(SonarRanger::new(
                    config.sonar.clone(),
                    SimAudio::new(ctx, room, rng, faults, speed),
                ))
            }
            Modality::Tof => Box::new(TofRanger::new(config.tof.clone(), SimTof::new(ctx, room, rng, faults))),
            Modality::Depth => Box::new(DepthSampler::new(config.depth.clone(), SimDepth::new(ctx, room, rng, faults))),
        };
        Some(adapter)
    }
}
