//! Engine configuration.
//!
//! Every section has working defaults and deserializes with
//! `#[serde(default)]`, so a JSON document only needs the fields it changes:
//!
//! ```json
//! { "sonar": { "capture_duration_s": 0.5 }, "session": { "max_consecutive_failures": 5 } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::adapters::{DepthConfig, SonarConfig, TofConfig};
use crate::error::SessionError;
use crate::fusion::FusionConfig;
use crate::reporter::ConfidenceConfig;
use crate::types::DistanceRange;

/// Session manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard timeout for one `measure()` call (default: 2500 ms)
    pub measure_timeout_ms: u64,

    /// How long `stop()` waits for the worker to wind down (default: 3000 ms)
    pub stop_timeout_ms: u64,

    /// Consecutive failures after which a modality is disabled (default: 3)
    pub max_consecutive_failures: u32,

    /// Capacity of the session event broadcast channel (default: 64)
    pub event_buffer: usize,

    /// Capacity of the injected sensor event queue (default: 1024)
    pub sensor_buffer: usize,

    /// Upper bound on the requested update rate (default: 100 Hz)
    pub max_update_rate_hz: f64,

    /// Measurement direction in the body frame (default: +X)
    pub boresight: [f64; 3],

    /// Age an event must reach before it is committed to the estimator,
    /// absorbing late sensor delivery (default: 10 ms)
    pub reorder_window_ms: u64,

    /// Stopped sessions whose summary stays available to `stop()` (default: 16)
    pub max_retained_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            measure_timeout_ms: 2500,
            stop_timeout_ms: 3000,
            max_consecutive_failures: 3,
            event_buffer: 64,
            sensor_buffer: 1024,
            max_update_rate_hz: 100.0,
            boresight: [1.0, 0.0, 0.0],
            reorder_window_ms: 10,
            max_retained_sessions: 16,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sonar: SonarConfig,
    pub tof: TofConfig,
    pub depth: DepthConfig,
    pub fusion: FusionConfig,
    pub confidence: ConfidenceConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Parses a (possibly partial) JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, SessionError> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| SessionError::invalid_config(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionError::invalid_config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Rejects inconsistent values.
    pub fn validate(&self) -> Result<(), SessionError> {
        self.sonar
            .chirp
            .validate()
            .map_err(|e| SessionError::invalid_config(e.to_string()))?;

        check_range("sonar", &self.sonar.correlator.range)?;
        check_range("tof", &self.tof.range)?;
        check_range("depth", &self.depth.range)?;

        check_positive("correlator.speed_of_sound", self.sonar.correlator.speed_of_sound)?;
        check_positive("sonar.capture_duration_s", self.sonar.capture_duration_s)?;
        check_positive("sonar.accuracy_m", self.sonar.accuracy_m)?;
        check_positive("tof.accuracy_m", self.tof.accuracy_m)?;
        check_positive("tof.sigma_max_mm", self.tof.sigma_max_mm)?;
        check_positive("tof.field_of_view_deg", self.tof.field_of_view_deg)?;
        check_positive("depth.accuracy_m", self.depth.accuracy_m)?;
        if !(0.0..=1.0).contains(&self.depth.min_valid_fraction) {
            return Err(SessionError::invalid_config("depth.min_valid_fraction must lie in [0, 1]"));
        }

        self.fusion.validate()?;
        self.confidence.validate()?;

        let session = &self.session;
        check_positive("session.max_update_rate_hz", session.max_update_rate_hz)?;
        if session.measure_timeout_ms == 0 || session.stop_timeout_ms == 0 {
            return Err(SessionError::invalid_config("session timeouts must be positive"));
        }
        let capture_ms = self.sonar.capture_duration_s * 1000.0;
        if capture_ms >= session.measure_timeout_ms as f64 {
            return Err(SessionError::invalid_config(format!(
                "sonar.capture_duration_s ({} ms) must be shorter than session.measure_timeout_ms ({} ms)",
                capture_ms, session.measure_timeout_ms
            )));
        }
        if session.max_retained_sessions == 0 {
            return Err(SessionError::invalid_config("session.max_retained_sessions must be at least 1"));
        }
        if session.max_consecutive_failures == 0 {
            return Err(SessionError::invalid_config("session.max_consecutive_failures must be at least 1"));
        }
        if session.event_buffer == 0 || session.sensor_buffer == 0 {
            return Err(SessionError::invalid_config("session buffers must be non-empty"));
        }
        let norm = session.boresight.iter().map(|v| v * v).sum::<f64>().sqrt();
        if !norm.is_finite() || norm < 1e-9 {
            return Err(SessionError::invalid_config("session.boresight must be a non-zero vector"));
        }
        Ok(())
    }
}

fn check_range(name: &str, range: &DistanceRange) -> Result<(), SessionError> {
    if range.is_valid() {
        Ok(())
    } else {
        Err(SessionError::invalid_config(format!(
            "{} range [{}, {}] is empty",
            name, range.min_m, range.max_m
        )))
    }
}

pub(crate) fn check_positive(name: &str, value: f64) -> Result<(), SessionError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SessionError::invalid_config(format!("{} must be positive, got {}", name, value)))
    }
}
