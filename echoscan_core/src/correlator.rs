//! The "ECHO" Engine - Sonar Echo-Delay Estimation
//!
//! Turns one ping into one distance:
//! 1. **Chirp synthesis**: Hann-shaped linear frequency sweep (18 → 22 kHz)
//! 2. **Correlation**: FFT cross-correlation of the capture against the chirp
//! 3. **Peak selection**: global maximum → round-trip delay
//! 4. **Derivation**: distance = delay × c / 2, confidence = peak / energy
//!
//! Every failure (`NoEcho`, `CaptureTimeout`, `OutOfRange`) is recoverable;
//! the caller may simply ping again.

use nalgebra::{Unit, Vector3};
use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::cancel::CancelToken;
use crate::error::RangingError;
use crate::types::{DistanceRange, Modality, RangingSample};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Chirp (emitted pulse) parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChirpConfig {
    /// Audio sample rate in Hz (default: 48 kHz)
    pub sample_rate: f64,

    /// Sweep start frequency in Hz (default: 18 kHz, near-inaudible)
    pub start_hz: f64,

    /// Sweep end frequency in Hz (default: 22 kHz)
    pub end_hz: f64,

    /// Pulse duration in seconds (default: 100 ms)
    pub duration_s: f64,

    /// Peak output amplitude, full scale = 1.0 (default: 0.1)
    pub amplitude: f64,
}

impl Default for ChirpConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            start_hz: 18_000.0,
            end_hz: 22_000.0,
            duration_s: 0.1,
            amplitude: 0.1,
        }
    }
}

impl ChirpConfig {
    /// Number of samples in the pulse.
    pub fn num_samples(&self) -> usize {
        (self.duration_s * self.sample_rate).round().max(0.0) as usize
    }

    pub fn validate(&self) -> Result<(), RangingError> {
        let nyquist = self.sample_rate / 2.0;
        if !(self.sample_rate > 0.0) {
            return Err(RangingError::invalid_config("sample rate must be positive"));
        }
        if !(self.start_hz > 0.0 && self.end_hz > 0.0) {
            return Err(RangingError::invalid_config("chirp frequencies must be positive"));
        }
        if self.start_hz > nyquist || self.end_hz > nyquist {
            return Err(RangingError::invalid_config(format!(
                "chirp {}..{} Hz exceeds Nyquist {} Hz",
                self.start_hz, self.end_hz, nyquist
            )));
        }
        if self.num_samples() < 2 {
            return Err(RangingError::invalid_config("chirp shorter than two samples"));
        }
        if !(self.amplitude > 0.0 && self.amplitude <= 1.0) {
            return Err(RangingError::invalid_config("amplitude must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Echo-delay estimation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Speed of sound in m/s (default: 343 m/s at 20 °C)
    pub speed_of_sound: f64,

    /// Accepted distance range (default: 0.1 - 10 m)
    pub range: DistanceRange,

    /// Minimum peak / reference energy ratio for a valid echo (default: 0.02)
    pub min_peak_ratio: f64,

    /// Minimum peak / mean |correlation| ratio for a valid echo (default: 6.0)
    pub min_prominence: f64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            speed_of_sound: 343.0,
            range: DistanceRange::new(0.1, 10.0),
            min_peak_ratio: 0.02,
            min_prominence: 6.0,
        }
    }
}

/// Speed of sound in dry air at the given temperature (m/s).
pub fn speed_of_sound_at(celsius: f64) -> f64 {
    331.3 + 0.606 * celsius
}

// ============================================================================
// SIGNALS
// ============================================================================

/// One ping: the emitted pulse and what the microphone heard.
///
/// Owned by the correlator for the duration of a single estimate.
#[derive(Debug, Clone)]
pub struct EchoSignal {
    pub sample_rate: f64,
    pub emitted: Vec<f32>,
    pub captured: Vec<f32>,
}

impl EchoSignal {
    pub fn new(sample_rate: f64, emitted: Vec<f32>, captured: Vec<f32>) -> Self {
        Self {
            sample_rate,
            emitted,
            captured,
        }
    }
}

/// Symmetric Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![1.0; n];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / denom).cos()))
        .collect()
}

/// Synthesizes the Hann-shaped linear chirp described by `config`.
pub fn synthesize_chirp(config: &ChirpConfig) -> Result<Vec<f32>, RangingError> {
    config.validate()?;

    let n = config.num_samples();
    let window = hann_window(n);
    let duration = n as f64 / config.sample_rate;
    let sweep_rate = (config.end_hz - config.start_hz) / duration;

    let chirp = window
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let t = i as f64 / config.sample_rate;
            // Instantaneous phase of a linear sweep: 2π (f0 t + k t² / 2)
            let phase = 2.0 * PI * (config.start_hz * t + 0.5 * sweep_rate * t * t);
            (config.amplitude * w * phase.sin()) as f32
        })
        .collect();

    Ok(chirp)
}

/// Full cross-correlation of `signal` against `reference`.
///
/// Output length is `len(signal) + len(reference) - 1`; index
/// `len(reference) - 1` is zero lag. Empty input yields an empty output.
pub fn cross_correlate(signal: &[f32], reference: &[f32]) -> Vec<f64> {
    correlate(signal, reference, None).unwrap_or_default()
}

fn correlate(
    signal: &[f32],
    reference: &[f32],
    cancel: Option<&CancelToken>,
) -> Result<Vec<f64>, RangingError> {
    let check = || cancel.map_or(Ok(()), |c| c.check());

    if signal.is_empty() || reference.is_empty() {
        return Ok(Vec::new());
    }

    let m = reference.len();
    let full_len = signal.len() + m - 1;
    let fft_len = full_len.next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_len);
    let ifft = planner.plan_fft_inverse(fft_len);

    let zero = Complex::new(0.0, 0.0);
    let mut sig: Vec<Complex<f64>> = signal.iter().map(|&x| Complex::new(x as f64, 0.0)).collect();
    sig.resize(fft_len, zero);
    let mut refr: Vec<Complex<f64>> = reference.iter().map(|&x| Complex::new(x as f64, 0.0)).collect();
    refr.resize(fft_len, zero);

    fft.process(&mut sig);
    check()?;
    fft.process(&mut refr);
    check()?;

    // S · conj(R)  →  c[k] = Σ s[n + k] r[n]
    for (s, r) in sig.iter_mut().zip(refr.iter()) {
        *s *= r.conj();
    }
    ifft.process(&mut sig);
    check()?;

    // rustfft does not normalize the inverse transform
    let scale = 1.0 / fft_len as f64;
    let offset = (m - 1) as isize;
    let full = (0..full_len)
        .map(|i| {
            let lag = i as isize - offset;
            let idx = if lag >= 0 { lag as usize } else { (fft_len as isize + lag) as usize };
            sig[idx].re * scale
        })
        .collect();

    Ok(full)
}

// ============================================================================
// CORRELATOR
// ============================================================================

/// Intermediate result of echo analysis (before it becomes a sample).
#[derive(Debug, Clone, PartialEq)]
pub struct EchoEstimate {
    /// Index of the global maximum in the full correlation
    pub peak_index: usize,
    /// Round-trip delay in seconds
    pub delay_s: f64,
    /// One-way distance in meters
    pub distance_m: f64,
    /// Correlation value at the peak
    pub peak_correlation: f64,
    /// Self-correlation energy of the reference (theoretical maximum)
    pub reference_energy: f64,
    /// Peak / mean |correlation|
    pub prominence: f64,
    /// min(1, peak / reference energy)
    pub confidence: f64,
}

/// Sonar echo-delay estimator.
#[derive(Debug, Clone, Default)]
pub struct SignalCorrelator {
    config: CorrelatorConfig,
}

impl SignalCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Meters per sample of delay resolution at `sample_rate`.
    pub fn distance_resolution(&self, sample_rate: f64) -> f64 {
        self.config.speed_of_sound / (2.0 * sample_rate)
    }

    /// Analyzes one ping without the range check.
    ///
    /// Fails with `CaptureTimeout` if the capture is shorter than the pulse
    /// and with `NoEcho` if the correlation has no usable peak.
    pub fn analyze(&self, echo: &EchoSignal, cancel: &CancelToken) -> Result<EchoEstimate, RangingError> {
        let reference = &echo.emitted;
        if reference.is_empty() {
            return Err(RangingError::invalid_config("empty reference pulse"));
        }
        if !(echo.sample_rate > 0.0) {
            return Err(RangingError::invalid_config("sample rate must be positive"));
        }
        if echo.captured.len() < reference.len() {
            return Err(RangingError::CaptureTimeout {
                captured: echo.captured.len(),
                expected: reference.len(),
            });
        }
        cancel.check()?;

        let correlation = correlate(&echo.captured, reference, Some(cancel))?;
        cancel.check()?;

        let (peak_index, peak_correlation) = correlation
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });

        let reference_energy: f64 = reference.iter().map(|&x| (x as f64) * (x as f64)).sum();
        let mean_abs = correlation.iter().map(|v| v.abs()).sum::<f64>() / correlation.len() as f64;

        if !peak_correlation.is_finite() || peak_correlation <= 0.0 || reference_energy <= 0.0 {
            return Err(RangingError::NoEcho);
        }
        let prominence = if mean_abs > 0.0 { peak_correlation / mean_abs } else { f64::INFINITY };
        if peak_correlation / reference_energy < self.config.min_peak_ratio
            || prominence < self.config.min_prominence
        {
            return Err(RangingError::NoEcho);
        }

        let lag = peak_index as f64 - (reference.len() as f64 - 1.0);
        let delay_s = lag / echo.sample_rate;
        let distance_m = delay_s * self.config.speed_of_sound / 2.0;
        let confidence = (peak_correlation / reference_energy).min(1.0);

        Ok(EchoEstimate {
            peak_index,
            delay_s,
            distance_m,
            peak_correlation,
            reference_energy,
            prominence,
            confidence,
        })
    }

    /// Turns one ping into a ranging sample, or a rejection reason.
    pub fn estimate(
        &self,
        echo: &EchoSignal,
        direction: Unit<Vector3<f64>>,
        timestamp: f64,
        cancel: &CancelToken,
    ) -> Result<RangingSample, RangingError> {
        let est = self.analyze(echo, cancel)?;
        let distance = self.config.range.validate(Modality::Sonar, est.distance_m)?;

        Ok(RangingSample::new(Modality::Sonar, distance, est.confidence, timestamp, direction)
            .with_metadata("delay_s", est.delay_s)
            .with_metadata("peak_correlation", est.peak_correlation)
            .with_metadata("prominence", est.prominence))
    }
}
