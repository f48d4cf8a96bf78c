//! Depth Sampler - structured-light / LiDAR depth maps.
//!
//! Asks the platform for a depth frame aimed along the requested
//! direction and samples the center patch. The distance is the median of
//! the valid pixels in the patch, so a few flying pixels at edges do not
//! drag it.

use async_trait::async_trait;
use echoscan_env::EnvError;
use nalgebra::{Unit, Vector3};
use serde::{Deserialize, Serialize};

use super::{AdapterState, RangingAdapter};
use crate::cancel::CancelToken;
use crate::error::RangingError;
use crate::types::{DistanceRange, Modality, ModalityCapability, RangingSample};

/// Highest per-pixel confidence level a platform reports (ARKit style 0..=2).
pub const MAX_CONFIDENCE_LEVEL: u8 = 2;

/// Depth adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    /// Declared range (default: 0.2 - 5.0 m)
    pub range: DistanceRange,

    /// Half-width of the sampled center patch in pixels (default: 2 => 5x5)
    pub patch_radius: usize,

    /// Fraction of valid patch pixels required for a sample (default: 0.5)
    pub min_valid_fraction: f64,

    /// Declared one-sigma accuracy in meters (default: 2 cm)
    pub accuracy_m: f64,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            range: DistanceRange::new(0.2, 5.0),
            patch_radius: 2,
            min_valid_fraction: 0.5,
            accuracy_m: 0.02,
        }
    }
}

/// One depth map with per-pixel confidence levels.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    /// Context time of the frame (seconds)
    pub timestamp: f64,
    pub width: usize,
    pub height: usize,
    /// Row-major depth in meters (0 or non-finite = no data)
    pub depths: Vec<f32>,
    /// Row-major confidence level in `0..=MAX_CONFIDENCE_LEVEL`
    pub confidence: Vec<u8>,
}

impl DepthFrame {
    fn check_layout(&self) -> Result<(), RangingError> {
        let pixels = self.width * self.height;
        if pixels == 0 || self.depths.len() != pixels || self.confidence.len() != pixels {
            return Err(RangingError::device(format!(
                "depth frame {}x{} carries {} depths and {} confidence values",
                self.width,
                self.height,
                self.depths.len(),
                self.confidence.len()
            )));
        }
        Ok(())
    }
}

/// Platform depth camera.
#[async_trait]
pub trait DepthSource: Send {
    async fn probe(&mut self) -> Result<(), EnvError>;
    async fn start(&mut self) -> Result<(), EnvError>;
    /// Captures a frame whose optical center points along `direction`.
    async fn capture(&mut self, direction: Unit<Vector3<f64>>) -> Result<DepthFrame, EnvError>;
    async fn stop(&mut self);
}

/// Result of sampling the center patch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchEstimate {
    pub distance_m: f64,
    pub confidence: f64,
    pub valid_fraction: f64,
}

/// Samples the center patch of `frame`.
///
/// Returns `None` if fewer than `min_valid_fraction` of the pixels carry data.
pub fn sample_center(frame: &DepthFrame, patch_radius: usize, min_valid_fraction: f64) -> Option<PatchEstimate> {
    let cx = frame.width / 2;
    let cy = frame.height / 2;
    let x0 = cx.saturating_sub(patch_radius);
    let y0 = cy.saturating_sub(patch_radius);
    let x1 = (cx + patch_radius).min(frame.width - 1);
    let y1 = (cy + patch_radius).min(frame.height - 1);

    let mut depths = Vec::new();
    let mut level_sum = 0.0;
    let mut total = 0usize;
    for y in y0..=y1 {
        for x in x0..=x1 {
            total += 1;
            let i = y * frame.width + x;
            let d = frame.depths[i];
            if d.is_finite() && d > 0.0 {
                depths.push(d as f64);
                level_sum += frame.confidence[i].min(MAX_CONFIDENCE_LEVEL) as f64;
            }
        }
    }

    let valid_fraction = depths.len() as f64 / total as f64;
    if depths.is_empty() || valid_fraction < min_valid_fraction {
        return None;
    }

    depths.sort_by(|a, b| a.total_cmp(b));
    let mid = depths.len() / 2;
    let distance_m = if depths.len() % 2 == 0 {
        (depths[mid - 1] + depths[mid]) / 2.0
    } else {
        depths[mid]
    };
    let mean_level = level_sum / depths.len() as f64;
    let confidence = (mean_level / MAX_CONFIDENCE_LEVEL as f64 * valid_fraction).clamp(0.0, 1.0);

    Some(PatchEstimate {
        distance_m,
        confidence,
        valid_fraction,
    })
}

/// Depth-map ranging adapter.
pub struct DepthSampler<D: DepthSource> {
    config: DepthConfig,
    source: D,
    state: AdapterState,
}

impl<D: DepthSource> DepthSampler<D> {
    pub fn new(config: DepthConfig, source: D) -> Self {
        Self {
            config,
            source,
            state: AdapterState::Uninitialized,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }
}

#[async_trait]
impl<D: DepthSource> RangingAdapter for DepthSampler<D> {
    fn modality(&self) -> Modality {
        Modality::Depth
    }

    async fn initialize(&mut self) -> Result<ModalityCapability, RangingError> {
        if !self.config.range.is_valid() {
            return Err(RangingError::invalid_config("depth range is empty"));
        }
        self.source
            .probe()
            .await
            .map_err(|_| RangingError::HardwareUnavailable(Modality::Depth))?;
        self.state = AdapterState::Ready;
        Ok(ModalityCapability {
            modality: Modality::Depth,
            range: self.config.range,
            accuracy_m: self.config.accuracy_m,
        })
    }

    async fn start_session(&mut self) -> Result<(), RangingError> {
        match self.state {
            AdapterState::Uninitialized => Err(RangingError::NotStarted(Modality::Depth)),
            AdapterState::Active => Ok(()),
            AdapterState::Ready => {
                self.source.start().await?;
                self.state = AdapterState::Active;
                Ok(())
            }
        }
    }

    async fn measure(
        &mut self,
        direction: Unit<Vector3<f64>>,
        cancel: &CancelToken,
    ) -> Result<RangingSample, RangingError> {
        if self.state != AdapterState::Active {
            return Err(RangingError::NotStarted(Modality::Depth));
        }
        cancel.check()?;

        let frame = self.source.capture(direction).await?;
        frame.check_layout()?;

        let patch = sample_center(&frame, self.config.patch_radius, self.config.min_valid_fraction).ok_or_else(|| {
            RangingError::NoReturn {
                modality: Modality::Depth,
                reason: "too few valid pixels in center patch".to_string(),
            }
        })?;

        let distance = self.config.range.validate(Modality::Depth, patch.distance_m)?;
        Ok(RangingSample::new(Modality::Depth, distance, patch.confidence, frame.timestamp, direction)
            .with_metadata("valid_fraction", patch.valid_fraction))
    }

    async fn stop_session(&mut self) {
        if self.state == AdapterState::Active {
            self.source.stop().await;
            self.state = AdapterState::Ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn flat_frame(depth: f32, level: u8) -> DepthFrame {
        DepthFrame {
            timestamp: 1.0,
            width: 9,
            height: 7,
            depths: vec![depth; 63],
            confidence: vec![level; 63],
        }
    }

    struct StaticCamera {
        frame: DepthFrame,
    }

    #[async_trait]
    impl DepthSource for StaticCamera {
        async fn probe(&mut self) -> Result<(), EnvError> {
            Ok(())
        }
        async fn start(&mut self) -> Result<(), EnvError> {
            Ok(())
        }
        async fn capture(&mut self, _direction: Unit<Vector3<f64>>) -> Result<DepthFrame, EnvError> {
            Ok(self.frame.clone())
        }
        async fn stop(&mut self) {}
    }

    #[test]
    fn test_median_ignores_outliers() {
        let mut frame = flat_frame(1.2, 2);
        // Two flying pixels inside the 5x5 patch
        frame.depths[3 * 9 + 4] = 4.0;
        frame.depths[2 * 9 + 3] = 0.3;

        let patch = sample_center(&frame, 2, 0.5).unwrap();
        assert_relative_eq!(patch.distance_m, 1.2, epsilon = 1e-6);
        assert_relative_eq!(patch.confidence, 1.0);
    }

    #[test]
    fn test_sparse_patch_is_rejected() {
        let mut frame = flat_frame(0.0, 0);
        frame.depths[3 * 9 + 4] = 1.0;
        assert!(sample_center(&frame, 2, 0.5).is_none());
    }

    #[test]
    fn test_confidence_scales_with_level_and_coverage() {
        let mut frame = flat_frame(2.0, 1);
        for x in 2..=6 {
            frame.depths[9 + x] = f32::NAN;
        }
        let patch = sample_center(&frame, 2, 0.5).unwrap();
        assert_relative_eq!(patch.valid_fraction, 0.8);
        assert_relative_eq!(patch.confidence, 0.5 * 0.8);
    }

    #[tokio::test]
    async fn test_sampler_produces_sample() {
        let mut sampler = DepthSampler::new(DepthConfig::default(), StaticCamera { frame: flat_frame(1.5, 2) });
        sampler.initialize().await.unwrap();
        sampler.start_session().await.unwrap();

        let sample = sampler.measure(Vector3::x_axis(), &CancelToken::new()).await.unwrap();
        assert_eq!(sample.modality(), Modality::Depth);
        assert_relative_eq!(sample.distance_m(), 1.5, epsilon = 1e-6);
        assert_eq!(sample.timestamp(), 1.0);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_device_error() {
        let mut frame = flat_frame(1.5, 2);
        frame.confidence.pop();
        let mut sampler = DepthSampler::new(DepthConfig::default(), StaticCamera { frame });
        sampler.initialize().await.unwrap();
        sampler.start_session().await.unwrap();

        let err = sampler.measure(Vector3::x_axis(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, RangingError::Device(_)));
    }
}
