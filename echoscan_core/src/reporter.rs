//! Capability & Confidence Reporter
//!
//! Answers "what is usable right now": which modalities exist on the
//! device (probed once, cached until re-initialization), and how much the
//! current fused estimate can be trusted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::adapters::AdapterProvider;
use crate::config::{check_positive, EngineConfig};
use crate::error::SessionError;
use crate::types::{DeviceCapabilities, Modality};

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Cached device capability set.
#[derive(Debug, Clone)]
pub struct CapabilityReporter {
    capabilities: DeviceCapabilities,
    generation: u64,
}

impl CapabilityReporter {
    /// Probes every modality once.
    ///
    /// Each probe adapter is initialized and released immediately; nothing
    /// stays acquired after detection.
    pub async fn detect(provider: &dyn AdapterProvider, config: &EngineConfig) -> Self {
        let capabilities = probe_all(provider, config).await;
        Self {
            capabilities,
            generation: 1,
        }
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Number of detection passes so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Re-probes the device. The only way the cached set changes.
    pub async fn reinitialize(&mut self, provider: &dyn AdapterProvider, config: &EngineConfig) -> &DeviceCapabilities {
        self.capabilities = probe_all(provider, config).await;
        self.generation += 1;
        &self.capabilities
    }
}

async fn probe_all(provider: &dyn AdapterProvider, config: &EngineConfig) -> DeviceCapabilities {
    let mut capabilities = DeviceCapabilities::default();
    for modality in Modality::all() {
        let Some(mut adapter) = provider.create(modality, config) else {
            debug!("no {} driver on this platform", modality);
            continue;
        };
        match adapter.initialize().await {
            Ok(capability) => {
                capabilities.modalities.insert(modality, capability);
            }
            Err(e) => debug!("{} unavailable: {}", modality, e),
        }
        adapter.stop_session().await;
    }
    info!("Capabilities detected: {:?}", capabilities.available_modalities());
    capabilities
}

// ============================================================================
// CONFIDENCE
// ============================================================================

/// Session-confidence tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Recency decay time constant in seconds (default: 2 s)
    pub recency_tau_s: f64,

    /// A modality counts as "recent" within this window (default: 1 s)
    pub recency_window_s: f64,

    /// Bonus per additional recent modality (default: 0.05)
    pub diversity_bonus: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            recency_tau_s: 2.0,
            recency_window_s: 1.0,
            diversity_bonus: 0.05,
        }
    }
}

impl ConfidenceConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        check_positive("confidence.recency_tau_s", self.recency_tau_s)?;
        check_positive("confidence.recency_window_s", self.recency_window_s)?;
        if !(0.0..=1.0).contains(&self.diversity_bonus) {
            return Err(SessionError::invalid_config("confidence.diversity_bonus must lie in [0, 1]"));
        }
        Ok(())
    }
}

/// Latest accepted correction for one modality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModalityQuality {
    pub confidence: f64,
    pub timestamp: f64,
}

/// Tracks per-modality correction quality and derives the session confidence.
///
/// ```text
/// confidence = clamp(mean_q × exp(−age / τ) + bonus × (n − 1), 0, 1)
/// ```
///
/// over the `n` modalities corrected within the recency window, where
/// `age` is the time since the newest of them.
#[derive(Debug, Clone)]
pub struct ConfidenceTracker {
    config: ConfidenceConfig,
    latest: BTreeMap<Modality, ModalityQuality>,
}

impl ConfidenceTracker {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self {
            config,
            latest: BTreeMap::new(),
        }
    }

    /// Records an accepted correction.
    pub fn record(&mut self, modality: Modality, confidence: f64, timestamp: f64) {
        let entry = self.latest.entry(modality).or_insert(ModalityQuality { confidence, timestamp });
        if timestamp >= entry.timestamp {
            *entry = ModalityQuality { confidence, timestamp };
        }
    }

    pub fn latest(&self, modality: Modality) -> Option<ModalityQuality> {
        self.latest.get(&modality).copied()
    }

    /// Modalities with a correction inside the recency window.
    pub fn recent_modalities(&self, now: f64) -> Vec<Modality> {
        self.latest
            .iter()
            .filter(|(_, q)| now - q.timestamp <= self.config.recency_window_s)
            .map(|(m, _)| *m)
            .collect()
    }

    /// Session-level confidence at time `now`.
    pub fn session_confidence(&self, now: f64) -> f64 {
        let recent: Vec<&ModalityQuality> = self
            .latest
            .values()
            .filter(|q| now - q.timestamp <= self.config.recency_window_s)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }

        let n = recent.len() as f64;
        let mean_quality = recent.iter().map(|q| q.confidence).sum::<f64>() / n;
        let newest = recent.iter().map(|q| q.timestamp).fold(f64::NEG_INFINITY, f64::max);
        let age = (now - newest).max(0.0);

        let value = mean_quality * (-age / self.config.recency_tau_s).exp() + self.config.diversity_bonus * (n - 1.0);
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RangingAdapter;
    use crate::cancel::CancelToken;
    use crate::error::RangingError;
    use crate::types::{DistanceRange, ModalityCapability, RangingSample};
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use nalgebra::{Unit, Vector3};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ProbeOnly {
        modality: Modality,
        present: bool,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RangingAdapter for ProbeOnly {
        fn modality(&self) -> Modality {
            self.modality
        }
        async fn initialize(&mut self) -> Result<ModalityCapability, RangingError> {
            if self.present {
                Ok(ModalityCapability {
                    modality: self.modality,
                    range: DistanceRange::new(0.1, 4.0),
                    accuracy_m: 0.01,
                })
            } else {
                Err(RangingError::HardwareUnavailable(self.modality))
            }
        }
        async fn start_session(&mut self) -> Result<(), RangingError> {
            Ok(())
        }
        async fn measure(&mut self, _d: Unit<Vector3<f64>>, _c: &CancelToken) -> Result<RangingSample, RangingError> {
            Err(RangingError::NoEcho)
        }
        async fn stop_session(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Platform {
        present: Vec<Modality>,
        released: Arc<AtomicUsize>,
    }

    impl AdapterProvider for Platform {
        fn create(&self, modality: Modality, _config: &EngineConfig) -> Option<Box<dyn RangingAdapter>> {
            if modality == Modality::Depth {
                return None;
            }
            Some(Box::new(ProbeOnly {
                modality,
                present: self.present.contains(&modality),
                released: self.released.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_detect_and_reinitialize() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut platform = Platform {
            present: vec![Modality::Tof],
            released: released.clone(),
        };
        let config = EngineConfig::default();

        let mut reporter = CapabilityReporter::detect(&platform, &config).await;
        assert_eq!(reporter.capabilities().available_modalities(), vec![Modality::Tof]);
        assert_eq!(released.load(Ordering::SeqCst), 2, "every probe adapter is released");

        platform.present.push(Modality::Sonar);
        assert!(!reporter.capabilities().supports(Modality::Sonar), "cache holds until reinitialize");

        reporter.reinitialize(&platform, &config).await;
        assert_eq!(
            reporter.capabilities().available_modalities(),
            vec![Modality::Sonar, Modality::Tof]
        );
        assert_eq!(reporter.generation(), 2);
    }

    #[test]
    fn test_single_fresh_modality() {
        let mut tracker = ConfidenceTracker::new(ConfidenceConfig::default());
        assert_eq!(tracker.session_confidence(0.0), 0.0);

        tracker.record(Modality::Sonar, 0.9, 1.0);
        assert_relative_eq!(tracker.session_confidence(1.0), 0.9);
        assert_relative_eq!(tracker.session_confidence(1.5), 0.9 * (-0.25f64).exp());
    }

    #[test]
    fn test_diversity_raises_confidence() {
        let mut tracker = ConfidenceTracker::new(ConfidenceConfig::default());
        tracker.record(Modality::Sonar, 0.8, 1.0);
        let single = tracker.session_confidence(1.0);

        tracker.record(Modality::Tof, 0.8, 1.0);
        let pair = tracker.session_confidence(1.0);
        assert_relative_eq!(pair - single, 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_stale_modalities_drop_out() {
        let mut tracker = ConfidenceTracker::new(ConfidenceConfig::default());
        tracker.record(Modality::Sonar, 0.9, 0.0);
        tracker.record(Modality::Tof, 0.7, 2.0);

        assert_eq!(tracker.recent_modalities(2.5), vec![Modality::Tof]);
        assert_relative_eq!(tracker.session_confidence(2.0), 0.7);
        assert_eq!(tracker.session_confidence(10.0), 0.0);
    }

    #[test]
    fn test_older_record_does_not_overwrite() {
        let mut tracker = ConfidenceTracker::new(ConfidenceConfig::default());
        tracker.record(Modality::Depth, 0.9, 2.0);
        tracker.record(Modality::Depth, 0.1, 1.0);
        assert_eq!(tracker.latest(Modality::Depth).unwrap().confidence, 0.9);
    }

    proptest! {
        #[test]
        fn prop_confidence_in_unit_interval(
            records in proptest::collection::vec((0usize..3, 0.0f64..=1.0, 0.0f64..5.0), 0..20),
            now in 0.0f64..6.0,
        ) {
            let mut tracker = ConfidenceTracker::new(ConfidenceConfig::default());
            for (m, c, t) in records {
                tracker.record(Modality::all()[m], c, t);
            }
            let value = tracker.session_confidence(now);
            prop_assert!((0.0..=1.0).contains(&value));
        }
    }
}
