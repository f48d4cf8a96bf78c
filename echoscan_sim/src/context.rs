//! Simulation context implementing ScanContext for deterministic testing.

use async_trait::async_trait;
use echoscan_env::{ScanContext, SessionId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `ScanContext` using:
/// - Tokio's paused clock on a current-thread runtime: time only moves
///   when every task is asleep, and then jumps to the next deadline
/// - Session ids derived from the master seed
/// - Per-device ChaCha8 streams derived from the master seed
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Virtual time zero
    start: Instant,

    /// Session ids minted so far
    sessions: AtomicU64,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    ///
    /// Must be called inside the simulation runtime so that the start
    /// instant comes from the paused clock.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            sessions: AtomicU64::new(0),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Builds the runtime simulations run on: one thread, paused clock.
    pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
    }

    /// Independent RNG stream for one simulated device.
    pub fn device_rng(&self, stream: u64) -> ChaCha8Rng {
        let combined = self.seed.wrapping_mul(0x9e3779b97f4a7c15) ^ stream.wrapping_mul(0x517cc1b727220a95);
        ChaCha8Rng::seed_from_u64(combined)
    }
}

#[async_trait]
impl ScanContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Auto-advances the paused clock once every task is idle
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::debug!("spawning {} at t={:.3}s", name, self.now_secs());
        tokio::spawn(future);
    }

    fn new_session_id(&self) -> SessionId {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst);
        SessionId::from_seed(self.seed.wrapping_add(n.wrapping_mul(0x9e3779b97f4a7c15)))
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
