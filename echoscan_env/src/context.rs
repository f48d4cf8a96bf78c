//! Core environment context trait for EchoScan sessions.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

use crate::types::SessionId;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the device's clock and task scheduler so that the
/// ranging engine can run against real hardware (tokio) and in the
/// deterministic simulation harness with the same code.
///
/// One context is shared by every component of a session; there is no
/// global sensor manager.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, UUID v4 ids
/// - **Simulation**: `SimContext` - virtual clock, seeded ids
#[async_trait]
pub trait ScanContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// All sample and fusion timestamps are expressed on this clock.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the current monotonic time in seconds.
    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }

    /// Returns the wall-clock time, used only for session summaries.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock and yields
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// The session worker runs on a task spawned here.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Mints a new session identifier.
    ///
    /// Production ids are random; simulation ids are derived from the seed
    /// so that a failing run can be replayed.
    fn new_session_id(&self) -> SessionId;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
