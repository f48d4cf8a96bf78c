//! Device implementation of ScanContext on Tokio.

use crate::{ScanContext, SessionId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::time::Instant;

/// Device context backed by the Tokio clock and runtime.
///
/// Time comes from `tokio::time::Instant`, so a paused test runtime drives
/// it deterministically. Session workers go to `handle` when one is given,
/// which lets a platform thread that is not itself inside the runtime
/// (an app main loop, a sensor callback thread) start sessions.
pub struct TokioContext {
    /// Origin of `now()`
    start: Instant,

    /// Runtime that receives spawned tasks; the ambient one if `None`
    handle: Option<Handle>,
}

impl TokioContext {
    /// Context spawning onto the ambient runtime.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            handle: None,
        }
    }

    /// Context spawning onto a specific runtime.
    pub fn on(handle: Handle) -> Self {
        Self {
            start: Instant::now(),
            handle: Some(handle),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task = name.to_string();
        let traced = async move {
            future.await;
            tracing::debug!("task {} finished", task);
        };
        tracing::debug!("spawning task {}", name);
        match &self.handle {
            Some(handle) => drop(handle.spawn(traced)),
            None => drop(tokio::spawn(traced)),
        }
    }

    fn new_session_id(&self) -> SessionId {
        SessionId::new()
    }

    fn seed(&self) -> u64 {
        // Devices are not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_sleep() {
        let ctx = TokioContext::new();
        let before = ctx.now();
        ctx.sleep(Duration::from_millis(250)).await;
        let slept = ctx.now() - before;

        assert!(slept >= Duration::from_millis(250));
        assert!(slept < Duration::from_millis(260));
        assert!((ctx.now_secs() - slept.as_secs_f64()).abs() < 0.01);
    }

    #[test]
    fn test_spawn_from_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let ctx = TokioContext::on(runtime.handle().clone());

        // Called from a plain thread: only the explicit handle can work
        let (tx, rx) = oneshot::channel();
        ctx.spawn("answer", async move {
            let _ = tx.send(7u8);
        });
        assert_eq!(runtime.block_on(rx).unwrap(), 7);
    }

    #[test]
    fn test_session_ids_are_unique_and_unseeded() {
        let ctx = TokioContext::new();
        assert_ne!(ctx.new_session_id(), ctx.new_session_id());
        assert_eq!(ctx.seed(), 0);
    }
}
