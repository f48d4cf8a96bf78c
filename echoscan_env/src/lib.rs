//! EchoScan Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam allowing the EchoScan ranging
//! engine to run both on a **Device** (tokio) and in **Simulation**.
//!
//! # Core Concept
//!
//! Everything a session needs from the outside world goes through an
//! explicit, session-scoped context instead of global sensor managers:
//! - Time (`now()`, `sleep()`)
//! - Task scheduling (`spawn()`)
//! - Identity (`new_session_id()`)
//! - Authorization (`PermissionGate::request()`)
//!
//! # Example
//!
//! ```ignore
//! use echoscan_env::{ScanContext, TokioContext};
//!
//! async fn sampling_loop<Ctx: ScanContext>(ctx: &Ctx, rate_hz: f64) {
//!     loop {
//!         ctx.sleep(Duration::from_secs_f64(1.0 / rate_hz)).await;
//!         tick(ctx.now_secs());
//!     }
//! }
//! ```

mod context;
mod permission;
mod types;
mod error;
mod tokio_impl;

pub use context::ScanContext;
pub use permission::{GrantAll, Hardware, PermissionGate, PermissionStatus};
pub use types::SessionId;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
