//! EchoScan Deterministic Simulation Harness
//!
//! Runs the real `echoscan_core` session manager and adapters against a
//! simulated room, so whole capture sessions replay bit-for-bit from a
//! single seed.
//!
//! # Core Principle: Nothing Real Underneath
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: tokio's paused clock on a current-thread runtime; time
//!   jumps to the next deadline whenever every task is asleep
//! - **Devices**: speaker/microphone, ToF sensor and depth camera answer
//!   from ray casts into the room, with seeded noise and fault injection
//! - **Randomness**: every device stream derived from one 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ tokio current-thread runtime (paused clock)          │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                                                     │
//! │  ┌────▼──────────┐   SensorEvent   ┌──────────────┐         │
//! │  │SessionManager │◄────────────────│ IMU feeder   │         │
//! │  │  + worker     │                 └──────▲───────┘         │
//! │  └────┬──────────┘                        │                 │
//! │       │ measure()                         │                 │
//! │  ┌────▼──────────────────┐         ┌──────┴───────┐         │
//! │  │ SimAudio/SimTof/      │────────►│    Room      │         │
//! │  │ SimDepth              │ ray cast│ (truth)      │         │
//! │  └───────────────────────┘         └──────────────┘         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use echoscan_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_duration(5.0).run(ScenarioId::StaticWall);
//! assert!(result.passed);
//! ```

mod context;
pub mod devices;
pub mod room;
pub mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use devices::{FaultProfile, ScriptedPermissions, SimAdapterProvider};
pub use room::{Room, Trajectory};
pub use runner::{sim_engine_config, ScenarioResult, ScenarioRunner, SimError};
pub use scenarios::ScenarioId;
