//! Permission gate abstraction for hardware access.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Hardware that may need user authorization before a session can use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hardware {
    /// Audio capture (sonar echo recording)
    Microphone,
    /// Audio playback (sonar chirp emission)
    Speaker,
    /// Optical proximity / time-of-flight emitter
    ProximitySensor,
    /// Camera or structured-light depth sensor
    Camera,
}

impl std::fmt::Display for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Hardware::Microphone => "microphone",
            Hardware::Speaker => "speaker",
            Hardware::ProximitySensor => "proximity_sensor",
            Hardware::Camera => "camera",
        };
        f.write_str(name)
    }
}

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

impl PermissionStatus {
    /// Returns true if access was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionStatus::Granted)
    }
}

/// External collaborator that answers "may this session use `hardware`?".
///
/// The platform layer implements this with its authorization prompts.
/// A denial is an ordinary answer, never an error.
///
/// # Flow
///
/// ```text
/// SessionManager            PermissionGate               Platform
///   |                           |                           |
///   |-- request(Microphone) --->|                           |
///   |                           |-- prompt / cached ------->|
///   |<-- Granted | Denied ------|<--------------------------|
/// ```
#[async_trait]
pub trait PermissionGate: Send + Sync + 'static {
    /// Requests access to a piece of hardware.
    async fn request(&self, hardware: Hardware) -> PermissionStatus;
}

/// Gate that grants everything (headless tools, tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantAll;

#[async_trait]
impl PermissionGate for GrantAll {
    async fn request(&self, _hardware: Hardware) -> PermissionStatus {
        PermissionStatus::Granted
    }
}
