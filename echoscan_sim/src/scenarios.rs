//! Capture scenarios for the simulation harness.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SIM-001: Device held still in front of a wall, every modality on
    StaticWall,

    /// SIM-002: Device walked one meter toward the wall
    Approach,

    /// SIM-003: Audio route lost mid-session
    SonarDropout,

    /// SIM-004: Microphone permission refused
    MicDenied,

    /// SIM-005: Every optical reading fails
    Exhaustion,

    /// SIM-006: Static wall under each fusion algorithm
    AlgorithmSweep,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::StaticWall,
            ScenarioId::Approach,
            ScenarioId::SonarDropout,
            ScenarioId::MicDenied,
            ScenarioId::Exhaustion,
            ScenarioId::AlgorithmSweep,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::StaticWall => "static_wall",
            ScenarioId::Approach => "approach",
            ScenarioId::SonarDropout => "sonar_dropout",
            ScenarioId::MicDenied => "mic_denied",
            ScenarioId::Exhaustion => "exhaustion",
            ScenarioId::AlgorithmSweep => "algorithm_sweep",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::StaticWall => "Still device 2.5 m from a wall, sonar + ToF + depth fused",
            ScenarioId::Approach => "Device walked from 3 m to 2 m, fused distance tracks the wall",
            ScenarioId::SonarDropout => "Audio route lost after 1 s, session continues on optical modalities",
            ScenarioId::MicDenied => "Microphone refused: required sonar aborts, optional sonar is dropped",
            ScenarioId::Exhaustion => "ToF and depth never return, session ends by itself",
            ScenarioId::AlgorithmSweep => "Kalman, complementary and Madgwick on the same wall",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static_wall" | "staticwall" | "sim-001" => Ok(ScenarioId::StaticWall),
            "approach" | "sim-002" => Ok(ScenarioId::Approach),
            "sonar_dropout" | "sonardropout" | "sim-003" => Ok(ScenarioId::SonarDropout),
            "mic_denied" | "micdenied" | "sim-004" => Ok(ScenarioId::MicDenied),
            "exhaustion" | "sim-005" => Ok(ScenarioId::Exhaustion),
            "algorithm_sweep" | "algorithmsweep" | "sim-006" => Ok(ScenarioId::AlgorithmSweep),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("SIM-004".parse::<ScenarioId>(), Ok(ScenarioId::MicDenied));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
