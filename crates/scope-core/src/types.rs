//! Core type definitions for inferscope

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a logical engine instance within a serving process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineId(String);

impl EngineId {
    /// Create a new EngineId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create an EngineId from an engine index
    pub fn from_index(index: usize) -> Self {
        Self(index.to_string())
    }

    /// Generate a random EngineId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the string representation of the EngineId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EngineId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EngineId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<usize> for EngineId {
    fn from(index: usize) -> Self {
        Self::from_index(index)
    }
}

/// Batch execution phases of the serving engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Prompt processing
    Prefill,
    /// Token generation
    Decode,
}

impl Phase {
    /// Label value used on phase-keyed metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            Phase::Prefill => "prefill",
            Phase::Decode => "decode",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prefill" => Ok(Phase::Prefill),
            "decode" => Ok(Phase::Decode),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Reasons a dual-batch-overlap step reverted to single-batch execution.
///
/// A closed set: engine-side causes not listed here are reported as `Other`
/// so the fallout counter keeps a bounded label space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DboFalloutReason {
    /// The second micro-batch had no tokens to run
    EmptySecondUbatch,
    /// The overlapped batches failed to coordinate
    CoordinationFailure,
    /// Any other engine-side cause
    Other,
}

impl DboFalloutReason {
    /// All reasons, in label order
    pub const ALL: [DboFalloutReason; 3] = [
        DboFalloutReason::EmptySecondUbatch,
        DboFalloutReason::CoordinationFailure,
        DboFalloutReason::Other,
    ];

    /// Label value used on the fallout counter
    pub fn as_label(&self) -> &'static str {
        match self {
            DboFalloutReason::EmptySecondUbatch => "empty_second_ubatch",
            DboFalloutReason::CoordinationFailure => "coordination_failure",
            DboFalloutReason::Other => "other",
        }
    }
}

impl std::str::FromStr for DboFalloutReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "empty_second_ubatch" => DboFalloutReason::EmptySecondUbatch,
            "coordination_failure" => DboFalloutReason::CoordinationFailure,
            _ => DboFalloutReason::Other,
        })
    }
}

impl fmt::Display for DboFalloutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_id_creation() {
        let id1 = EngineId::new("engine-a");
        assert_eq!(id1.as_str(), "engine-a");

        let id2 = EngineId::from_index(3);
        assert_eq!(id2.as_str(), "3");

        let id3 = EngineId::generate();
        assert!(!id3.as_str().is_empty());
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(Phase::Prefill.as_label(), "prefill");
        assert_eq!(Phase::Decode.as_label(), "decode");
        assert_eq!("decode".parse::<Phase>().unwrap(), Phase::Decode);
        assert!("warmup".parse::<Phase>().is_err());
    }

    #[test]
    fn test_fallout_reason_labels() {
        assert_eq!(
            DboFalloutReason::EmptySecondUbatch.as_label(),
            "empty_second_ubatch"
        );
        assert_eq!(
            "coordination_failure".parse::<DboFalloutReason>().unwrap(),
            DboFalloutReason::CoordinationFailure
        );
    }

    #[test]
    fn test_fallout_reason_unknown_maps_to_other() {
        assert_eq!(
            "cuda_graph_capture".parse::<DboFalloutReason>().unwrap(),
            DboFalloutReason::Other
        );
    }

    #[test]
    fn test_fallout_reason_closed_set() {
        let labels: Vec<&str> = DboFalloutReason::ALL.iter().map(|r| r.as_label()).collect();
        assert_eq!(
            labels,
            vec!["empty_second_ubatch", "coordination_failure", "other"]
        );
    }
}
