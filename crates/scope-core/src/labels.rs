//! Label schema for inferscope metrics
//!
//! Every contract metric is keyed by a fixed, ordered tuple of label values.
//! The schema lives here so the registry, the aggregator, and tests agree on
//! label names and ordering without stringly-typed call sites.

use crate::EngineId;
use serde::{Deserialize, Serialize};

/// Label names used by the contract metric families
pub mod names {
    /// Served model name
    pub const MODEL: &str = "model";
    /// Logical engine index within the process
    pub const ENGINE: &str = "engine";
    /// MoE layer index
    pub const LAYER: &str = "layer";
    /// Global expert index within a layer
    pub const EXPERT_ID: &str = "expert_id";
    /// Batch execution phase (prefill or decode)
    pub const PHASE: &str = "phase";
    /// Fallout reason on the DBO fallout counter
    pub const REASON: &str = "reason";
    /// Micro-batch index (0 or 1)
    pub const UBATCH_INDEX: &str = "ubatch_index";
}

/// Base label tuple identifying one logical engine: (model, engine)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineLabels {
    /// Model name (e.g., "mixtral-8x7b")
    pub model: String,

    /// Engine instance identifier
    pub engine: EngineId,
}

impl EngineLabels {
    /// Create a new label tuple, sanitizing the model value
    pub fn new(model: impl Into<String>, engine: impl Into<EngineId>) -> Self {
        Self {
            model: sanitize_label_value(&model.into()),
            engine: engine.into(),
        }
    }

    /// Label values in schema order
    pub fn values(&self) -> [&str; 2] {
        [self.model.as_str(), self.engine.as_str()]
    }
}

impl std::fmt::Display for EngineLabels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.model, self.engine)
    }
}

/// Sanitize a label value for Prometheus (printable characters only)
pub fn sanitize_label_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}
