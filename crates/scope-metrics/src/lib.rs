//! # scope-metrics
//!
//! Metrics handling for inferscope - typed registry and Prometheus exposition.
//!
//! This crate turns engine stats records into the contract metric families:
//! - A typed metric registry with lazy per-label instances and atomic updates
//! - A per-engine stats aggregator for EPLB, DBO, and scheduler metrics
//! - A cardinality guard that time-boxes high-cardinality debug metrics
//! - A throughput tracker refreshing token-rate gauges on a fixed cadence
//! - An axum scrape endpoint serving the Prometheus text format

pub mod aggregator;
pub mod endpoint;
pub mod guard;
pub mod instruments;
pub mod registry;
pub mod throughput;

// Re-export commonly used types
pub use aggregator::StatsAggregator;
pub use endpoint::MetricsEndpoint;
pub use guard::{CardinalityGuard, DebugWindow};
pub use instruments::{DboMetrics, EplbMetrics, SchedulerMetrics, ThroughputMetrics};
pub use registry::{
    InstanceSnapshot, InstanceValue, MetricDefinition, MetricHandle, MetricKind, MetricOp,
    MetricRegistry, MetricSnapshot, RegistrySnapshot,
};
pub use throughput::ThroughputTracker;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Duplicate metric: {name} is already registered with a different definition")]
    DuplicateMetric { name: String },

    #[error("Label arity mismatch for {name}: expected {expected} values, got {got}")]
    LabelArity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Invalid operation {op} for {kind} metric {name}")]
    InvalidOperation {
        name: String,
        kind: registry::MetricKind,
        op: &'static str,
    },

    #[error("Invalid definition for {name}: {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
