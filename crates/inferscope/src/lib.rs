//! Observability pipeline for distributed MoE model serving
//!
//! inferscope sits beside a serving engine and turns its raw signals into
//! Prometheus metrics and OTLP request spans:
//!
//! - Scheduler step stats become gauges, counters, and histograms covering
//!   queue depth, expert-parallel load balance (EPLB), and dual-batch
//!   overlap (DBO)
//! - Token counts become windowed throughput rates
//! - Finished requests become single spans with derived latency attributes
//!
//! The [`ObservabilityStack`] wires everything together from one
//! configuration; the underlying crates remain usable on their own.

pub mod stack;

pub use stack::ObservabilityStack;

pub use scope_core::{
    DboConfig, DboFalloutReason, DboSnapshot, EngineId, EngineLabels, EplbConfig, EplbSnapshot,
    ExpertDebugConfig, LoggingConfig, MetricsConfig, ObservabilityConfig, OtlpProtocol, Phase,
    RequestTraceRecord, SamplingParams, SchedulerStepStats, TracingConfig,
};
pub use scope_metrics::{
    CardinalityGuard, MetricRegistry, MetricsEndpoint, RegistrySnapshot, StatsAggregator,
    ThroughputTracker,
};
pub use scope_trace::{RequestTrace, RequestTracer};

use thiserror::Error;

/// Top-level pipeline error
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] scope_core::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] scope_metrics::MetricsError),

    #[error("Trace error: {0}")]
    Trace(#[from] scope_trace::TraceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Initialize logging from configuration.
///
/// Call once at process startup, before starting the stack. Respects
/// `RUST_LOG` over the configured level when set.
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match logging_config.format.as_str() {
        "json" => subscriber
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e))),
        _ => subscriber
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e))),
    }
}
