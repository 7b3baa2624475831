//! Request-scoped distributed tracing for the serving pipeline
//!
//! One span per request, created only when the request finishes so that
//! aborted work exports nothing. Trace context travels through explicit
//! carrier types, never through task-local or thread-local ambience, and a
//! disabled tracer reduces every operation to a no-op.

pub mod context;
pub mod exporter;
pub mod span;

pub use context::{extract_context, extract_from_headers, inject_context, HeaderExtractor, HeaderInjector};
pub use exporter::build_tracer_provider;
pub use span::{attributes, RequestTrace, RequestTracer};

use thiserror::Error;

/// Errors from the tracing pipeline
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Invalid span transition: cannot {operation} a request trace that is {state}")]
    InvalidSpanState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Export unavailable: {0}")]
    ExportUnavailable(String),

    #[error("Invalid tracing configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for tracing operations
pub type Result<T> = std::result::Result<T, TraceError>;
