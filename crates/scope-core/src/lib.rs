//! # scope-core
//!
//! Core types and utilities for inferscope - an observability pipeline for
//! distributed MoE inference serving.
//!
//! This crate provides the foundational data structures shared across the
//! other inferscope components. It includes:
//!
//! - Stats records emitted by the serving engine (scheduler steps, EPLB and
//!   DBO snapshots, request lifecycle records)
//! - The fixed label schema used by the contract metric families
//! - Configuration schema with layered loading and validation
//! - Error handling types and utilities

pub mod config;
pub mod error;
pub mod labels;
pub mod stats;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    DboConfig, EplbConfig, ExpertDebugConfig, LoggingConfig, MetricsConfig, ObservabilityConfig,
    OtlpProtocol, TracingConfig,
};
pub use error::{Error, ErrorContext, Result};
pub use labels::EngineLabels;
pub use stats::{
    DboSnapshot, EplbSnapshot, RequestTraceRecord, SamplingParams, SchedulerStepStats,
};
pub use types::{DboFalloutReason, EngineId, Phase};
