//! Configuration management for inferscope
//!
//! Provides a layered configuration system: built-in defaults, an optional
//! YAML file, and `INFERSCOPE_`-prefixed environment variable overrides.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration for the observability pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics exposition and throughput configuration
    pub metrics: MetricsConfig,

    /// Trace export configuration
    pub tracing: TracingConfig,

    /// Expert-parallel load-balance metrics feature flag
    pub eplb: EplbConfig,

    /// Dual-batch-overlap metrics feature flag
    pub dbo: DboConfig,

    /// Per-expert debug metrics configuration
    pub expert_debug: ExpertDebugConfig,
}

impl ObservabilityConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        // Start with defaults
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add configuration file if it exists
        if let Ok(config_path) = std::env::var("INFERSCOPE_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            // Try common config file locations
            for path in &["./inferscope.yaml", "/etc/inferscope/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        // Add environment variables with INFERSCOPE_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("INFERSCOPE")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;

        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let parsed: Self = serde_yaml::from_str(yaml)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Serialize configuration to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;
        self.metrics.validate()?;
        self.tracing.validate()?;
        self.expert_debug.validate()?;
        Ok(())
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            tracing: TracingConfig::default(),
            eplb: EplbConfig::default(),
            dbo: DboConfig::default(),
            expert_debug: ExpertDebugConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json or text)
    pub format: String,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(Error::config(format!(
                "Unknown log format '{}', expected 'json' or 'text'",
                other
            ))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Metrics exposition and throughput configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus scrape endpoint
    pub enabled: bool,

    /// Scrape endpoint bind address
    pub bind_addr: SocketAddr,

    /// Throughput gauge refresh interval in seconds
    pub throughput_interval_seconds: u64,
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.throughput_interval_seconds == 0 {
            return Err(Error::config(
                "metrics.throughput_interval_seconds must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            throughput_interval_seconds: 10,
        }
    }
}

/// Wire encoding for OTLP span export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtlpProtocol {
    /// OTLP over gRPC
    Grpc,
    /// OTLP over HTTP with protobuf payloads
    HttpProtobuf,
}

impl std::str::FromStr for OtlpProtocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "grpc" => Ok(OtlpProtocol::Grpc),
            "http_protobuf" | "http/protobuf" | "http" => Ok(OtlpProtocol::HttpProtobuf),
            _ => Err(format!("Unknown OTLP protocol: {}", s)),
        }
    }
}

impl fmt::Display for OtlpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtlpProtocol::Grpc => write!(f, "grpc"),
            OtlpProtocol::HttpProtobuf => write!(f, "http_protobuf"),
        }
    }
}

/// Trace export configuration.
///
/// Tracing is off unless `otlp_endpoint` is set; with no endpoint the trace
/// manager hands out no-op request traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    /// OTLP collector endpoint (e.g., "http://otel-collector:4317")
    pub otlp_endpoint: Option<String>,

    /// Wire encoding used for export
    pub protocol: OtlpProtocol,

    /// Value of the `service.name` resource attribute
    pub service_name: String,

    /// Head sampling ratio in [0.0, 1.0]
    pub sampling_ratio: f64,

    /// Export request timeout in seconds
    pub export_timeout_seconds: u64,
}

impl TracingConfig {
    /// Whether trace export is configured at all
    pub fn is_enabled(&self) -> bool {
        self.otlp_endpoint.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.otlp_endpoint {
            if endpoint.trim().is_empty() {
                return Err(Error::config("tracing.otlp_endpoint must not be empty"));
            }
        }
        if !(0.0..=1.0).contains(&self.sampling_ratio) {
            return Err(Error::config(format!(
                "tracing.sampling_ratio must be within [0.0, 1.0], got {}",
                self.sampling_ratio
            )));
        }
        if self.export_timeout_seconds == 0 {
            return Err(Error::config(
                "tracing.export_timeout_seconds must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            protocol: OtlpProtocol::Grpc,
            service_name: "inferscope".to_string(),
            sampling_ratio: 1.0,
            export_timeout_seconds: 10,
        }
    }
}

/// Expert-parallel load-balance metrics feature flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EplbConfig {
    /// Register and populate the EPLB metric families
    pub enabled: bool,
}

impl Default for EplbConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Dual-batch-overlap metrics feature flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DboConfig {
    /// Register and populate the DBO metric families
    pub enabled: bool,
}

impl Default for DboConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Per-expert debug metrics configuration.
///
/// Per-expert gauges multiply series cardinality by layers x experts, so
/// they only exist inside an explicitly opened, time-boxed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertDebugConfig {
    /// Open a debug window when the pipeline starts
    pub enabled: bool,

    /// Debug window duration in seconds
    pub window_seconds: u64,
}

impl ExpertDebugConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_seconds == 0 {
            return Err(Error::config(
                "expert_debug.window_seconds must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for ExpertDebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_seconds: 300,
        }
    }
}
