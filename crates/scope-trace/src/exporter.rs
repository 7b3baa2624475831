//! OTLP span exporter construction
//!
//! Builds a batching tracer provider for the configured transport. Export
//! runs entirely inside the SDK's background worker: a collector outage
//! surfaces as logged export errors and dropped spans, never as failures on
//! the request path.

use crate::{Result, TraceError};
use opentelemetry::KeyValue;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use scope_core::{OtlpProtocol, TracingConfig};
use std::time::Duration;
use tracing::info;

/// Build a tracer provider per the configuration.
///
/// Returns `Ok(None)` when no OTLP endpoint is configured, which callers
/// treat as tracing disabled.
pub fn build_tracer_provider(config: &TracingConfig) -> Result<Option<SdkTracerProvider>> {
    let endpoint = match &config.otlp_endpoint {
        Some(endpoint) => endpoint,
        None => return Ok(None),
    };
    if !(0.0..=1.0).contains(&config.sampling_ratio) {
        return Err(TraceError::InvalidConfiguration(format!(
            "sampling_ratio must be within [0.0, 1.0], got {}",
            config.sampling_ratio
        )));
    }

    let timeout = Duration::from_secs(config.export_timeout_seconds);
    let exporter = match config.protocol {
        OtlpProtocol::Grpc => opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .with_timeout(timeout)
            .build()
            .map_err(|e| {
                TraceError::ExportUnavailable(format!("Failed to build OTLP gRPC exporter: {}", e))
            })?,
        OtlpProtocol::HttpProtobuf => opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(endpoint)
            .with_timeout(timeout)
            .build()
            .map_err(|e| {
                TraceError::ExportUnavailable(format!("Failed to build OTLP HTTP exporter: {}", e))
            })?,
    };

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(config.sampling_ratio))
        .with_resource(
            Resource::builder()
                .with_attributes(vec![
                    KeyValue::new("service.name", config.service_name.clone()),
                    KeyValue::new("telemetry.sdk.language", "rust"),
                    KeyValue::new("telemetry.sdk.name", "opentelemetry"),
                ])
                .build(),
        )
        .build();

    info!(
        endpoint = %endpoint,
        protocol = ?config.protocol,
        service = %config.service_name,
        sampling_ratio = config.sampling_ratio,
        "OTLP span exporter initialized"
    );
    Ok(Some(provider))
}
