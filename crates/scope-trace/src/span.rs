//! Per-request span lifecycle
//!
//! A [`RequestTrace`] moves through not-started, active, and finalized
//! states. The underlying OTLP span is not created until finalization, with
//! its start and end timestamps taken from the request record, so a request
//! that is aborted mid-flight leaves no span behind. Invalid transitions are
//! rejected and logged; they never panic and never touch the exporter.

use crate::context::HeaderInjector;
use crate::exporter::build_tracer_provider;
use crate::{Result, TraceError};
use opentelemetry::propagation::{Injector, TextMapPropagator};
use opentelemetry::trace::{Span, SpanKind, Tracer, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use scope_core::{RequestTraceRecord, TracingConfig};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;

/// Span name carried by every request span
pub const SPAN_NAME: &str = "llm_request";

/// Attribute keys recorded on request spans
pub mod attributes {
    pub const REQUEST_ID: &str = "gen_ai.request.id";
    pub const PROMPT_TOKENS: &str = "gen_ai.usage.prompt_tokens";
    pub const COMPLETION_TOKENS: &str = "gen_ai.usage.completion_tokens";
    pub const TEMPERATURE: &str = "gen_ai.request.temperature";
    pub const TOP_P: &str = "gen_ai.request.top_p";
    pub const MAX_TOKENS: &str = "gen_ai.request.max_tokens";
    pub const N: &str = "gen_ai.request.n";
    pub const TIME_IN_QUEUE: &str = "gen_ai.latency.time_in_queue";
    pub const TIME_TO_FIRST_TOKEN: &str = "gen_ai.latency.time_to_first_token";
    pub const PREFILL_TIME: &str = "gen_ai.latency.prefill";
    pub const DECODE_TIME: &str = "gen_ai.latency.decode";
    pub const E2E_TIME: &str = "gen_ai.latency.e2e";
    pub const INFERENCE_TIME: &str = "gen_ai.latency.inference";
}

#[derive(Debug)]
struct TracerShared {
    provider: SdkTracerProvider,
    propagator: TraceContextPropagator,
}

/// Factory for per-request traces.
///
/// Cloning is cheap; all clones share one tracer provider. A tracer built
/// without an exporter is permanently disabled and hands out traces whose
/// operations all succeed as no-ops.
#[derive(Debug, Clone)]
pub struct RequestTracer {
    shared: Option<Arc<TracerShared>>,
}

impl RequestTracer {
    /// A tracer that never exports anything
    pub fn disabled() -> Self {
        Self { shared: None }
    }

    /// Build a tracer from configuration. Without an OTLP endpoint the
    /// tracer comes up disabled.
    pub fn from_config(config: &TracingConfig) -> Result<Self> {
        match build_tracer_provider(config)? {
            Some(provider) => Ok(Self::with_provider(provider)),
            None => Ok(Self::disabled()),
        }
    }

    /// Build a tracer over an existing provider
    pub fn with_provider(provider: SdkTracerProvider) -> Self {
        Self {
            shared: Some(Arc::new(TracerShared {
                provider,
                propagator: TraceContextPropagator::new(),
            })),
        }
    }

    /// Whether spans will actually be exported
    pub fn is_enabled(&self) -> bool {
        self.shared.is_some()
    }

    /// Start tracking one request
    pub fn request(&self) -> RequestTrace {
        let state = if self.shared.is_some() {
            SpanState::NotStarted
        } else {
            SpanState::Disabled
        };
        RequestTrace {
            shared: self.shared.clone(),
            state,
        }
    }

    /// Flush pending spans and shut the provider down
    pub fn shutdown(&self) -> Result<()> {
        if let Some(shared) = &self.shared {
            shared
                .provider
                .shutdown()
                .map_err(|e| TraceError::ExportUnavailable(e.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum SpanState {
    Disabled,
    NotStarted,
    Active { parent: Context },
    Finalized,
}

impl SpanState {
    fn name(&self) -> &'static str {
        match self {
            SpanState::Disabled => "disabled",
            SpanState::NotStarted => "not started",
            SpanState::Active { .. } => "active",
            SpanState::Finalized => "finalized",
        }
    }
}

/// Lifecycle handle for a single request's span
#[derive(Debug)]
pub struct RequestTrace {
    shared: Option<Arc<TracerShared>>,
    state: SpanState,
}

impl RequestTrace {
    /// Activate the trace, optionally under an extracted parent context.
    ///
    /// Valid only from the not-started state. On a disabled trace this is a
    /// no-op that reports success.
    pub fn begin(&mut self, parent: Option<Context>) -> Result<()> {
        match self.state {
            SpanState::Disabled => Ok(()),
            SpanState::NotStarted => {
                self.state = SpanState::Active {
                    parent: parent.unwrap_or_default(),
                };
                Ok(())
            }
            _ => {
                let err = TraceError::InvalidSpanState {
                    operation: "begin",
                    state: self.state.name(),
                };
                warn!("{}", err);
                Err(err)
            }
        }
    }

    /// Whether the trace is currently active
    pub fn is_active(&self) -> bool {
        matches!(self.state, SpanState::Active { .. })
    }

    /// Whether the trace has been finalized
    pub fn is_finalized(&self) -> bool {
        matches!(self.state, SpanState::Finalized)
    }

    /// Inject the request's trace context into a carrier for downstream
    /// calls. Valid only while active; a disabled trace writes nothing.
    pub fn inject(&self, carrier: &mut dyn Injector) -> Result<()> {
        let shared = match &self.shared {
            Some(shared) => shared,
            None => return Ok(()),
        };
        match &self.state {
            SpanState::Active { parent } => {
                shared.propagator.inject_context(parent, carrier);
                Ok(())
            }
            state => {
                let err = TraceError::InvalidSpanState {
                    operation: "inject from",
                    state: state.name(),
                };
                warn!("{}", err);
                Err(err)
            }
        }
    }

    /// Inject the request's trace context into HTTP headers
    pub fn inject_headers(&self, headers: &mut http::HeaderMap) -> Result<()> {
        self.inject(&mut HeaderInjector(headers))
    }

    /// Finalize the trace with the finished request's record.
    ///
    /// This is the only point at which a span is built: start and end times
    /// come from the record, latency and token attributes are derived from
    /// it, and the span is handed to the exporter on end. Valid only from
    /// the active state, at most once.
    pub fn finalize(&mut self, record: &RequestTraceRecord) -> Result<()> {
        match std::mem::replace(&mut self.state, SpanState::Finalized) {
            SpanState::Disabled => {
                self.state = SpanState::Disabled;
                Ok(())
            }
            SpanState::Active { parent } => {
                if let Some(shared) = &self.shared {
                    export_span(shared, &parent, record);
                }
                Ok(())
            }
            other => {
                let err = TraceError::InvalidSpanState {
                    operation: "finalize",
                    state: other.name(),
                };
                self.state = other;
                warn!(request_id = %record.request_id, "{}", err);
                Err(err)
            }
        }
    }
}

fn export_span(shared: &TracerShared, parent: &Context, record: &RequestTraceRecord) {
    let mut span_attributes = vec![
        KeyValue::new(attributes::REQUEST_ID, record.request_id.clone()),
        KeyValue::new(attributes::PROMPT_TOKENS, record.prompt_tokens as i64),
        KeyValue::new(attributes::COMPLETION_TOKENS, record.completion_tokens as i64),
        KeyValue::new(attributes::TIME_IN_QUEUE, record.time_in_queue()),
        KeyValue::new(attributes::TIME_TO_FIRST_TOKEN, record.time_to_first_token()),
        KeyValue::new(attributes::PREFILL_TIME, record.prefill_time()),
        KeyValue::new(attributes::DECODE_TIME, record.decode_time()),
        KeyValue::new(attributes::E2E_TIME, record.e2e_time()),
        KeyValue::new(attributes::INFERENCE_TIME, record.inference_time()),
    ];
    if let Some(temperature) = record.sampling.temperature {
        span_attributes.push(KeyValue::new(attributes::TEMPERATURE, temperature));
    }
    if let Some(top_p) = record.sampling.top_p {
        span_attributes.push(KeyValue::new(attributes::TOP_P, top_p));
    }
    if let Some(max_tokens) = record.sampling.max_tokens {
        span_attributes.push(KeyValue::new(attributes::MAX_TOKENS, max_tokens as i64));
    }
    if let Some(n) = record.sampling.n {
        span_attributes.push(KeyValue::new(attributes::N, n as i64));
    }

    let tracer = shared.provider.tracer("inferscope");
    let mut span = tracer
        .span_builder(SPAN_NAME)
        .with_kind(SpanKind::Server)
        .with_start_time(SystemTime::from(record.arrival))
        .with_attributes(span_attributes)
        .start_with_context(&tracer, parent);
    span.end_with_timestamp(SystemTime::from(record.completion));
}
