//! Wiring of the full observability stack
//!
//! The stack owns everything with a lifecycle: the metric registry, the
//! cardinality guard, the throughput flush task, the request tracer, and
//! the scrape endpoint. Engines get per-engine [`StatsAggregator`] handles
//! from it and report through those; the stack itself never sits on the
//! request path.

use crate::Result;
use scope_core::{EngineId, EngineLabels, ObservabilityConfig};
use scope_metrics::{
    CardinalityGuard, EplbMetrics, MetricRegistry, MetricsEndpoint, StatsAggregator,
    ThroughputTracker,
};
use scope_trace::RequestTracer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Running observability pipeline for one serving process
#[derive(Debug)]
pub struct ObservabilityStack {
    config: ObservabilityConfig,
    model: String,
    registry: MetricRegistry,
    guard: Option<Arc<CardinalityGuard>>,
    tracker: Arc<ThroughputTracker>,
    flush_task: Option<tokio::task::JoinHandle<()>>,
    tracer: RequestTracer,
    endpoint: Option<MetricsEndpoint>,
}

impl ObservabilityStack {
    /// Validate the configuration and bring every component up
    pub async fn start(config: ObservabilityConfig, model: impl Into<String>) -> Result<Self> {
        config.validate()?;
        let model = model.into();
        let registry = MetricRegistry::new();

        let guard = if config.eplb.enabled {
            let eplb = EplbMetrics::register(&registry)?;
            let guard = Arc::new(CardinalityGuard::new(
                registry.clone(),
                eplb.per_expert_load.clone(),
                Duration::from_secs(config.expert_debug.window_seconds),
            ));
            if config.expert_debug.enabled {
                guard.activate_default();
            }
            Some(guard)
        } else {
            if config.expert_debug.enabled {
                warn!("expert_debug is enabled but eplb is not, no per-expert export");
            }
            None
        };

        let tracker = Arc::new(ThroughputTracker::new(
            registry.clone(),
            Duration::from_secs(config.metrics.throughput_interval_seconds),
        )?);
        let flush_task = Some(tokio::spawn(tracker.clone().run()));

        let tracer = RequestTracer::from_config(&config.tracing)?;

        let endpoint = if config.metrics.enabled {
            let mut endpoint = MetricsEndpoint::new(registry.clone(), config.metrics.bind_addr);
            endpoint.start().await?;
            Some(endpoint)
        } else {
            None
        };

        info!(
            model = %model,
            metrics_enabled = config.metrics.enabled,
            eplb_enabled = config.eplb.enabled,
            dbo_enabled = config.dbo.enabled,
            tracing_enabled = tracer.is_enabled(),
            "Observability stack started"
        );

        Ok(Self {
            config,
            model,
            registry,
            guard,
            tracker,
            flush_task,
            tracer,
            endpoint,
        })
    }

    /// Create the stats aggregator for one engine, with the EPLB and DBO
    /// sections the configuration enables
    pub fn engine(&self, engine: EngineId) -> Result<StatsAggregator> {
        let labels = EngineLabels::new(self.model.as_str(), engine);
        let mut aggregator =
            StatsAggregator::new(self.registry.clone(), labels, self.tracker.clone())?;
        if let Some(guard) = &self.guard {
            aggregator = aggregator.with_eplb(guard.clone())?;
        }
        if self.config.dbo.enabled {
            aggregator = aggregator.with_dbo()?;
        }
        Ok(aggregator)
    }

    /// The shared metric registry
    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// The request tracer; disabled when no OTLP endpoint is configured
    pub fn tracer(&self) -> &RequestTracer {
        &self.tracer
    }

    /// The per-expert debug guard, present when EPLB is enabled
    pub fn guard(&self) -> Option<&Arc<CardinalityGuard>> {
        self.guard.as_ref()
    }

    /// Scrape URL of the metrics endpoint, when it is running
    pub fn metrics_url(&self) -> Option<String> {
        self.endpoint.as_ref().map(|e| e.metrics_url())
    }

    /// Stop the endpoint, flush the last throughput window, and shut the
    /// tracer down
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
        if let Err(e) = self.tracker.flush() {
            warn!("Final throughput flush failed: {}", e);
        }
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.stop().await;
        }
        self.tracer.shutdown()?;
        info!("Observability stack stopped");
        Ok(())
    }
}
