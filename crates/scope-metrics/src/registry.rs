//! Typed metric registry backed by Prometheus
//!
//! The registry is the single write surface for every metric in the
//! pipeline. Callers register a [`MetricDefinition`] once, keep the returned
//! [`MetricHandle`], and record operations against it. Instances for a label
//! tuple are created lazily on first write and updated atomically, so
//! concurrent writers on distinct tuples never contend on a shared lock.

use crate::{MetricsError, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder};
use std::fmt;
use std::sync::Arc;

/// Kind of a metric family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonically increasing value
    Counter,
    /// Value that can move in both directions
    Gauge,
    /// Distribution of observations over fixed buckets
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// A single write against a metric instance.
///
/// Each operation is valid for exactly one kind: `Increment` for counters,
/// `Set` for gauges, `Observe` for histograms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricOp {
    /// Add a non-negative amount to a counter
    Increment(f64),
    /// Set a gauge
    Set(f64),
    /// Observe a histogram sample
    Observe(f64),
}

impl MetricOp {
    /// Operation name for error messages
    pub fn name(&self) -> &'static str {
        match self {
            MetricOp::Increment(_) => "increment",
            MetricOp::Set(_) => "set",
            MetricOp::Observe(_) => "observe",
        }
    }
}

/// Immutable description of a metric family
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    /// Metric name in the exposition format
    pub name: String,

    /// Human-readable help text
    pub help: String,

    /// Metric kind
    pub kind: MetricKind,

    /// Ordered label names; every record must supply exactly these
    pub labels: Vec<String>,

    /// Bucket upper bounds, histograms only
    pub buckets: Option<Vec<f64>>,
}

impl MetricDefinition {
    /// Define a counter family
    pub fn counter(name: impl Into<String>, help: impl Into<String>, labels: &[&str]) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind: MetricKind::Counter,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            buckets: None,
        }
    }

    /// Define a gauge family
    pub fn gauge(name: impl Into<String>, help: impl Into<String>, labels: &[&str]) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind: MetricKind::Gauge,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            buckets: None,
        }
    }

    /// Define a histogram family with explicit bucket bounds
    pub fn histogram(
        name: impl Into<String>,
        help: impl Into<String>,
        labels: &[&str],
        buckets: &[f64],
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind: MetricKind::Histogram,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            buckets: Some(buckets.to_vec()),
        }
    }

    /// Validate the definition before registration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MetricsError::InvalidDefinition {
                name: "<empty>".to_string(),
                reason: "metric name must not be empty".to_string(),
            });
        }
        if self.help.is_empty() {
            return Err(MetricsError::InvalidDefinition {
                name: self.name.clone(),
                reason: "help text must not be empty".to_string(),
            });
        }
        match (&self.kind, &self.buckets) {
            (MetricKind::Histogram, Some(buckets)) => {
                if buckets.is_empty() {
                    return Err(MetricsError::InvalidDefinition {
                        name: self.name.clone(),
                        reason: "histogram bucket list must not be empty".to_string(),
                    });
                }
                if buckets.iter().any(|b| !b.is_finite()) {
                    return Err(MetricsError::InvalidDefinition {
                        name: self.name.clone(),
                        reason: "histogram buckets must be finite".to_string(),
                    });
                }
                if !buckets.windows(2).all(|w| w[0] < w[1]) {
                    return Err(MetricsError::InvalidDefinition {
                        name: self.name.clone(),
                        reason: "histogram buckets must be strictly increasing".to_string(),
                    });
                }
            }
            (MetricKind::Histogram, None) => {
                return Err(MetricsError::InvalidDefinition {
                    name: self.name.clone(),
                    reason: "histograms require explicit buckets".to_string(),
                });
            }
            (_, Some(_)) => {
                return Err(MetricsError::InvalidDefinition {
                    name: self.name.clone(),
                    reason: format!("buckets are only valid on histograms, not {}", self.kind),
                });
            }
            (_, None) => {}
        }
        Ok(())
    }
}

/// The underlying Prometheus vector for one family
#[derive(Debug, Clone)]
enum Instrument {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

/// Cheap, cloneable handle to a registered metric family
#[derive(Debug, Clone)]
pub struct MetricHandle {
    definition: Arc<MetricDefinition>,
    instrument: Instrument,
}

impl MetricHandle {
    fn build(definition: MetricDefinition) -> Result<Self> {
        let label_refs: Vec<&str> = definition.labels.iter().map(String::as_str).collect();
        let instrument = match definition.kind {
            MetricKind::Counter => Instrument::Counter(CounterVec::new(
                prometheus::Opts::new(definition.name.as_str(), definition.help.as_str()),
                &label_refs,
            )?),
            MetricKind::Gauge => Instrument::Gauge(GaugeVec::new(
                prometheus::Opts::new(definition.name.as_str(), definition.help.as_str()),
                &label_refs,
            )?),
            MetricKind::Histogram => {
                let mut opts =
                    prometheus::HistogramOpts::new(definition.name.as_str(), definition.help.as_str());
                if let Some(buckets) = &definition.buckets {
                    opts = opts.buckets(buckets.clone());
                }
                Instrument::Histogram(HistogramVec::new(opts, &label_refs)?)
            }
        };
        Ok(Self {
            definition: Arc::new(definition),
            instrument,
        })
    }

    /// The definition this handle was registered with
    pub fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    /// Metric family name
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Metric family kind
    pub fn kind(&self) -> MetricKind {
        self.definition.kind
    }
}

/// Central registry for metric families
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    inner: Arc<MetricRegistryInner>,
}

#[derive(Debug)]
struct MetricRegistryInner {
    /// Prometheus registry backing exposition and snapshots
    registry: prometheus::Registry,

    /// Registered families by name, for duplicate detection
    handles: DashMap<String, MetricHandle>,
}

impl MetricRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricRegistryInner {
                registry: prometheus::Registry::new(),
                handles: DashMap::new(),
            }),
        }
    }

    /// Register a metric family and return its handle.
    ///
    /// Registering the same name with an identical definition is idempotent
    /// and returns the existing handle. The same name with a different
    /// definition fails with [`MetricsError::DuplicateMetric`].
    pub fn register(&self, definition: MetricDefinition) -> Result<MetricHandle> {
        definition.validate()?;
        match self.inner.handles.entry(definition.name.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if *existing.definition() == definition {
                    Ok(existing.clone())
                } else {
                    Err(MetricsError::DuplicateMetric {
                        name: definition.name,
                    })
                }
            }
            Entry::Vacant(entry) => {
                let handle = MetricHandle::build(definition)?;
                match &handle.instrument {
                    Instrument::Counter(vec) => {
                        self.inner.registry.register(Box::new(vec.clone()))?
                    }
                    Instrument::Gauge(vec) => self.inner.registry.register(Box::new(vec.clone()))?,
                    Instrument::Histogram(vec) => {
                        self.inner.registry.register(Box::new(vec.clone()))?
                    }
                }
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Apply one operation to the instance identified by `label_values`.
    ///
    /// The instance is created on first use. Arity and operation/kind
    /// mismatches are programming errors and fail without touching any
    /// instance; valid writes are a single atomic update.
    pub fn record(&self, handle: &MetricHandle, label_values: &[&str], op: MetricOp) -> Result<()> {
        let expected = handle.definition.labels.len();
        if label_values.len() != expected {
            return Err(MetricsError::LabelArity {
                name: handle.definition.name.clone(),
                expected,
                got: label_values.len(),
            });
        }

        match (&handle.instrument, op) {
            (Instrument::Counter(vec), MetricOp::Increment(amount)) => {
                if amount < 0.0 {
                    return Err(MetricsError::InvalidOperation {
                        name: handle.definition.name.clone(),
                        kind: MetricKind::Counter,
                        op: "increment by a negative amount",
                    });
                }
                vec.with_label_values(label_values).inc_by(amount);
            }
            (Instrument::Gauge(vec), MetricOp::Set(value)) => {
                vec.with_label_values(label_values).set(value);
            }
            (Instrument::Histogram(vec), MetricOp::Observe(value)) => {
                vec.with_label_values(label_values).observe(value);
            }
            (_, op) => {
                return Err(MetricsError::InvalidOperation {
                    name: handle.definition.name.clone(),
                    kind: handle.definition.kind,
                    op: op.name(),
                });
            }
        }
        Ok(())
    }

    /// Remove every labeled instance of one family.
    ///
    /// The family itself stays registered; subsequent records recreate
    /// instances lazily.
    pub fn remove_instances(&self, handle: &MetricHandle) {
        match &handle.instrument {
            Instrument::Counter(vec) => vec.reset(),
            Instrument::Gauge(vec) => vec.reset(),
            Instrument::Histogram(vec) => vec.reset(),
        }
    }

    /// Number of registered families
    pub fn family_count(&self) -> usize {
        self.inner.handles.len()
    }

    /// Take a typed point-in-time snapshot of every registered instance.
    ///
    /// Snapshots may interleave with concurrent writes but each instance
    /// value is read atomically.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let families = self.inner.registry.gather();
        let metrics = families
            .iter()
            .filter_map(MetricSnapshot::from_family)
            .collect();
        RegistrySnapshot {
            taken_at: Utc::now(),
            metrics,
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Export(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| MetricsError::Export(format!("Invalid UTF-8 in metrics output: {}", e)))
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the whole registry
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,

    /// One entry per registered family with at least one known kind
    pub metrics: Vec<MetricSnapshot>,
}

impl RegistrySnapshot {
    /// Find a family by name
    pub fn metric(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Counter value for an exact label tuple
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        match self.metric(name)?.instance(labels)?.value {
            InstanceValue::Counter(v) => Some(v),
            _ => None,
        }
    }

    /// Gauge value for an exact label tuple
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        match self.metric(name)?.instance(labels)?.value {
            InstanceValue::Gauge(v) => Some(v),
            _ => None,
        }
    }

    /// Histogram sample count for an exact label tuple
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        match &self.metric(name)?.instance(labels)?.value {
            InstanceValue::Histogram { count, .. } => Some(*count),
            _ => None,
        }
    }

    /// Histogram sample sum for an exact label tuple
    pub fn histogram_sum(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        match &self.metric(name)?.instance(labels)?.value {
            InstanceValue::Histogram { sum, .. } => Some(*sum),
            _ => None,
        }
    }
}

/// Snapshot of one metric family
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    /// Family name
    pub name: String,

    /// Help text
    pub help: String,

    /// Family kind
    pub kind: MetricKind,

    /// All live instances with their label tuples
    pub instances: Vec<InstanceSnapshot>,
}

impl MetricSnapshot {
    fn from_family(family: &prometheus::proto::MetricFamily) -> Option<Self> {
        let kind = match family.get_field_type() {
            prometheus::proto::MetricType::COUNTER => MetricKind::Counter,
            prometheus::proto::MetricType::GAUGE => MetricKind::Gauge,
            prometheus::proto::MetricType::HISTOGRAM => MetricKind::Histogram,
            _ => return None,
        };

        let instances = family
            .get_metric()
            .iter()
            .map(|metric| {
                let labels = metric
                    .get_label()
                    .iter()
                    .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                    .collect();
                let value = match kind {
                    MetricKind::Counter => InstanceValue::Counter(metric.get_counter().get_value()),
                    MetricKind::Gauge => InstanceValue::Gauge(metric.get_gauge().get_value()),
                    MetricKind::Histogram => {
                        let histogram = metric.get_histogram();
                        InstanceValue::Histogram {
                            sum: histogram.get_sample_sum(),
                            count: histogram.get_sample_count(),
                            buckets: histogram
                                .get_bucket()
                                .iter()
                                .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
                                .collect(),
                        }
                    }
                };
                InstanceSnapshot { labels, value }
            })
            .collect();

        Some(Self {
            name: family.get_name().to_string(),
            help: family.get_help().to_string(),
            kind,
            instances,
        })
    }

    /// Find the instance with exactly this label tuple
    pub fn instance(&self, labels: &[(&str, &str)]) -> Option<&InstanceSnapshot> {
        self.instances.iter().find(|i| i.matches(labels))
    }

    /// Whether the family has no live instances
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Snapshot of one labeled instance
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    /// Label name/value pairs, sorted by name
    pub labels: Vec<(String, String)>,

    /// Instance value at snapshot time
    pub value: InstanceValue,
}

impl InstanceSnapshot {
    /// Exact label-tuple match (same pairs, same count)
    pub fn matches(&self, labels: &[(&str, &str)]) -> bool {
        self.labels.len() == labels.len()
            && labels
                .iter()
                .all(|(k, v)| self.labels.iter().any(|(ik, iv)| ik == k && iv == v))
    }
}

/// Value of one instance at snapshot time
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceValue {
    /// Cumulative counter value
    Counter(f64),
    /// Current gauge value
    Gauge(f64),
    /// Histogram state: cumulative (upper_bound, count) buckets, sum, count
    Histogram {
        buckets: Vec<(f64, u64)>,
        sum: f64,
        count: u64,
    },
}
