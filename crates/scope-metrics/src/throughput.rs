//! Windowed token throughput
//!
//! Engines report raw token counts per step; the tracker accumulates them in
//! lock-free counters and a periodic flush converts each window's delta into
//! a tokens-per-second gauge. Idle engines publish an explicit 0.0 so the
//! rate series never goes stale between scrapes.

use crate::instruments::ThroughputMetrics;
use crate::registry::{MetricOp, MetricRegistry};
use crate::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use scope_core::EngineLabels;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Default)]
struct TokenCounters {
    prompt: AtomicU64,
    generation: AtomicU64,
}

/// Accumulates per-engine token counts and publishes windowed rates
#[derive(Debug)]
pub struct ThroughputTracker {
    registry: MetricRegistry,
    metrics: ThroughputMetrics,
    engines: DashMap<EngineLabels, TokenCounters>,
    interval: Duration,
    last_flush: Mutex<Instant>,
}

impl ThroughputTracker {
    /// Create a tracker flushing every `interval`
    pub fn new(registry: MetricRegistry, interval: Duration) -> Result<Self> {
        let metrics = ThroughputMetrics::register(&registry)?;
        Ok(Self {
            registry,
            metrics,
            engines: DashMap::new(),
            interval,
            last_flush: Mutex::new(Instant::now()),
        })
    }

    /// Flush cadence
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Add one step's token counts for an engine. First sight of an engine
    /// enrolls it in every subsequent flush.
    pub fn observe(&self, labels: &EngineLabels, prompt_tokens: u64, generation_tokens: u64) {
        let entry = self
            .engines
            .entry(labels.clone())
            .or_default();
        entry.prompt.fetch_add(prompt_tokens, Ordering::Relaxed);
        entry
            .generation
            .fetch_add(generation_tokens, Ordering::Relaxed);
    }

    /// Convert the counts accumulated since the last flush into rates
    pub fn flush(&self) -> Result<()> {
        self.flush_at(Instant::now())
    }

    /// Flush against an explicit clock reading
    pub fn flush_at(&self, now: Instant) -> Result<()> {
        let elapsed = {
            let mut last = self.last_flush.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        for entry in self.engines.iter() {
            let prompt = entry.value().prompt.swap(0, Ordering::Relaxed);
            let generation = entry.value().generation.swap(0, Ordering::Relaxed);
            let (prompt_rate, generation_rate) = if elapsed > 0.0 {
                (prompt as f64 / elapsed, generation as f64 / elapsed)
            } else {
                (0.0, 0.0)
            };

            let [model, engine] = entry.key().values();
            self.registry.record(
                &self.metrics.prompt_rate,
                &[model, engine],
                MetricOp::Set(prompt_rate),
            )?;
            self.registry.record(
                &self.metrics.generation_rate,
                &[model, engine],
                MetricOp::Set(generation_rate),
            )?;
            debug!(
                engine = %entry.key(),
                prompt_rate,
                generation_rate,
                "Flushed throughput window"
            );
        }
        Ok(())
    }

    /// Run the periodic flush loop until the task is aborted
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush() {
                error!("Failed to flush throughput window: {}", e);
            }
        }
    }
}
