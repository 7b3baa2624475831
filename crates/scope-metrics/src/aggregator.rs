//! Per-engine stats aggregation
//!
//! One aggregator serves one engine. Each scheduler step the engine hands it
//! a [`SchedulerStepStats`] record and the aggregator fans the contents out
//! to the registered metric families: scheduler gauges and token counters
//! always, EPLB and DBO families only when those sections were enabled at
//! construction. Records carrying a section the aggregator was not built for
//! are ignored rather than failed, so flipping a feature off in config never
//! breaks a running engine.

use crate::guard::CardinalityGuard;
use crate::instruments::{DboMetrics, EplbMetrics, SchedulerMetrics};
use crate::registry::{MetricOp, MetricRegistry};
use crate::throughput::ThroughputTracker;
use crate::Result;
use scope_core::{DboSnapshot, EngineLabels, EplbSnapshot, Phase, SchedulerStepStats};
use std::sync::Arc;
use tracing::debug;

/// Translates one engine's step stats into metric writes
#[derive(Debug)]
pub struct StatsAggregator {
    registry: MetricRegistry,
    labels: EngineLabels,
    scheduler: SchedulerMetrics,
    eplb: Option<EplbMetrics>,
    dbo: Option<DboMetrics>,
    guard: Option<Arc<CardinalityGuard>>,
    tracker: Arc<ThroughputTracker>,
}

impl StatsAggregator {
    /// Create an aggregator publishing scheduler metrics only.
    ///
    /// Family registration is idempotent, so aggregators for different
    /// engines share the same families and differ only in label values.
    pub fn new(
        registry: MetricRegistry,
        labels: EngineLabels,
        tracker: Arc<ThroughputTracker>,
    ) -> Result<Self> {
        let scheduler = SchedulerMetrics::register(&registry)?;
        Ok(Self {
            registry,
            labels,
            scheduler,
            eplb: None,
            dbo: None,
            guard: None,
            tracker,
        })
    }

    /// Enable the EPLB families. The guard arbitrates per-expert export.
    pub fn with_eplb(mut self, guard: Arc<CardinalityGuard>) -> Result<Self> {
        self.eplb = Some(EplbMetrics::register(&self.registry)?);
        self.guard = Some(guard);
        Ok(self)
    }

    /// Enable the DBO families
    pub fn with_dbo(mut self) -> Result<Self> {
        self.dbo = Some(DboMetrics::register(&self.registry)?);
        Ok(self)
    }

    /// Labels this aggregator writes under
    pub fn labels(&self) -> &EngineLabels {
        &self.labels
    }

    /// Publish one scheduler step.
    ///
    /// Failures indicate a wiring bug (arity or kind mismatch), never a
    /// problem with the step data itself.
    pub fn record_step(&self, stats: &SchedulerStepStats) -> Result<()> {
        if let Some(guard) = &self.guard {
            guard.sweep();
        }

        let [model, engine] = self.labels.values();
        self.registry.record(
            &self.scheduler.queue_depth,
            &[model, engine],
            MetricOp::Set(stats.queue_depth as f64),
        )?;
        self.registry.record(
            &self.scheduler.prompt_tokens,
            &[model, engine],
            MetricOp::Increment(stats.prefill_tokens as f64),
        )?;
        self.registry.record(
            &self.scheduler.generation_tokens,
            &[model, engine],
            MetricOp::Increment(stats.decode_tokens as f64),
        )?;
        self.tracker
            .observe(&self.labels, stats.prefill_tokens, stats.decode_tokens);

        if let (Some(metrics), Some(snapshot)) = (&self.eplb, &stats.eplb) {
            self.record_eplb(metrics, snapshot)?;
        }
        if let (Some(metrics), Some(snapshot)) = (&self.dbo, &stats.dbo) {
            self.record_dbo(metrics, snapshot)?;
        }
        Ok(())
    }

    fn record_eplb(&self, metrics: &EplbMetrics, snapshot: &EplbSnapshot) -> Result<()> {
        let [model, engine] = self.labels.values();

        if snapshot.is_ragged() {
            debug!(
                engine = %self.labels,
                avg_layers = snapshot.avg_tokens_per_rank.len(),
                max_layers = snapshot.max_tokens_per_rank.len(),
                "EPLB load vectors disagree on layer count, using the shorter"
            );
        }

        for layer in 0..snapshot.layer_count() {
            let layer_label = layer.to_string();
            let labels = [model, engine, layer_label.as_str()];
            self.registry.record(
                &metrics.avg_tokens_per_rank,
                &labels,
                MetricOp::Set(snapshot.avg_tokens_per_rank[layer]),
            )?;
            self.registry.record(
                &metrics.max_tokens_per_rank,
                &labels,
                MetricOp::Set(snapshot.max_tokens_per_rank[layer]),
            )?;
            if let Some(ratio) = snapshot.balancedness(layer) {
                self.registry
                    .record(&metrics.balancedness, &labels, MetricOp::Set(ratio))?;
            }
        }

        self.registry.record(
            &metrics.rebalancing,
            &[model, engine],
            MetricOp::Set(if snapshot.is_rebalancing { 1.0 } else { 0.0 }),
        )?;

        if let Some(duration) = snapshot.rearrangement_duration {
            self.registry.record(
                &metrics.rearrangements,
                &[model, engine],
                MetricOp::Increment(1.0),
            )?;
            self.registry.record(
                &metrics.rearrangement_duration,
                &[model, engine],
                MetricOp::Observe(duration.as_secs_f64()),
            )?;
        }

        if let (Some(per_expert), Some(guard)) = (&snapshot.per_expert_tokens, &self.guard) {
            // The guard holds its window lock across the writes, so an expiry
            // sweep on another thread cannot strand a half-published step.
            guard.publish_if_active(|| {
                for (layer, experts) in per_expert.iter().enumerate() {
                    let layer_label = layer.to_string();
                    for (expert, tokens) in experts.iter().enumerate() {
                        let expert_label = expert.to_string();
                        self.registry.record(
                            &metrics.per_expert_load,
                            &[model, engine, layer_label.as_str(), expert_label.as_str()],
                            MetricOp::Set(*tokens as f64),
                        )?;
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn record_dbo(&self, metrics: &DboMetrics, snapshot: &DboSnapshot) -> Result<()> {
        let [model, engine] = self.labels.values();

        for (phase, active) in [
            (Phase::Prefill, snapshot.prefill_active),
            (Phase::Decode, snapshot.decode_active),
        ] {
            self.registry.record(
                &metrics.active,
                &[model, engine, phase.as_label()],
                MetricOp::Set(if active { 1.0 } else { 0.0 }),
            )?;
        }

        if let Some(reason) = snapshot.fallout_reason {
            self.registry.record(
                &metrics.fallout,
                &[model, engine, reason.as_label()],
                MetricOp::Increment(1.0),
            )?;
        }

        if snapshot.engaged() {
            self.registry.record(
                &metrics.ubatch_tokens,
                &[model, engine, "0"],
                MetricOp::Observe(snapshot.first_ubatch_tokens as f64),
            )?;
            self.registry.record(
                &metrics.ubatch_tokens,
                &[model, engine, "1"],
                MetricOp::Observe(snapshot.second_ubatch_tokens as f64),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scope_core::{DboFalloutReason, EngineId};
    use std::time::Duration;

    struct Fixture {
        registry: MetricRegistry,
        guard: Arc<CardinalityGuard>,
        aggregator: StatsAggregator,
    }

    fn fixture() -> Fixture {
        let registry = MetricRegistry::new();
        let tracker =
            Arc::new(ThroughputTracker::new(registry.clone(), Duration::from_secs(10)).unwrap());
        let eplb = EplbMetrics::register(&registry).unwrap();
        let guard = Arc::new(CardinalityGuard::new(
            registry.clone(),
            eplb.per_expert_load.clone(),
            Duration::from_secs(300),
        ));
        let aggregator = StatsAggregator::new(
            registry.clone(),
            EngineLabels::new("test-model", EngineId::from_index(0)),
            tracker,
        )
        .unwrap()
        .with_eplb(guard.clone())
        .unwrap()
        .with_dbo()
        .unwrap();
        Fixture {
            registry,
            guard,
            aggregator,
        }
    }

    fn base_labels() -> [(&'static str, &'static str); 2] {
        [("model", "test-model"), ("engine", "0")]
    }

    fn layer_labels(layer: &str) -> [(&'static str, &str); 3] {
        [("model", "test-model"), ("engine", "0"), ("layer", layer)]
    }

    #[test]
    fn test_scheduler_gauges_and_counters() {
        let f = fixture();
        f.aggregator
            .record_step(&SchedulerStepStats::new(4, 512, 64))
            .unwrap();
        f.aggregator
            .record_step(&SchedulerStepStats::new(2, 128, 32))
            .unwrap();

        let snapshot = f.registry.snapshot();
        assert_eq!(
            snapshot.gauge_value("scheduler_queue_depth", &base_labels()),
            Some(2.0)
        );
        assert_eq!(
            snapshot.counter_value("prompt_tokens_total", &base_labels()),
            Some(640.0)
        );
        assert_eq!(
            snapshot.counter_value("generation_tokens_total", &base_labels()),
            Some(96.0)
        );
    }

    #[test]
    fn test_eplb_balancedness_per_layer() {
        let f = fixture();
        let stats = SchedulerStepStats::new(0, 0, 0).with_eplb(EplbSnapshot::new(
            vec![100.0, 100.0, 100.0, 900.0],
            vec![100.0, 200.0, 100.0, 1200.0],
        ));
        f.aggregator.record_step(&stats).unwrap();

        let snapshot = f.registry.snapshot();
        let ratio = snapshot
            .gauge_value("eplb_balancedness_ratio", &layer_labels("3"))
            .unwrap();
        assert!((ratio - 0.75).abs() < 1e-9);
        assert_eq!(
            snapshot.gauge_value("eplb_avg_tokens_per_rank", &layer_labels("3")),
            Some(900.0)
        );
        assert_eq!(
            snapshot.gauge_value("eplb_max_tokens_per_rank", &layer_labels("3")),
            Some(1200.0)
        );
        assert_eq!(
            snapshot.gauge_value("eplb_balancedness_ratio", &layer_labels("1")),
            Some(0.5)
        );
        assert_eq!(
            snapshot.gauge_value("eplb_balancedness_ratio", &layer_labels("0")),
            Some(1.0)
        );
    }

    #[test]
    fn test_eplb_idle_layer_reports_balanced() {
        let f = fixture();
        let stats = SchedulerStepStats::new(0, 0, 0)
            .with_eplb(EplbSnapshot::new(vec![0.0], vec![0.0]));
        f.aggregator.record_step(&stats).unwrap();

        let ratio = f
            .registry
            .snapshot()
            .gauge_value("eplb_balancedness_ratio", &layer_labels("0"))
            .unwrap();
        assert_eq!(ratio, 1.0);
    }

    #[test]
    fn test_eplb_ragged_snapshot_truncates() {
        let f = fixture();
        let stats = SchedulerStepStats::new(0, 0, 0)
            .with_eplb(EplbSnapshot::new(vec![50.0, 60.0], vec![100.0]));
        f.aggregator.record_step(&stats).unwrap();

        let snapshot = f.registry.snapshot();
        assert!(snapshot
            .gauge_value("eplb_balancedness_ratio", &layer_labels("0"))
            .is_some());
        assert!(snapshot
            .gauge_value("eplb_balancedness_ratio", &layer_labels("1"))
            .is_none());
    }

    #[test]
    fn test_rebalancing_gauge_and_rearrangement_counter() {
        let f = fixture();
        f.aggregator
            .record_step(&SchedulerStepStats::new(0, 0, 0).with_eplb(
                EplbSnapshot::new(vec![1.0], vec![1.0]).with_rebalancing(true),
            ))
            .unwrap();
        assert_eq!(
            f.registry
                .snapshot()
                .gauge_value("eplb_rebalancing", &base_labels()),
            Some(1.0)
        );

        f.aggregator
            .record_step(&SchedulerStepStats::new(0, 0, 0).with_eplb(
                EplbSnapshot::new(vec![1.0], vec![1.0])
                    .with_rearrangement_duration(Duration::from_millis(500)),
            ))
            .unwrap();

        let snapshot = f.registry.snapshot();
        assert_eq!(
            snapshot.gauge_value("eplb_rebalancing", &base_labels()),
            Some(0.0)
        );
        assert_eq!(
            snapshot.counter_value("eplb_rearrangements_total", &base_labels()),
            Some(1.0)
        );
        assert_eq!(
            snapshot.histogram_count("eplb_rearrangement_duration_seconds", &base_labels()),
            Some(1)
        );
        let sum = snapshot
            .histogram_sum("eplb_rearrangement_duration_seconds", &base_labels())
            .unwrap();
        assert!((sum - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_dbo_fallout_accumulates() {
        let f = fixture();
        for _ in 0..10 {
            let stats = SchedulerStepStats::new(0, 0, 0).with_dbo(
                DboSnapshot::new(false, false, 0, 0)
                    .with_fallout(DboFalloutReason::EmptySecondUbatch),
            );
            f.aggregator.record_step(&stats).unwrap();
        }

        let snapshot = f.registry.snapshot();
        let fallout = snapshot
            .counter_value(
                "dbo_fallout_total",
                &[
                    ("model", "test-model"),
                    ("engine", "0"),
                    ("reason", "empty_second_ubatch"),
                ],
            )
            .unwrap();
        assert_eq!(fallout, 10.0);

        // Neither phase ever engaged, and no micro-batch sizes were observed.
        for phase in ["prefill", "decode"] {
            let active = snapshot
                .gauge_value(
                    "dbo_active",
                    &[("model", "test-model"), ("engine", "0"), ("phase", phase)],
                )
                .unwrap();
            assert_eq!(active, 0.0);
        }
        assert!(snapshot.metric("ubatch_token_count").unwrap().is_empty());
    }

    #[test]
    fn test_dbo_engaged_observes_both_ubatches() {
        let f = fixture();
        let stats = SchedulerStepStats::new(0, 0, 0)
            .with_dbo(DboSnapshot::new(true, false, 4096, 3900));
        f.aggregator.record_step(&stats).unwrap();

        let snapshot = f.registry.snapshot();
        assert_eq!(
            snapshot.gauge_value(
                "dbo_active",
                &[("model", "test-model"), ("engine", "0"), ("phase", "prefill")],
            ),
            Some(1.0)
        );
        for (index, tokens) in [("0", 4096.0), ("1", 3900.0)] {
            let sum = snapshot
                .histogram_sum(
                    "ubatch_token_count",
                    &[
                        ("model", "test-model"),
                        ("engine", "0"),
                        ("ubatch_index", index),
                    ],
                )
                .unwrap();
            assert!((sum - tokens).abs() < 1e-9);
        }
    }

    #[test]
    fn test_per_expert_export_requires_active_window() {
        let f = fixture();
        let per_expert = vec![vec![10, 20], vec![30, 40]];
        let stats = SchedulerStepStats::new(0, 0, 0).with_eplb(
            EplbSnapshot::new(vec![1.0, 1.0], vec![1.0, 1.0])
                .with_per_expert_tokens(per_expert.clone()),
        );

        // Window closed: the per-expert section is dropped.
        f.aggregator.record_step(&stats).unwrap();
        assert!(f
            .registry
            .snapshot()
            .metric("expert_load_per_expert_tokens_DEBUG")
            .unwrap()
            .is_empty());

        // Window open: every (layer, expert) series is published.
        f.guard.activate(Duration::from_secs(60));
        f.aggregator.record_step(&stats).unwrap();
        let snapshot = f.registry.snapshot();
        let metric = snapshot
            .metric("expert_load_per_expert_tokens_DEBUG")
            .unwrap();
        assert_eq!(metric.instances.len(), 4);
        assert_eq!(
            snapshot.gauge_value(
                "expert_load_per_expert_tokens_DEBUG",
                &[
                    ("model", "test-model"),
                    ("engine", "0"),
                    ("layer", "1"),
                    ("expert_id", "0"),
                ],
            ),
            Some(30.0)
        );
    }

    #[test]
    fn test_per_expert_series_removed_after_window_lapses() {
        let f = fixture();
        let stats = SchedulerStepStats::new(0, 0, 0).with_eplb(
            EplbSnapshot::new(vec![1.0], vec![1.0]).with_per_expert_tokens(vec![vec![5]]),
        );

        f.guard.activate(Duration::from_millis(50));
        f.aggregator.record_step(&stats).unwrap();
        assert!(!f
            .registry
            .snapshot()
            .metric("expert_load_per_expert_tokens_DEBUG")
            .unwrap()
            .is_empty());

        std::thread::sleep(Duration::from_millis(80));

        // The next step sweeps the lapsed window before publishing.
        f.aggregator
            .record_step(&SchedulerStepStats::new(0, 0, 0))
            .unwrap();
        assert!(f
            .registry
            .snapshot()
            .metric("expert_load_per_expert_tokens_DEBUG")
            .unwrap()
            .is_empty());
        assert!(!f.guard.is_active());
    }

    #[test]
    fn test_sections_ignored_when_not_enabled() {
        let registry = MetricRegistry::new();
        let tracker =
            Arc::new(ThroughputTracker::new(registry.clone(), Duration::from_secs(10)).unwrap());
        let aggregator = StatsAggregator::new(
            registry.clone(),
            EngineLabels::new("test-model", EngineId::from_index(0)),
            tracker,
        )
        .unwrap();

        let stats = SchedulerStepStats::new(1, 10, 10)
            .with_eplb(EplbSnapshot::new(vec![1.0], vec![2.0]))
            .with_dbo(DboSnapshot::new(true, true, 8, 8));
        aggregator.record_step(&stats).unwrap();

        let snapshot = registry.snapshot();
        assert!(snapshot.metric("eplb_balancedness_ratio").is_none());
        assert!(snapshot.metric("dbo_active").is_none());
        assert_eq!(
            snapshot.gauge_value("scheduler_queue_depth", &base_labels()),
            Some(1.0)
        );
    }

    #[test]
    fn test_engines_share_families_with_distinct_labels() {
        let registry = MetricRegistry::new();
        let tracker =
            Arc::new(ThroughputTracker::new(registry.clone(), Duration::from_secs(10)).unwrap());
        let aggregators: Vec<_> = (0..2)
            .map(|i| {
                StatsAggregator::new(
                    registry.clone(),
                    EngineLabels::new("test-model", EngineId::from_index(i)),
                    tracker.clone(),
                )
                .unwrap()
            })
            .collect();

        aggregators[0]
            .record_step(&SchedulerStepStats::new(3, 0, 0))
            .unwrap();
        aggregators[1]
            .record_step(&SchedulerStepStats::new(7, 0, 0))
            .unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.gauge_value(
                "scheduler_queue_depth",
                &[("model", "test-model"), ("engine", "0")],
            ),
            Some(3.0)
        );
        assert_eq!(
            snapshot.gauge_value(
                "scheduler_queue_depth",
                &[("model", "test-model"), ("engine", "1")],
            ),
            Some(7.0)
        );
    }
}
