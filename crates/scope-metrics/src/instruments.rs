//! Fixed metric families for the serving pipeline
//!
//! Every family the aggregator and trackers write is defined here with its
//! exposition name, label set, and bucket layout. Grouping the handles per
//! subsystem keeps registration in one place and makes the exported contract
//! auditable at a glance.

use crate::registry::{MetricDefinition, MetricHandle, MetricRegistry};
use crate::Result;
use scope_core::labels::names;

/// Bucket bounds for micro-batch token counts, powers of two up to 16k
pub const UBATCH_TOKEN_BUCKETS: &[f64] = &[
    1.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0,
];

/// Bucket bounds for expert rearrangement duration in seconds
pub const REARRANGEMENT_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Expert-parallel load balancer metrics
#[derive(Debug, Clone)]
pub struct EplbMetrics {
    /// Mean tokens routed per rank, per MoE layer
    pub avg_tokens_per_rank: MetricHandle,

    /// Peak tokens routed to any rank, per MoE layer
    pub max_tokens_per_rank: MetricHandle,

    /// avg/max ratio, 1.0 is perfectly balanced
    pub balancedness: MetricHandle,

    /// Whether a rearrangement is currently in progress
    pub rebalancing: MetricHandle,

    /// Completed expert rearrangements
    pub rearrangements: MetricHandle,

    /// Wall time of completed rearrangements
    pub rearrangement_duration: MetricHandle,

    /// Per-expert token load, debug only and guarded by a time window
    pub per_expert_load: MetricHandle,
}

impl EplbMetrics {
    /// Register all EPLB families. Idempotent per registry.
    pub fn register(registry: &MetricRegistry) -> Result<Self> {
        Ok(Self {
            avg_tokens_per_rank: registry.register(MetricDefinition::gauge(
                "eplb_avg_tokens_per_rank",
                "Mean number of tokens routed per expert-parallel rank for a MoE layer",
                &[names::MODEL, names::ENGINE, names::LAYER],
            ))?,
            max_tokens_per_rank: registry.register(MetricDefinition::gauge(
                "eplb_max_tokens_per_rank",
                "Maximum number of tokens routed to any expert-parallel rank for a MoE layer",
                &[names::MODEL, names::ENGINE, names::LAYER],
            ))?,
            balancedness: registry.register(MetricDefinition::gauge(
                "eplb_balancedness_ratio",
                "Ratio of mean to maximum per-rank token load, 1.0 means perfectly balanced",
                &[names::MODEL, names::ENGINE, names::LAYER],
            ))?,
            rebalancing: registry.register(MetricDefinition::gauge(
                "eplb_rebalancing",
                "Whether an expert rearrangement is in progress (1) or not (0)",
                &[names::MODEL, names::ENGINE],
            ))?,
            rearrangements: registry.register(MetricDefinition::counter(
                "eplb_rearrangements_total",
                "Total number of completed expert rearrangements",
                &[names::MODEL, names::ENGINE],
            ))?,
            rearrangement_duration: registry.register(MetricDefinition::histogram(
                "eplb_rearrangement_duration_seconds",
                "Wall-clock duration of completed expert rearrangements in seconds",
                &[names::MODEL, names::ENGINE],
                REARRANGEMENT_DURATION_BUCKETS,
            ))?,
            per_expert_load: registry.register(MetricDefinition::gauge(
                "expert_load_per_expert_tokens_DEBUG",
                "Per-expert token load for one MoE layer, high cardinality debug metric",
                &[names::MODEL, names::ENGINE, names::LAYER, names::EXPERT_ID],
            ))?,
        })
    }
}

/// Dual-batch overlap metrics
#[derive(Debug, Clone)]
pub struct DboMetrics {
    /// Whether dual-batch overlap is engaged, per execution phase
    pub active: MetricHandle,

    /// Steps where overlap was attempted but abandoned, by reason
    pub fallout: MetricHandle,

    /// Token counts of the two overlapped micro-batches
    pub ubatch_tokens: MetricHandle,
}

impl DboMetrics {
    /// Register all DBO families. Idempotent per registry.
    pub fn register(registry: &MetricRegistry) -> Result<Self> {
        Ok(Self {
            active: registry.register(MetricDefinition::gauge(
                "dbo_active",
                "Whether dual-batch overlap is engaged (1) or not (0) for a phase",
                &[names::MODEL, names::ENGINE, names::PHASE],
            ))?,
            fallout: registry.register(MetricDefinition::counter(
                "dbo_fallout_total",
                "Steps where dual-batch overlap was attempted but abandoned, by reason",
                &[names::MODEL, names::ENGINE, names::REASON],
            ))?,
            ubatch_tokens: registry.register(MetricDefinition::histogram(
                "ubatch_token_count",
                "Number of tokens in each overlapped micro-batch",
                &[names::MODEL, names::ENGINE, names::UBATCH_INDEX],
                UBATCH_TOKEN_BUCKETS,
            ))?,
        })
    }
}

/// Scheduler step metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Requests waiting to be scheduled
    pub queue_depth: MetricHandle,

    /// Cumulative prompt tokens processed
    pub prompt_tokens: MetricHandle,

    /// Cumulative generation tokens produced
    pub generation_tokens: MetricHandle,
}

impl SchedulerMetrics {
    /// Register all scheduler families. Idempotent per registry.
    pub fn register(registry: &MetricRegistry) -> Result<Self> {
        Ok(Self {
            queue_depth: registry.register(MetricDefinition::gauge(
                "scheduler_queue_depth",
                "Number of requests waiting to be scheduled",
                &[names::MODEL, names::ENGINE],
            ))?,
            prompt_tokens: registry.register(MetricDefinition::counter(
                "prompt_tokens_total",
                "Total prompt tokens processed",
                &[names::MODEL, names::ENGINE],
            ))?,
            generation_tokens: registry.register(MetricDefinition::counter(
                "generation_tokens_total",
                "Total generation tokens produced",
                &[names::MODEL, names::ENGINE],
            ))?,
        })
    }
}

/// Windowed throughput gauges
#[derive(Debug, Clone)]
pub struct ThroughputMetrics {
    /// Prompt tokens per second over the last flush interval
    pub prompt_rate: MetricHandle,

    /// Generation tokens per second over the last flush interval
    pub generation_rate: MetricHandle,
}

impl ThroughputMetrics {
    /// Register both throughput families. Idempotent per registry.
    pub fn register(registry: &MetricRegistry) -> Result<Self> {
        Ok(Self {
            prompt_rate: registry.register(MetricDefinition::gauge(
                "prompt_throughput_toks_per_s",
                "Prompt tokens processed per second over the last reporting interval",
                &[names::MODEL, names::ENGINE],
            ))?,
            generation_rate: registry.register(MetricDefinition::gauge(
                "generation_throughput_toks_per_s",
                "Generation tokens produced per second over the last reporting interval",
                &[names::MODEL, names::ENGINE],
            ))?,
        })
    }
}
