//! Engine-emitted statistics records
//!
//! The serving engine hands these value objects to the observability
//! pipeline at two cadences:
//!
//! - [`SchedulerStepStats`] once per scheduler iteration (with optional
//!   EPLB and DBO sections when those features are enabled)
//! - [`RequestTraceRecord`] once per finished request
//!
//! Records are plain data: producing them never blocks, and consuming them
//! is the aggregator's job.

use crate::types::DboFalloutReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Statistics for one scheduler iteration of a single engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStepStats {
    /// Requests waiting to be scheduled at the end of the step
    pub queue_depth: usize,

    /// Prompt tokens processed during the step
    pub prefill_tokens: u64,

    /// Generated tokens produced during the step
    pub decode_tokens: u64,

    /// Wall-clock time the step finished
    pub timestamp: DateTime<Utc>,

    /// Expert-parallel load-balance section, absent when EPLB is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eplb: Option<EplbSnapshot>,

    /// Dual-batch-overlap section, absent when DBO is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dbo: Option<DboSnapshot>,
}

impl SchedulerStepStats {
    /// Create step stats for the current instant
    pub fn new(queue_depth: usize, prefill_tokens: u64, decode_tokens: u64) -> Self {
        Self {
            queue_depth,
            prefill_tokens,
            decode_tokens,
            timestamp: Utc::now(),
            eplb: None,
            dbo: None,
        }
    }

    /// Attach an EPLB section
    pub fn with_eplb(mut self, eplb: EplbSnapshot) -> Self {
        self.eplb = Some(eplb);
        self
    }

    /// Attach a DBO section
    pub fn with_dbo(mut self, dbo: DboSnapshot) -> Self {
        self.dbo = Some(dbo);
        self
    }
}

/// Expert-parallel load-balance state for one scheduler step.
///
/// `avg_tokens_per_rank` and `max_tokens_per_rank` are layer-major and must
/// have equal length; layer index is the position in the vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EplbSnapshot {
    /// Mean token load across expert-parallel ranks, per MoE layer
    pub avg_tokens_per_rank: Vec<f64>,

    /// Peak token load across expert-parallel ranks, per MoE layer
    pub max_tokens_per_rank: Vec<f64>,

    /// Whether an expert rearrangement is currently in progress
    pub is_rebalancing: bool,

    /// Per-expert token loads, layer-major; populated only while a debug
    /// window is active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_expert_tokens: Option<Vec<Vec<u64>>>,

    /// Duration of a rearrangement that completed during this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rearrangement_duration: Option<Duration>,
}

impl EplbSnapshot {
    /// Create a snapshot from per-layer average and maximum loads
    pub fn new(avg_tokens_per_rank: Vec<f64>, max_tokens_per_rank: Vec<f64>) -> Self {
        Self {
            avg_tokens_per_rank,
            max_tokens_per_rank,
            is_rebalancing: false,
            per_expert_tokens: None,
            rearrangement_duration: None,
        }
    }

    /// Mark a rearrangement as in progress
    pub fn with_rebalancing(mut self, is_rebalancing: bool) -> Self {
        self.is_rebalancing = is_rebalancing;
        self
    }

    /// Attach debug per-expert loads
    pub fn with_per_expert_tokens(mut self, per_expert_tokens: Vec<Vec<u64>>) -> Self {
        self.per_expert_tokens = Some(per_expert_tokens);
        self
    }

    /// Record a rearrangement that finished during this step
    pub fn with_rearrangement_duration(mut self, duration: Duration) -> Self {
        self.rearrangement_duration = Some(duration);
        self
    }

    /// Number of layers both load vectors report on
    pub fn layer_count(&self) -> usize {
        self.avg_tokens_per_rank.len().min(self.max_tokens_per_rank.len())
    }

    /// Whether the two load vectors disagree on layer count
    pub fn is_ragged(&self) -> bool {
        self.avg_tokens_per_rank.len() != self.max_tokens_per_rank.len()
    }

    /// Balancedness ratio (avg / max) for one layer.
    ///
    /// 1.0 is perfectly balanced. An idle layer (max == 0) reports 1.0 so
    /// the ratio is always a finite value in (0.0, 1.0]. Returns `None` for
    /// an out-of-range layer.
    pub fn balancedness(&self, layer: usize) -> Option<f64> {
        if layer >= self.layer_count() {
            return None;
        }
        let avg = self.avg_tokens_per_rank[layer];
        let max = self.max_tokens_per_rank[layer];
        if max == 0.0 {
            Some(1.0)
        } else {
            Some(avg / max)
        }
    }
}

/// Dual-batch-overlap state for one scheduler step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DboSnapshot {
    /// Whether the prefill phase ran with overlapped micro-batches
    pub prefill_active: bool,

    /// Whether the decode phase ran with overlapped micro-batches
    pub decode_active: bool,

    /// Token count of the first micro-batch
    pub first_ubatch_tokens: u64,

    /// Token count of the second micro-batch
    pub second_ubatch_tokens: u64,

    /// Set when the step fell back to single-batch execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallout_reason: Option<DboFalloutReason>,
}

impl DboSnapshot {
    /// Create a DBO snapshot for one step
    pub fn new(
        prefill_active: bool,
        decode_active: bool,
        first_ubatch_tokens: u64,
        second_ubatch_tokens: u64,
    ) -> Self {
        Self {
            prefill_active,
            decode_active,
            first_ubatch_tokens,
            second_ubatch_tokens,
            fallout_reason: None,
        }
    }

    /// Record a fallout to single-batch execution
    pub fn with_fallout(mut self, reason: DboFalloutReason) -> Self {
        self.fallout_reason = Some(reason);
        self
    }

    /// Whether either phase actually ran overlapped this step
    pub fn engaged(&self) -> bool {
        self.prefill_active || self.decode_active
    }
}

/// Sampling parameters recorded on request spans.
///
/// Only scalar knobs; prompt and completion text never enter the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature
    pub temperature: Option<f64>,

    /// Nucleus sampling threshold
    pub top_p: Option<f64>,

    /// Maximum number of tokens to generate
    pub max_tokens: Option<u64>,

    /// Number of requested completions
    pub n: Option<u64>,
}

/// Lifecycle record for one finished request.
///
/// Timestamps are absolute; latency figures are derived on demand so the
/// record stays a faithful capture of what the engine observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTraceRecord {
    /// Engine-assigned request identifier
    pub request_id: String,

    /// When the request arrived at the engine
    pub arrival: DateTime<Utc>,

    /// When the scheduler first placed the request in a batch
    pub first_schedule: DateTime<Utc>,

    /// When the first output token was produced
    pub first_token: DateTime<Utc>,

    /// When the last output token was produced
    pub completion: DateTime<Utc>,

    /// Prompt length in tokens
    pub prompt_tokens: u64,

    /// Generated length in tokens
    pub completion_tokens: u64,

    /// Sampling parameters of the request
    pub sampling: SamplingParams,
}

impl RequestTraceRecord {
    /// Create a record from the four lifecycle timestamps
    pub fn new(
        request_id: impl Into<String>,
        arrival: DateTime<Utc>,
        first_schedule: DateTime<Utc>,
        first_token: DateTime<Utc>,
        completion: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            arrival,
            first_schedule,
            first_token,
            completion,
            prompt_tokens: 0,
            completion_tokens: 0,
            sampling: SamplingParams::default(),
        }
    }

    /// Generate a random request identifier
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Set prompt and completion token counts
    pub fn with_tokens(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self
    }

    /// Set sampling parameters
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Seconds spent waiting before first being scheduled
    pub fn time_in_queue(&self) -> f64 {
        seconds_between(self.arrival, self.first_schedule)
    }

    /// Seconds from arrival to the first output token
    pub fn time_to_first_token(&self) -> f64 {
        seconds_between(self.arrival, self.first_token)
    }

    /// Seconds from first scheduling to the first output token
    pub fn prefill_time(&self) -> f64 {
        seconds_between(self.first_schedule, self.first_token)
    }

    /// Seconds from the first output token to completion
    pub fn decode_time(&self) -> f64 {
        seconds_between(self.first_token, self.completion)
    }

    /// Seconds from arrival to completion
    pub fn e2e_time(&self) -> f64 {
        seconds_between(self.arrival, self.completion)
    }

    /// Total model-execution seconds (prefill + decode)
    pub fn inference_time(&self) -> f64 {
        self.prefill_time() + self.decode_time()
    }
}

/// Signed elapsed seconds between two timestamps
fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end - start;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch_plus_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    #[test]
    fn test_step_stats_builders() {
        let stats = SchedulerStepStats::new(4, 512, 64)
            .with_eplb(EplbSnapshot::new(vec![900.0], vec![1200.0]))
            .with_dbo(DboSnapshot::new(true, false, 256, 256));

        assert_eq!(stats.queue_depth, 4);
        assert_eq!(stats.prefill_tokens, 512);
        assert!(stats.eplb.is_some());
        assert!(stats.dbo.is_some());
    }

    #[test]
    fn test_balancedness_ratio() {
        let eplb = EplbSnapshot::new(vec![900.0, 500.0], vec![1200.0, 500.0]);

        assert!((eplb.balancedness(0).unwrap() - 0.75).abs() < 1e-9);
        assert!((eplb.balancedness(1).unwrap() - 1.0).abs() < 1e-9);
        assert!(eplb.balancedness(2).is_none());
    }

    #[test]
    fn test_balancedness_idle_layer() {
        let eplb = EplbSnapshot::new(vec![0.0], vec![0.0]);

        // An idle layer is defined as perfectly balanced, never NaN.
        let ratio = eplb.balancedness(0).unwrap();
        assert!((ratio - 1.0).abs() < 1e-9);
        assert!(ratio.is_finite());
    }

    #[test]
    fn test_balancedness_always_finite() {
        let cases = [
            (vec![900.0], vec![1200.0]),
            (vec![0.0], vec![0.0]),
            (vec![1.0], vec![1.0]),
            (vec![0.5], vec![1_000_000.0]),
        ];
        for (avg, max) in cases {
            let eplb = EplbSnapshot::new(avg, max);
            let ratio = eplb.balancedness(0).unwrap();
            assert!(ratio.is_finite());
            assert!(ratio > 0.0 && ratio <= 1.0);
        }
    }

    #[test]
    fn test_ragged_snapshot() {
        let eplb = EplbSnapshot::new(vec![1.0, 2.0], vec![3.0]);
        assert!(eplb.is_ragged());
        assert_eq!(eplb.layer_count(), 1);
    }

    #[test]
    fn test_dbo_engaged() {
        assert!(DboSnapshot::new(true, false, 10, 10).engaged());
        assert!(DboSnapshot::new(false, true, 10, 10).engaged());
        assert!(!DboSnapshot::new(false, false, 0, 0).engaged());
    }

    #[test]
    fn test_request_latency_derivations() {
        let record = RequestTraceRecord::new(
            "req-1",
            epoch_plus_ms(0),
            epoch_plus_ms(12),
            epoch_plus_ms(45),
            epoch_plus_ms(2150),
        );

        assert!((record.time_in_queue() - 0.012).abs() < 1e-9);
        assert!((record.time_to_first_token() - 0.045).abs() < 1e-9);
        assert!((record.prefill_time() - 0.033).abs() < 1e-9);
        assert!((record.decode_time() - 2.105).abs() < 1e-9);
        assert!((record.e2e_time() - 2.150).abs() < 1e-9);
        assert!((record.inference_time() - 2.138).abs() < 1e-9);
    }

    #[test]
    fn test_request_record_builders() {
        let record = RequestTraceRecord::new(
            RequestTraceRecord::generate_id(),
            epoch_plus_ms(0),
            epoch_plus_ms(1),
            epoch_plus_ms(2),
            epoch_plus_ms(3),
        )
        .with_tokens(128, 32)
        .with_sampling(SamplingParams {
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(256),
            n: Some(1),
        });

        assert_eq!(record.prompt_tokens, 128);
        assert_eq!(record.completion_tokens, 32);
        assert_eq!(record.sampling.temperature, Some(0.7));
    }

    #[test]
    fn test_step_stats_serialization() {
        let stats = SchedulerStepStats::new(2, 100, 10)
            .with_eplb(EplbSnapshot::new(vec![1.0], vec![2.0]).with_rebalancing(true));

        let json = serde_json::to_string(&stats).unwrap();
        let parsed: SchedulerStepStats = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, stats);
        // Disabled sections stay out of the serialized form entirely.
        assert!(!json.contains("dbo"));
    }
}
