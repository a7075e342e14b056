//! Runtime configuration for every pipeline stage.
//!
//! All tunables live here as explicit structs with sensible defaults, so the
//! resilience machinery itself never hard-codes thresholds or weights.

use std::collections::HashMap;
use std::time::Duration;

/// Circuit breaker behavior, shared by every coordination backend.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// How long an open circuit rejects dispatch before admitting a probe.
    pub open_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_window: Duration::from_secs(60),
        }
    }
}

/// Bounded scrape queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum queued jobs across all sources.
    pub capacity: usize,

    /// How long `enqueue` blocks under backpressure before `QueueFull`.
    pub enqueue_timeout: Duration,

    /// How long `dequeue` blocks on an empty queue before yielding `None`.
    pub dequeue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            enqueue_timeout: Duration::from_secs(5),
            dequeue_timeout: Duration::from_secs(2),
        }
    }
}

/// Scrape coordinator behavior.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Number of concurrent scrape workers; bounds platform-request concurrency.
    pub worker_count: usize,

    /// Attempts per job before the failure is reported to the submitter.
    pub retry_max_attempts: u32,

    /// Base delay for exponential retry backoff (doubles per attempt).
    pub retry_base_delay: Duration,

    /// Per-source request rate limits (requests per second). Sources absent
    /// from the map are not rate-limited.
    pub source_rps: HashMap<String, f64>,

    /// How long the submitter waits for all job outcomes before giving up on
    /// stragglers.
    pub collect_timeout: Duration,

    /// Default priority for sources without an explicit override
    /// (lower dispatches first).
    pub default_priority: u32,

    /// Per-source priority overrides.
    pub source_priorities: HashMap<String, u32>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            source_rps: HashMap::new(),
            collect_timeout: Duration::from_secs(120),
            default_priority: 100,
            source_priorities: HashMap::new(),
        }
    }
}

/// Heat score weighting. Weights are normalized at scoring time, so they only
/// need to be meaningful relative to each other.
#[derive(Debug, Clone)]
pub struct HeatConfig {
    pub weight_platform_percentile: f64,
    pub weight_velocity: f64,
    pub weight_freshness: f64,
    pub weight_cross_platform: f64,

    /// Half-life of the freshness decay, in hours.
    pub freshness_half_life_hours: f64,

    /// Items older than this score zero freshness.
    pub freshness_max_age_hours: f64,

    /// Multiplicative per-platform boost (platform name, lowercase).
    pub platform_weights: HashMap<String, f64>,
}

impl Default for HeatConfig {
    fn default() -> Self {
        Self {
            weight_platform_percentile: 0.45,
            weight_velocity: 0.25,
            weight_freshness: 0.20,
            weight_cross_platform: 0.10,
            freshness_half_life_hours: 12.0,
            freshness_max_age_hours: 72.0,
            platform_weights: HashMap::new(),
        }
    }
}

/// Parse router behavior.
#[derive(Debug, Clone)]
pub struct ParseConfig {
    /// Contract schema version produced and accepted by the router.
    pub schema_version: String,

    /// Confidence below this routes away from `completed`.
    pub low_confidence_threshold: f64,

    /// Immediate in-run retries granted to low-confidence results.
    pub low_confidence_retry_attempts: u32,

    /// Total attempts after which a low-confidence source goes to manual
    /// review instead of another delayed retry.
    pub manual_review_after_attempts: u32,

    /// Attempts per router invocation (in-run retries for recoverable errors).
    pub max_attempts_per_run: u32,

    /// Total attempts after which recoverable errors stop retrying and
    /// dead-letter instead.
    pub recoverable_max_attempts: u32,

    /// Base delay for the delayed-retry exponential backoff.
    pub retry_base_delay: Duration,

    /// Cap for the delayed-retry backoff.
    pub retry_max_delay: Duration,

    /// Whether the (content_hash, schema_version) result cache is consulted.
    pub cache_enabled: bool,

    /// Maximum entries held by the parse result cache.
    pub cache_capacity: u64,

    /// Batch size for `parse_pending`.
    pub batch_size: usize,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            schema_version: "v1".to_string(),
            low_confidence_threshold: 0.55,
            low_confidence_retry_attempts: 1,
            manual_review_after_attempts: 4,
            max_attempts_per_run: 2,
            recoverable_max_attempts: 5,
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(1800),
            cache_enabled: true,
            cache_capacity: 10_000,
            batch_size: 50,
        }
    }
}

/// Length and style constraints for one target platform.
#[derive(Debug, Clone)]
pub struct PlatformConstraint {
    pub title_min: usize,
    pub title_max: usize,
    pub body_min: usize,
    pub body_max: usize,
    pub max_hashtags: usize,
    /// Free-form style rules injected into the prompt.
    pub style_rules: Vec<String>,
}

impl Default for PlatformConstraint {
    fn default() -> Self {
        Self {
            title_min: 4,
            title_max: 80,
            body_min: 80,
            body_max: 2000,
            max_hashtags: 6,
            style_rules: Vec::new(),
        }
    }
}

/// Generation stage behavior.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Per-platform prompt constraints; platforms absent from the map use
    /// `default_constraint`.
    pub constraints: HashMap<String, PlatformConstraint>,
    pub default_constraint: PlatformConstraint,

    /// Words that must never appear in generated output.
    pub banned_words: Vec<String>,

    /// Corrective re-generation attempts after the first draft
    /// (0 disables self-repair).
    pub self_repair_max_attempts: u32,

    /// Wall-clock budget for the whole stage, including repairs.
    pub stage_budget: Duration,

    /// Per-call generation token cap.
    pub max_tokens: u32,

    pub min_quality_score: f64,
    pub min_compliance_score: f64,
    pub max_repeat_ratio: f64,

    /// How many recent accepted bodies to compare against for repetition.
    pub recent_output_window: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            constraints: HashMap::new(),
            default_constraint: PlatformConstraint::default(),
            banned_words: Vec::new(),
            self_repair_max_attempts: 2,
            stage_budget: Duration::from_secs(90),
            max_tokens: 2048,
            min_quality_score: 0.60,
            min_compliance_score: 0.80,
            max_repeat_ratio: 0.85,
            recent_output_window: 20,
        }
    }
}

impl GenerationConfig {
    pub fn constraint_for(&self, platform: &str) -> &PlatformConstraint {
        self.constraints
            .get(platform)
            .unwrap_or(&self.default_constraint)
    }
}

/// Publish gate thresholds.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub min_quality_score: f64,
    pub min_compliance_score: f64,
    pub max_repetition_ratio: f64,

    /// Simhash hamming distance at or below which two drafts for the same
    /// platform are near-duplicates.
    pub near_duplicate_hamming: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_quality_score: 0.60,
            min_compliance_score: 0.80,
            max_repetition_ratio: 0.85,
            near_duplicate_hamming: 5,
        }
    }
}

/// Publishing behavior (best-effort with bounded retries; no exactly-once).
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub retry_max_attempts: u32,
    pub retry_delay: Duration,

    /// Cap on drafts sent to video generation per run.
    pub video_max_drafts: usize,
    pub video_poll_interval: Duration,
    pub video_max_wait: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            video_max_drafts: 5,
            video_poll_interval: Duration::from_secs(10),
            video_max_wait: Duration::from_secs(600),
        }
    }
}

/// Aggregated settings for wiring a full pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub scrape: ScrapeConfig,
    pub heat: HeatConfig,
    pub parse: ParseConfig,
    pub generation: GenerationConfig,
    pub gate: GateConfig,
    pub publish: PublishConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let settings = PipelineSettings::default();
        assert!(settings.breaker.failure_threshold > 0);
        assert!(settings.queue.capacity > 0);
        assert!(settings.parse.low_confidence_threshold < 1.0);
        assert!(settings.generation.min_quality_score <= settings.gate.min_quality_score);
    }

    #[test]
    fn constraint_lookup_falls_back_to_default() {
        let mut config = GenerationConfig::default();
        config.constraints.insert(
            "wechat".to_string(),
            PlatformConstraint {
                body_max: 5000,
                ..PlatformConstraint::default()
            },
        );

        assert_eq!(config.constraint_for("wechat").body_max, 5000);
        assert_eq!(
            config.constraint_for("unknown").body_max,
            config.default_constraint.body_max
        );
    }
}
