use serde::Deserialize;

/// Top-level gate configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub limiter: LimiterConfig,
    pub weights: WeightConfig,
    pub retry: RetryConfig,
    pub processor: ProcessorConfig,
    pub feedback: FeedbackConfig,
    pub admission: AdmissionConfig,
    pub providers: Vec<ProviderConfig>,
}

/// Global leaky-bucket settings. Rate and capacity always move together
/// as one limit, so `rate` sets both.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Initial limit: leak rate in units per second and bucket capacity.
    pub rate: u32,
    /// Lower clamp for feedback-driven limit changes.
    pub min_limit: u32,
    /// Upper clamp for feedback-driven limit changes.
    pub max_limit: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: 15,
            min_limit: 10,
            max_limit: 100,
        }
    }
}

/// Per-provider leaky-bucket settings for the payment-gateway limiters.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub rate: u32,
    pub capacity: u32,
}

/// Weighted-poll settings shared by the atomic poll and the sequential
/// fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    pub order: u32,
    pub other: u32,
    /// Preferred retry share of a class's slots, clamped to [0, 1] on read.
    pub retry_ratio: f64,
    /// A retried item becomes eligible again once its re-enqueue time is
    /// older than this delay.
    pub retry_delay_ms: u64,
}

impl WeightConfig {
    pub fn retry_ratio(&self) -> f64 {
        self.retry_ratio.clamp(0.0, 1.0)
    }
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            order: 7,
            other: 3,
            retry_ratio: 0.7,
            retry_delay_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// How many times a retryable failure may re-enter the retry lane.
    pub max_retry_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retry_count: 1 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub interval_ms: u64,
    /// Use the single-transaction weighted poll. When false the processor
    /// falls back to sequential per-class polling, which tolerates a narrow
    /// race window between the size reads and the drains.
    pub atomic_poll: bool,
    pub default_provider: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            atomic_poll: true,
            default_provider: "TOSS".to_string(),
        }
    }
}

/// Feedback-loop controller settings. The score weights and hysteresis
/// thresholds have no derivation beyond operational tuning, so they are all
/// configurable rather than constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub interval_ms: u64,
    pub latency: LatencyThresholds,
    pub pool: PoolThresholds,
    pub score_weights: ScoreWeights,
    pub scale_out: ScaleOutParams,
    pub histogram: HistogramConfig,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            latency: LatencyThresholds::default(),
            pool: PoolThresholds::default(),
            score_weights: ScoreWeights::default(),
            scale_out: ScaleOutParams::default(),
            histogram: HistogramConfig::default(),
        }
    }
}

/// Piecewise-linear scoring thresholds: 100 at/under `good`, 0 at/over `bad`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LatencyThresholds {
    pub p95_good: f64,
    pub p95_bad: f64,
    pub p99_good: f64,
    pub p99_bad: f64,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            p95_good: 500.0,
            p95_bad: 1000.0,
            p99_good: 1000.0,
            p99_bad: 2000.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolThresholds {
    pub good: f64,
    pub bad: f64,
}

impl Default for PoolThresholds {
    fn default() -> Self {
        Self {
            good: 80.0,
            bad: 95.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub p95: f64,
    pub p99: f64,
    pub pool: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            p95: 0.3,
            p99: 0.4,
            pool: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScaleOutParams {
    /// How far above the current limit a new target is set.
    pub target_delta: u32,
    /// Fixed increase per healthy adjustment, bounded by the remaining
    /// distance to the target.
    pub increase_step: u32,
    /// Fraction of the distance to the floor shed per unhealthy adjustment.
    /// The decrease is rounded up so small distances still shrink by at
    /// least one unit.
    pub decrease_ratio: f64,
    pub consecutive_healthy_required: u32,
    pub consecutive_unhealthy_required: u32,
}

impl Default for ScaleOutParams {
    fn default() -> Self {
        Self {
            target_delta: 15,
            increase_step: 2,
            decrease_ratio: 0.5,
            consecutive_healthy_required: 3,
            consecutive_unhealthy_required: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistogramConfig {
    pub slice_duration_ms: u64,
    /// Number of slices merged on a percentile query; also bounds retention.
    pub max_slices: u32,
    /// Ordered latency bucket boundaries in milliseconds.
    pub boundaries: Vec<u64>,
}

impl HistogramConfig {
    /// Slice TTL covering the retention window, with a small margin so a
    /// slice never expires mid-query.
    pub fn slice_ttl_ms(&self) -> u64 {
        self.slice_duration_ms * self.max_slices as u64 + 10_000
    }
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            slice_duration_ms: 10_000,
            max_slices: 6,
            boundaries: vec![5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Paths outside this prefix bypass limiting entirely.
    pub limited_prefix: String,
    /// Sub-path that additionally consults the payment-provider limiter.
    pub payment_prefix: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limited_prefix: "/api/v1/orders".to_string(),
            payment_prefix: "/api/v1/orders/bf".to_string(),
        }
    }
}
