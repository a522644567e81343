//! Runtime configuration surface.
//!
//! The core does not load configuration itself; the host deserializes a
//! [`RuntimeConfig`] (JSON, TOML via serde, hand-built in tests) and passes
//! it in at engine construction. Every field has a production-sane default.

use serde::Deserialize;

use crate::error::ErrorKind;

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub queue: QueueConfig,
    pub retry: RetryDefaults,
    pub span_promotion: SpanPromotionConfig,
    pub limits: LimitsConfig,
    pub request: RequestConfig,
    pub arena: ArenaConfig,
    pub render: RenderConfig,
}

/// Worker-pool sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub continuation_workers: usize,
    pub effector_workers: usize,
    pub compute: ComputePoolConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            continuation_workers: 4,
            effector_workers: 8,
            compute: ComputePoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePoolKind {
    /// Compute jobs run on the continuation pool
    #[default]
    Shared,
    /// Compute jobs get their own workers and queue
    Dedicated,
    /// Compute effects are rejected
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComputePoolConfig {
    pub kind: ComputePoolKind,
    pub workers: usize,
}

impl Default for ComputePoolConfig {
    fn default() -> Self {
        Self {
            kind: ComputePoolKind::Shared,
            workers: 2,
        }
    }
}

/// Bounds for the per-pool job queues
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub continuation: usize,
    pub effector: usize,
    pub compute: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            continuation: 1024,
            effector: 1024,
            compute: 256,
        }
    }
}

/// Retry defaults applied when an effect carries no policy of its own
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryDefaults {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 50,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Thresholds above which job lifecycles become dedicated trace spans
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpanPromotionConfig {
    pub queue_wait_ms: u64,
    pub run_active_ms: u64,
}

impl Default for SpanPromotionConfig {
    fn default() -> Self {
        Self {
            queue_wait_ms: 5,
            run_active_ms: 50,
        }
    }
}

/// Concurrency and shedding limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// In-flight effect cap per target (host, namespace, task)
    pub per_target_concurrency: usize,
    /// In-flight effect cap per request
    pub per_request_inflight: usize,
    /// Error kind produced when a bounded queue sheds work
    pub shed_kind: ShedKind,
    /// Whether an `any` join cancels its in-flight siblings
    pub any_join_cancels: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_target_concurrency: 64,
            per_request_inflight: 16,
            shed_kind: ShedKind::TooManyRequests,
            any_join_cancels: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShedKind {
    #[default]
    TooManyRequests,
    UpstreamUnavailable,
}

impl ShedKind {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ShedKind::TooManyRequests => ErrorKind::TooManyRequests,
            ShedKind::UpstreamUnavailable => ErrorKind::UpstreamUnavailable,
        }
    }
}

/// Per-request defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Total request budget; `None` disables the default deadline
    pub total_deadline_ms: Option<u64>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            total_deadline_ms: Some(30_000),
        }
    }
}

/// Arena byte budgets
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub soft_cap_bytes: usize,
    pub hard_cap_bytes: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            soft_cap_bytes: 4 * 1024 * 1024,
            hard_cap_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Error-renderer knobs
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Expose cancellation as 499 instead of masking it as 500
    pub expose_cancelled: bool,
}
