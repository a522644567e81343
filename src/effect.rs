//! # Effect Requests
//!
//! Steps never perform I/O. Instead they return a `Decision::Need` carrying
//! one or more [`Effect`]s: declarative requests the runtime performs on the
//! step's behalf. Every effect names a destination slot (`token`) for its
//! result, a `required` flag governing failure semantics, and optional
//! timeout/retry/idempotency settings.
//!
//! The set of effects is closed: key-value storage, SQL queries, outbound
//! HTTP, compute tasks, and saga compensation. Builders keep construction
//! terse:
//!
//! ```rust
//! use pipeflow_rs::{Effect, RetryPolicy, SlotId};
//!
//! let load = Effect::db_get("todos", "todo:42", SlotId(0))
//!     .with_required(true)
//!     .with_timeout_ms(250);
//!
//! let notify = Effect::http_post("https://hooks.example/send", b"{}".as_ref(), SlotId(1))
//!     .with_idem("hook-42")
//!     .with_retry(RetryPolicy::exponential(2, 20, 1_000, 2.0));
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::effector::sql::SqlValue;
use crate::request::{Headers, Method};
use crate::slot::SlotId;

/// Discriminant for the closed effect set; also the `kind` string in traces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    DbGet,
    DbPut,
    DbDel,
    DbScan,
    DbQuery,
    HttpGet,
    HttpPost,
    HttpCall,
    ComputeTask,
    Compensate,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::DbGet => "db_get",
            EffectKind::DbPut => "db_put",
            EffectKind::DbDel => "db_del",
            EffectKind::DbScan => "db_scan",
            EffectKind::DbQuery => "db_query",
            EffectKind::HttpGet => "http_get",
            EffectKind::HttpPost => "http_post",
            EffectKind::HttpCall => "http_call",
            EffectKind::ComputeTask => "compute_task",
            EffectKind::Compensate => "compensate",
        }
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields common to every effect variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectOpts {
    /// Destination slot; success writes the result here
    pub token: SlotId,
    /// Required effects fail the pipeline per the join rules
    pub required: bool,
    /// Total budget for this effect, all attempts included
    pub timeout_ms: Option<u64>,
    /// Per-effect retry policy; the coordinator falls back to configured defaults
    pub retry: Option<RetryPolicy>,
}

impl EffectOpts {
    fn new(token: SlotId) -> Self {
        Self {
            token,
            required: false,
            timeout_ms: None,
            retry: None,
        }
    }
}

/// A declarative I/O request performed by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "effect")]
pub enum Effect {
    DbGet {
        namespace: String,
        key: String,
        opts: EffectOpts,
    },
    DbPut {
        namespace: String,
        key: String,
        value: Bytes,
        idem: Option<String>,
        opts: EffectOpts,
    },
    DbDel {
        namespace: String,
        key: String,
        idem: Option<String>,
        opts: EffectOpts,
    },
    DbScan {
        namespace: String,
        prefix: String,
        limit: Option<usize>,
        opts: EffectOpts,
    },
    DbQuery {
        sql: String,
        params: Vec<SqlValue>,
        opts: EffectOpts,
    },
    HttpGet {
        url: String,
        headers: Headers,
        opts: EffectOpts,
    },
    HttpPost {
        url: String,
        headers: Headers,
        body: Bytes,
        idem: Option<String>,
        opts: EffectOpts,
    },
    HttpCall {
        method: Method,
        url: String,
        headers: Headers,
        body: Bytes,
        idem: Option<String>,
        opts: EffectOpts,
    },
    ComputeTask {
        task: String,
        input: Value,
        opts: EffectOpts,
    },
    Compensate {
        task: String,
        input: Value,
        opts: EffectOpts,
    },
}

impl Effect {
    pub fn db_get(namespace: impl Into<String>, key: impl Into<String>, token: SlotId) -> Self {
        Effect::DbGet {
            namespace: namespace.into(),
            key: key.into(),
            opts: EffectOpts::new(token),
        }
    }

    pub fn db_put(
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        token: SlotId,
    ) -> Self {
        Effect::DbPut {
            namespace: namespace.into(),
            key: key.into(),
            value: value.into(),
            idem: None,
            opts: EffectOpts::new(token),
        }
    }

    pub fn db_del(namespace: impl Into<String>, key: impl Into<String>, token: SlotId) -> Self {
        Effect::DbDel {
            namespace: namespace.into(),
            key: key.into(),
            idem: None,
            opts: EffectOpts::new(token),
        }
    }

    pub fn db_scan(namespace: impl Into<String>, prefix: impl Into<String>, token: SlotId) -> Self {
        Effect::DbScan {
            namespace: namespace.into(),
            prefix: prefix.into(),
            limit: None,
            opts: EffectOpts::new(token),
        }
    }

    pub fn db_query(sql: impl Into<String>, params: Vec<SqlValue>, token: SlotId) -> Self {
        Effect::DbQuery {
            sql: sql.into(),
            params,
            opts: EffectOpts::new(token),
        }
    }

    pub fn http_get(url: impl Into<String>, token: SlotId) -> Self {
        Effect::HttpGet {
            url: url.into(),
            headers: Headers::new(),
            opts: EffectOpts::new(token),
        }
    }

    pub fn http_post(url: impl Into<String>, body: impl Into<Bytes>, token: SlotId) -> Self {
        Effect::HttpPost {
            url: url.into(),
            headers: Headers::new(),
            body: body.into(),
            idem: None,
            opts: EffectOpts::new(token),
        }
    }

    pub fn http_call(
        method: Method,
        url: impl Into<String>,
        body: impl Into<Bytes>,
        token: SlotId,
    ) -> Self {
        Effect::HttpCall {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: body.into(),
            idem: None,
            opts: EffectOpts::new(token),
        }
    }

    pub fn compute(task: impl Into<String>, input: Value, token: SlotId) -> Self {
        Effect::ComputeTask {
            task: task.into(),
            input,
            opts: EffectOpts::new(token),
        }
    }

    pub fn compensate(task: impl Into<String>, input: Value, token: SlotId) -> Self {
        Effect::Compensate {
            task: task.into(),
            input,
            opts: EffectOpts::new(token),
        }
    }

    // -- builder-style modifiers ------------------------------------------

    pub fn with_required(mut self, required: bool) -> Self {
        self.opts_mut().required = required;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.opts_mut().timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.opts_mut().retry = Some(retry);
        self
    }

    /// Idempotency key for write variants; ignored by read variants
    pub fn with_idem(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        match &mut self {
            Effect::DbPut { idem, .. }
            | Effect::DbDel { idem, .. }
            | Effect::HttpPost { idem, .. }
            | Effect::HttpCall { idem, .. } => *idem = Some(key),
            _ => {}
        }
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self {
            Effect::HttpGet { headers, .. }
            | Effect::HttpPost { headers, .. }
            | Effect::HttpCall { headers, .. } => headers.append(name, value),
            _ => {}
        }
        self
    }

    pub fn with_scan_limit(mut self, limit: usize) -> Self {
        if let Effect::DbScan { limit: l, .. } = &mut self {
            *l = Some(limit);
        }
        self
    }

    // -- accessors ---------------------------------------------------------

    pub fn kind(&self) -> EffectKind {
        match self {
            Effect::DbGet { .. } => EffectKind::DbGet,
            Effect::DbPut { .. } => EffectKind::DbPut,
            Effect::DbDel { .. } => EffectKind::DbDel,
            Effect::DbScan { .. } => EffectKind::DbScan,
            Effect::DbQuery { .. } => EffectKind::DbQuery,
            Effect::HttpGet { .. } => EffectKind::HttpGet,
            Effect::HttpPost { .. } => EffectKind::HttpPost,
            Effect::HttpCall { .. } => EffectKind::HttpCall,
            Effect::ComputeTask { .. } => EffectKind::ComputeTask,
            Effect::Compensate { .. } => EffectKind::Compensate,
        }
    }

    pub fn opts(&self) -> &EffectOpts {
        match self {
            Effect::DbGet { opts, .. }
            | Effect::DbPut { opts, .. }
            | Effect::DbDel { opts, .. }
            | Effect::DbScan { opts, .. }
            | Effect::DbQuery { opts, .. }
            | Effect::HttpGet { opts, .. }
            | Effect::HttpPost { opts, .. }
            | Effect::HttpCall { opts, .. }
            | Effect::ComputeTask { opts, .. }
            | Effect::Compensate { opts, .. } => opts,
        }
    }

    fn opts_mut(&mut self) -> &mut EffectOpts {
        match self {
            Effect::DbGet { opts, .. }
            | Effect::DbPut { opts, .. }
            | Effect::DbDel { opts, .. }
            | Effect::DbScan { opts, .. }
            | Effect::DbQuery { opts, .. }
            | Effect::HttpGet { opts, .. }
            | Effect::HttpPost { opts, .. }
            | Effect::HttpCall { opts, .. }
            | Effect::ComputeTask { opts, .. }
            | Effect::Compensate { opts, .. } => opts,
        }
    }

    pub fn token(&self) -> SlotId {
        self.opts().token
    }

    pub fn required(&self) -> bool {
        self.opts().required
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.opts().timeout_ms.map(Duration::from_millis)
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.opts().retry.as_ref()
    }

    pub fn idem_key(&self) -> Option<&str> {
        match self {
            Effect::DbPut { idem, .. }
            | Effect::DbDel { idem, .. }
            | Effect::HttpPost { idem, .. }
            | Effect::HttpCall { idem, .. } => idem.as_deref(),
            _ => None,
        }
    }

    /// The `target` field of `effect_start` events: what the effect addresses
    pub fn target(&self) -> String {
        match self {
            Effect::DbGet { namespace, key, .. }
            | Effect::DbPut { namespace, key, .. }
            | Effect::DbDel { namespace, key, .. } => format!("{namespace}:{key}"),
            Effect::DbScan { namespace, prefix, .. } => format!("{namespace}:{prefix}*"),
            Effect::DbQuery { .. } => "sql".to_string(),
            Effect::HttpGet { url, .. }
            | Effect::HttpPost { url, .. }
            | Effect::HttpCall { url, .. } => host_of(url),
            Effect::ComputeTask { task, .. } | Effect::Compensate { task, .. } => {
                format!("task:{task}")
            }
        }
    }

    /// Key the per-target concurrency cap groups by: coarser than `target`,
    /// one entry per store namespace / upstream host / task
    pub fn cap_key(&self) -> String {
        match self {
            Effect::DbGet { namespace, .. }
            | Effect::DbPut { namespace, .. }
            | Effect::DbDel { namespace, .. }
            | Effect::DbScan { namespace, .. } => format!("kv:{namespace}"),
            Effect::DbQuery { .. } => "sql".to_string(),
            Effect::HttpGet { url, .. }
            | Effect::HttpPost { url, .. }
            | Effect::HttpCall { url, .. } => host_of(url),
            Effect::ComputeTask { task, .. } | Effect::Compensate { task, .. } => {
                format!("task:{task}")
            }
        }
    }
}

/// Best-effort host extraction for per-target concurrency caps
fn host_of(url: &str) -> String {
    let rest = url.split("//").nth(1).unwrap_or(url);
    rest.split(['/', '?']).next().unwrap_or(rest).to_string()
}

/// Backoff shape between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backoff")]
pub enum Backoff {
    Constant,
    Exponential { multiplier: f64 },
}

/// Retry policy applied to a single effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts beyond the first; total attempts = 1 + max_attempts
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
    /// Adds a random delay in `[0, delay]` on top of the computed delay
    pub jitter: bool,
    pub per_attempt_timeout_ms: Option<u64>,
}

impl RetryPolicy {
    /// No retries; a single attempt with an optional per-attempt timeout
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff: Backoff::Constant,
            jitter: false,
            per_attempt_timeout_ms: None,
        }
    }

    pub fn constant(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff: Backoff::Constant,
            jitter: false,
            per_attempt_timeout_ms: None,
        }
    }

    pub fn exponential(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            backoff: Backoff::Exponential { multiplier },
            jitter: false,
            per_attempt_timeout_ms: None,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn with_per_attempt_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.per_attempt_timeout_ms = Some(timeout_ms);
        self
    }

    /// Total attempts this policy allows
    pub fn attempts(&self) -> u32 {
        1 + self.max_attempts
    }

    /// Base delay before the k-th retry (k is 1-based), before jitter:
    /// `min(max_delay, initial_delay * multiplier^(k-1))`
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        let initial = self.initial_delay_ms as f64;
        let raw = match self.backoff {
            Backoff::Constant => initial,
            Backoff::Exponential { multiplier } => {
                initial * multiplier.powi(retry_index.saturating_sub(1) as i32)
            }
        };
        Duration::from_millis((raw as u64).min(self.max_delay_ms))
    }

    /// Delay with jitter applied, sampled fresh per call
    pub fn delay(&self, retry_index: u32) -> Duration {
        let base = self.base_delay(retry_index);
        if self.jitter && !base.is_zero() {
            let extra = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=base.as_millis() as u64);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }

    pub fn per_attempt_timeout(&self) -> Option<Duration> {
        self.per_attempt_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_round_trip() {
        let effect = Effect::db_get("todos", "todo:42", SlotId(3))
            .with_required(true)
            .with_timeout_ms(250);
        assert_eq!(effect.kind(), EffectKind::DbGet);
        assert_eq!(effect.token(), SlotId(3));
        assert!(effect.required());
        assert_eq!(effect.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(effect.target(), "todos:todo:42");
    }

    #[test]
    fn test_idem_only_on_writes() {
        let get = Effect::db_get("todos", "a", SlotId(0)).with_idem("k");
        assert_eq!(get.idem_key(), None);

        let put = Effect::db_put("todos", "a", "v", SlotId(0)).with_idem("k");
        assert_eq!(put.idem_key(), Some("k"));
    }

    #[test]
    fn test_http_target_is_host() {
        let effect = Effect::http_get("https://api.example.com/v1/profile?id=1", SlotId(0));
        assert_eq!(effect.target(), "api.example.com");
        assert_eq!(effect.cap_key(), "api.example.com");
    }

    #[test]
    fn test_cap_key_groups_by_namespace() {
        let a = Effect::db_get("todos", "todo:1", SlotId(0));
        let b = Effect::db_put("todos", "todo:2", "v", SlotId(1));
        assert_ne!(a.target(), b.target());
        assert_eq!(a.cap_key(), "kv:todos");
        assert_eq!(b.cap_key(), "kv:todos");
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let policy = RetryPolicy::exponential(3, 20, 1_000, 2.0);
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.base_delay(1), Duration::from_millis(20));
        assert_eq!(policy.base_delay(2), Duration::from_millis(40));
        assert_eq!(policy.base_delay(3), Duration::from_millis(80));
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let policy = RetryPolicy::exponential(10, 100, 300, 2.0);
        assert_eq!(policy.base_delay(5), Duration::from_millis(300));
    }

    #[test]
    fn test_constant_backoff() {
        let policy = RetryPolicy::constant(2, 50);
        assert_eq!(policy.base_delay(1), Duration::from_millis(50));
        assert_eq!(policy.base_delay(2), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::constant(1, 100).with_jitter();
        for _ in 0..32 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(EffectKind::DbGet.as_str(), "db_get");
        assert_eq!(EffectKind::ComputeTask.as_str(), "compute_task");
    }
}
