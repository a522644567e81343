//! # Trace Recorder
//!
//! Every request produces an ordered stream of [`TraceEvent`]s: the complete,
//! replayable timeline of steps, effects, slot writes, and scheduler jobs.
//! The recorder itself is deliberately dumb (an append-only, per-request
//! event buffer) and all interpretation lives in exporters.
//!
//! The reference [`SpanTreeExporter`] folds the stream into a hierarchical
//! span tree: the request span at the root, one child span per step, effect
//! spans under the step that issued them, and job spans *promoted* to spans
//! only when their queue-wait or run time crosses the configured thresholds
//! (everything below the thresholds collapses into an annotation on the
//! owning step).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use crate::decision::{Join, Mode};
use crate::effect::EffectKind;
use crate::error::Error;
use crate::request::Method;
use crate::scheduler::QueueKind;
use crate::slot::SlotId;

/// One record in a request's timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum TraceEvent {
    RequestStart {
        request_id: Uuid,
        method: Method,
        path: String,
        ts: DateTime<Utc>,
    },
    StepStart {
        request_id: Uuid,
        step_name: String,
        sequence: u64,
        ts: DateTime<Utc>,
    },
    StepEnd {
        request_id: Uuid,
        step_name: String,
        sequence: u64,
        /// continue | need | done | fail
        outcome: String,
        duration_ns: u64,
    },
    NeedScheduled {
        request_id: Uuid,
        /// Sequence of the issuing step
        sequence: u64,
        effect_count: usize,
        mode: Mode,
        join: Join,
    },
    EffectStart {
        request_id: Uuid,
        kind: EffectKind,
        target: String,
        token: SlotId,
        required: bool,
        timeout_ms: Option<u64>,
        /// 1-based attempt number
        attempt: u32,
        idem: Option<String>,
        ts: DateTime<Utc>,
    },
    EffectEnd {
        request_id: Uuid,
        kind: EffectKind,
        token: SlotId,
        success: bool,
        duration_ns: u64,
        bytes: Option<u64>,
        error: Option<Error>,
    },
    SlotWrite {
        request_id: Uuid,
        step_name: String,
        slot_id: SlotId,
        ts: DateTime<Utc>,
    },
    JobEnqueued {
        request_id: Uuid,
        job_type: String,
        queue: QueueKind,
        ts: DateTime<Utc>,
    },
    JobStarted {
        request_id: Uuid,
        job_type: String,
        queue: QueueKind,
        worker_id: usize,
        queue_wait_ns: u64,
        ts: DateTime<Utc>,
    },
    JobCompleted {
        request_id: Uuid,
        job_type: String,
        queue: QueueKind,
        worker_id: usize,
        queue_wait_ns: u64,
        run_active_ns: u64,
        total_ns: u64,
        success: bool,
    },
    ContinuationResume {
        request_id: Uuid,
        sequence: u64,
        resume_target: String,
    },
    Error {
        request_id: Uuid,
        error: Error,
        ts: DateTime<Utc>,
    },
    RequestEnd {
        request_id: Uuid,
        status: u16,
        duration_ns: u64,
        cancelled: bool,
    },
}

impl TraceEvent {
    /// Compact single-letter tag, handy in test assertions and debug dumps
    pub fn tag(&self) -> &'static str {
        match self {
            TraceEvent::RequestStart { .. } => "R",
            TraceEvent::StepStart { .. } => "s",
            TraceEvent::StepEnd { .. } => "S",
            TraceEvent::NeedScheduled { .. } => "n",
            TraceEvent::EffectStart { .. } => "e",
            TraceEvent::EffectEnd { .. } => "E",
            TraceEvent::SlotWrite { .. } => "w",
            TraceEvent::JobEnqueued { .. } => "q",
            TraceEvent::JobStarted { .. } => "j",
            TraceEvent::JobCompleted { .. } => "J",
            TraceEvent::ContinuationResume { .. } => "c",
            TraceEvent::Error { .. } => "x",
            TraceEvent::RequestEnd { .. } => "Z",
        }
    }
}

/// Shared handle to a request's recorder
pub type TraceHandle = Arc<TraceRecorder>;

/// Append-only event buffer for one request
#[derive(Debug)]
pub struct TraceRecorder {
    request_id: Uuid,
    started: Instant,
    events: Mutex<Vec<TraceEvent>>,
    cancelled: AtomicBool,
}

impl TraceRecorder {
    pub fn new(request_id: Uuid) -> TraceHandle {
        Arc::new(Self {
            request_id,
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn record(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Nanoseconds since the recorder was created
    pub fn elapsed_ns(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Snapshot of the timeline so far
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Compact tag string, e.g. `"RsSnweEwcsSZ"`
    pub fn tags(&self) -> String {
        self.snapshot().iter().map(|e| e.tag()).collect()
    }
}

// ============================================================================
// EXPORTERS
// ============================================================================

/// Receives a request's full timeline after the response has been written
pub trait TraceExporter: Send + Sync {
    fn export(&self, request_id: Uuid, events: &[TraceEvent]);
}

/// Discards every timeline
#[derive(Debug, Default)]
pub struct NullExporter;

impl TraceExporter for NullExporter {
    fn export(&self, _request_id: Uuid, _events: &[TraceEvent]) {}
}

/// Keeps every exported timeline in memory; the test suite's workhorse
#[derive(Debug, Default)]
pub struct CollectingExporter {
    timelines: Mutex<Vec<(Uuid, Vec<TraceEvent>)>>,
}

impl CollectingExporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn timelines(&self) -> Vec<(Uuid, Vec<TraceEvent>)> {
        self.timelines.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Events of the most recently exported request
    pub fn last(&self) -> Vec<TraceEvent> {
        self.timelines
            .lock()
            .ok()
            .and_then(|t| t.last().map(|(_, e)| e.clone()))
            .unwrap_or_default()
    }
}

impl TraceExporter for CollectingExporter {
    fn export(&self, request_id: Uuid, events: &[TraceEvent]) {
        if let Ok(mut timelines) = self.timelines.lock() {
            timelines.push((request_id, events.to_vec()));
        }
    }
}

/// Span-promotion thresholds (see [`SpanTreeExporter`])
#[derive(Debug, Clone, Copy)]
pub struct PromotionThresholds {
    pub queue_wait_ns: u64,
    pub run_active_ns: u64,
}

impl From<&crate::config::SpanPromotionConfig> for PromotionThresholds {
    fn from(config: &crate::config::SpanPromotionConfig) -> Self {
        Self {
            queue_wait_ns: config.queue_wait_ms * 1_000_000,
            run_active_ns: config.run_active_ms * 1_000_000,
        }
    }
}

/// A node in the exported span tree
#[derive(Debug, Clone, Serialize)]
pub struct SpanNode {
    pub name: String,
    pub kind: SpanKind,
    pub duration_ns: u64,
    pub children: Vec<SpanNode>,
    /// Collapsed sub-threshold job events and other annotations
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Request,
    Step,
    Effect,
    Job,
}

/// Fold a timeline into the hierarchical span tree
pub fn build_span_tree(events: &[TraceEvent], thresholds: PromotionThresholds) -> Option<SpanNode> {
    let mut root: Option<SpanNode> = None;
    // finished step spans in execution order, indexed by sequence
    let mut steps: Vec<(u64, SpanNode)> = Vec::new();
    // sequence of the step that issued the currently pending need
    let mut need_owner: Option<u64> = None;
    let mut current_step: Option<(u64, String)> = None;

    fn attach(steps: &mut [(u64, SpanNode)], owner: Option<u64>, child: SpanNode, root: &mut Option<SpanNode>) {
        if let Some(seq) = owner {
            if let Some((_, step)) = steps.iter_mut().find(|(s, _)| *s == seq) {
                step.children.push(child);
                return;
            }
        }
        if let Some(r) = root.as_mut() {
            r.children.push(child);
        }
    }

    for event in events {
        match event {
            TraceEvent::RequestStart { method, path, .. } => {
                root = Some(SpanNode {
                    name: format!("{method} {path}"),
                    kind: SpanKind::Request,
                    duration_ns: 0,
                    children: Vec::new(),
                    notes: Vec::new(),
                });
            }
            TraceEvent::StepStart { step_name, sequence, .. } => {
                current_step = Some((*sequence, step_name.clone()));
                steps.push((
                    *sequence,
                    SpanNode {
                        name: step_name.clone(),
                        kind: SpanKind::Step,
                        duration_ns: 0,
                        children: Vec::new(),
                        notes: Vec::new(),
                    },
                ));
            }
            TraceEvent::StepEnd { sequence, duration_ns, outcome, .. } => {
                if let Some((_, step)) = steps.iter_mut().find(|(s, _)| s == sequence) {
                    step.duration_ns = *duration_ns;
                    step.notes.push(format!("outcome={outcome}"));
                }
                current_step = None;
            }
            TraceEvent::NeedScheduled { sequence, .. } => {
                need_owner = Some(*sequence);
            }
            TraceEvent::EffectEnd { kind, token, success, duration_ns, .. } => {
                let child = SpanNode {
                    name: format!("{kind} {token}"),
                    kind: SpanKind::Effect,
                    duration_ns: *duration_ns,
                    children: Vec::new(),
                    notes: vec![format!("success={success}")],
                };
                attach(&mut steps, need_owner, child, &mut root);
            }
            TraceEvent::JobCompleted {
                job_type,
                queue,
                queue_wait_ns,
                run_active_ns,
                total_ns,
                ..
            } => {
                let owner = current_step.as_ref().map(|(s, _)| *s).or(need_owner);
                if *queue_wait_ns >= thresholds.queue_wait_ns
                    || *run_active_ns >= thresholds.run_active_ns
                {
                    let child = SpanNode {
                        name: format!("{job_type} [{queue:?}]"),
                        kind: SpanKind::Job,
                        duration_ns: *total_ns,
                        children: Vec::new(),
                        notes: vec![format!(
                            "queue_wait_ns={queue_wait_ns} run_active_ns={run_active_ns}"
                        )],
                    };
                    attach(&mut steps, owner, child, &mut root);
                } else if let Some(seq) = owner {
                    if let Some((_, step)) = steps.iter_mut().find(|(s, _)| *s == seq) {
                        step.notes.push(format!("job {job_type}: {total_ns}ns"));
                    }
                }
            }
            TraceEvent::RequestEnd { duration_ns, status, .. } => {
                if let Some(r) = root.as_mut() {
                    r.duration_ns = *duration_ns;
                    r.notes.push(format!("status={status}"));
                }
            }
            _ => {}
        }
    }

    if let Some(r) = root.as_mut() {
        for (_, step) in steps {
            r.children.push(step);
        }
    }
    root
}

/// Reference exporter: builds the span tree and hands it to `tracing`
#[derive(Debug)]
pub struct SpanTreeExporter {
    thresholds: PromotionThresholds,
}

impl SpanTreeExporter {
    pub fn new(thresholds: PromotionThresholds) -> Self {
        Self { thresholds }
    }
}

impl TraceExporter for SpanTreeExporter {
    fn export(&self, request_id: Uuid, events: &[TraceEvent]) {
        if let Some(tree) = build_span_tree(events, self.thresholds) {
            tracing::debug!(
                %request_id,
                spans = %serde_json::to_string(&tree).unwrap_or_default(),
                "request timeline"
            );
        }
    }
}
