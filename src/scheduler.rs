//! # Scheduler / Reactor
//!
//! Three logical pools (continuation, effector, compute), each a bounded
//! job queue drained by workers. Jobs are run-to-completion futures: a worker
//! polls one job until it finishes before taking the next, and any I/O wait
//! inside a job is a cooperative suspend on the runtime, never a blocked
//! thread.
//!
//! Two conforming implementations ship:
//!
//! - [`InlineScheduler`]: the blocking reference. `submit` runs the job to
//!   completion before returning. Single-threaded by construction, which is
//!   exactly what deterministic tests want.
//! - [`PooledScheduler`]: worker tasks per pool consuming shared bounded
//!   queues on the tokio runtime. Submissions to a full queue are shed with
//!   [`ScheduleError::QueueFull`], which the coordinator translates into a
//!   request failure.
//!
//! Every job's lifecycle is recorded (`job_enqueued` / `job_started` /
//! `job_completed`) with queue-wait and run timings, feeding threshold-based
//! span promotion in the trace exporter.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::{ComputePoolKind, PoolConfig, QueueConfig};
use crate::trace::{TraceEvent, TraceHandle};

/// The pool a job belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Continuation,
    Effector,
    Compute,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Continuation => "continuation",
            QueueKind::Effector => "effector",
            QueueKind::Compute => "compute",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("{0} queue full")]
    QueueFull(QueueKind),
    #[error("{0} pool not available")]
    Rejected(QueueKind),
    #[error("scheduler shut down")]
    Shutdown,
}

/// A unit of scheduled work
pub struct Job {
    queue: QueueKind,
    job_type: String,
    trace: Option<TraceHandle>,
    future: BoxFuture<'static, ()>,
}

impl Job {
    pub fn new(
        queue: QueueKind,
        job_type: impl Into<String>,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        Self {
            queue,
            job_type: job_type.into(),
            trace: None,
            future: Box::pin(future),
        }
    }

    /// Attach a request's recorder so the job lifecycle lands in its timeline
    pub fn with_trace(mut self, trace: TraceHandle) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("queue", &self.queue)
            .field("job_type", &self.job_type)
            .finish_non_exhaustive()
    }
}

/// The contract both reference implementations satisfy
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Hand a job to its pool. Completion is observed through whatever
    /// channel the job closes over, not through this call.
    async fn submit(&self, job: Job) -> Result<(), ScheduleError>;
}

fn record_enqueued(job: &Job) {
    if let Some(trace) = &job.trace {
        trace.record(TraceEvent::JobEnqueued {
            request_id: trace.request_id(),
            job_type: job.job_type.clone(),
            queue: job.queue,
            ts: Utc::now(),
        });
    }
}

/// Run one job, stamping its lifecycle into the owning request's trace
async fn run_job(job: Job, worker_id: usize, enqueued: Instant) {
    let queue_wait_ns = enqueued.elapsed().as_nanos() as u64;
    if let Some(trace) = &job.trace {
        trace.record(TraceEvent::JobStarted {
            request_id: trace.request_id(),
            job_type: job.job_type.clone(),
            queue: job.queue,
            worker_id,
            queue_wait_ns,
            ts: Utc::now(),
        });
    }
    let run_started = Instant::now();
    let success = std::panic::AssertUnwindSafe(job.future)
        .catch_unwind()
        .await
        .is_ok();
    let run_active_ns = run_started.elapsed().as_nanos() as u64;
    if let Some(trace) = &job.trace {
        trace.record(TraceEvent::JobCompleted {
            request_id: trace.request_id(),
            job_type: job.job_type.clone(),
            queue: job.queue,
            worker_id,
            queue_wait_ns,
            run_active_ns,
            total_ns: queue_wait_ns + run_active_ns,
            success,
        });
    }
    if !success {
        tracing::error!(job = %job.job_type, queue = %job.queue, "job panicked");
    }
}

// ============================================================================
// BLOCKING REFERENCE
// ============================================================================

/// Runs every job to completion inside `submit`
#[derive(Debug, Default)]
pub struct InlineScheduler;

impl InlineScheduler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Scheduler for InlineScheduler {
    async fn submit(&self, job: Job) -> Result<(), ScheduleError> {
        record_enqueued(&job);
        run_job(job, 0, Instant::now()).await;
        Ok(())
    }
}

// ============================================================================
// POOLED EVENT-LOOP IMPLEMENTATION
// ============================================================================

struct QueuedJob {
    job: Job,
    enqueued: Instant,
}

struct Pool {
    sender: StdMutex<Option<mpsc::Sender<QueuedJob>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    fn spawn(kind: QueueKind, worker_count: usize, bound: usize) -> Self {
        let (tx, rx) = mpsc::channel::<QueuedJob>(bound.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { rx.lock().await.recv().await };
                        match next {
                            Some(queued) => {
                                run_job(queued.job, worker_id, queued.enqueued).await;
                            }
                            None => break,
                        }
                    }
                    tracing::debug!(queue = %kind, worker_id, "worker exited");
                })
            })
            .collect();
        Self {
            sender: StdMutex::new(Some(tx)),
            workers,
        }
    }

    fn submit(&self, kind: QueueKind, job: Job) -> Result<(), ScheduleError> {
        let sender = self.sender.lock().expect("pool poisoned");
        let Some(sender) = sender.as_ref() else {
            return Err(ScheduleError::Shutdown);
        };
        let trace = job.trace.clone();
        let job_type = job.job_type.clone();
        match sender.try_send(QueuedJob {
            job,
            enqueued: Instant::now(),
        }) {
            Ok(()) => {
                if let Some(trace) = trace {
                    trace.record(TraceEvent::JobEnqueued {
                        request_id: trace.request_id(),
                        job_type,
                        queue: kind,
                        ts: Utc::now(),
                    });
                }
                Ok(())
            }
            // a shed job never enqueued, so nothing lands in its timeline
            Err(mpsc::error::TrySendError::Full(_)) => Err(ScheduleError::QueueFull(kind)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ScheduleError::Shutdown),
        }
    }

    fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Worker pools over the tokio runtime; the production implementation
pub struct PooledScheduler {
    continuation: Pool,
    effector: Pool,
    compute: Option<Pool>,
    compute_kind: ComputePoolKind,
}

impl PooledScheduler {
    /// Spawn the pools. Must be called from within a tokio runtime.
    pub fn new(pool: &PoolConfig, queue: &QueueConfig) -> Self {
        let compute = match pool.compute.kind {
            ComputePoolKind::Dedicated => Some(Pool::spawn(
                QueueKind::Compute,
                pool.compute.workers,
                queue.compute,
            )),
            ComputePoolKind::Shared | ComputePoolKind::None => None,
        };
        Self {
            continuation: Pool::spawn(
                QueueKind::Continuation,
                pool.continuation_workers,
                queue.continuation,
            ),
            effector: Pool::spawn(QueueKind::Effector, pool.effector_workers, queue.effector),
            compute,
            compute_kind: pool.compute.kind,
        }
    }

    /// Stop accepting work; workers exit once their queues drain
    pub fn shutdown(&self) {
        self.continuation.close();
        self.effector.close();
        if let Some(compute) = &self.compute {
            compute.close();
        }
    }
}

#[async_trait]
impl Scheduler for PooledScheduler {
    async fn submit(&self, job: Job) -> Result<(), ScheduleError> {
        match job.queue() {
            QueueKind::Continuation => self.continuation.submit(QueueKind::Continuation, job),
            QueueKind::Effector => self.effector.submit(QueueKind::Effector, job),
            QueueKind::Compute => match self.compute_kind {
                ComputePoolKind::Dedicated => self
                    .compute
                    .as_ref()
                    .expect("dedicated pool exists")
                    .submit(QueueKind::Compute, job),
                ComputePoolKind::Shared => self.continuation.submit(QueueKind::Compute, job),
                ComputePoolKind::None => Err(ScheduleError::Rejected(QueueKind::Compute)),
            },
        }
    }
}
