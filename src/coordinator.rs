//! # Effect Coordinator
//!
//! Performs the effects of a `Need` under its declared mode and join policy,
//! applies per-effect retry and timeout, binds results into the request's
//! slots, and decides whether the pipeline resumes or fails.
//!
//! The rules it enforces:
//!
//! - **Sequential** effects start in declaration order, each completing
//!   before the next begins; **Parallel** effects start together, bounded by
//!   per-target and per-request concurrency caps.
//! - **all** resumes when everything finished; a failed required effect fails
//!   the pipeline with the first such failure in declaration order.
//! - **all_required** resumes once the required set finished; optional
//!   stragglers detach and are recorded, never promoted to pipeline failure.
//! - **any** resumes on the first completion; **first_success** on the first
//!   success, falling back to the required rules when nothing succeeds.
//! - Slot bindings are serialized into the context by the coordinator between
//!   effect completion and continuation resumption; effect jobs themselves
//!   never touch the context.
//! - Compensations registered by completed needs run in reverse order on a
//!   later pipeline failure; their own failures are recorded and ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

use crate::config::{LimitsConfig, RetryDefaults};
use crate::context::{CancelToken, RequestContext};
use crate::decision::{Join, Mode, Need};
use crate::effect::{Backoff, Effect, RetryPolicy};
use crate::effector::{EffectorCx, EffectorRegistry};
use crate::error::{Error, ErrorKind, FlowResult};
use crate::scheduler::{Job, QueueKind, ScheduleError, Scheduler};
use crate::slot::SlotValue;
use crate::trace::{TraceEvent, TraceHandle};

/// What the interpreter does after a need settles
#[derive(Debug)]
pub(crate) enum NeedOutcome {
    Resume { resume: String },
    Failed(Error),
}

struct Completion {
    index: usize,
    result: FlowResult<Option<SlotValue>>,
}

/// Join bookkeeping over effect completions
struct JoinState {
    total: usize,
    required: Vec<bool>,
    finished: usize,
    required_finished: usize,
    required_total: usize,
    /// Lowest declaration index among failed required effects
    first_required_failure: Option<(usize, Error)>,
    successes: Vec<(usize, Option<SlotValue>)>,
    first_completion: Option<(usize, FlowResult<Option<SlotValue>>)>,
    first_success: Option<usize>,
}

impl JoinState {
    fn new(effects: &[Effect]) -> Self {
        let required: Vec<bool> = effects.iter().map(Effect::required).collect();
        let required_total = required.iter().filter(|r| **r).count();
        Self {
            total: effects.len(),
            required,
            finished: 0,
            required_finished: 0,
            required_total,
            first_required_failure: None,
            successes: Vec::new(),
            first_completion: None,
            first_success: None,
        }
    }

    fn absorb(&mut self, completion: Completion) {
        let Completion { index, result } = completion;
        self.finished += 1;
        if self.required[index] {
            self.required_finished += 1;
        }
        match &result {
            Ok(value) => {
                if self.first_success.is_none() {
                    self.first_success = Some(index);
                }
                self.successes.push((index, value.clone()));
            }
            Err(err) => {
                if self.required[index] {
                    let replace = match &self.first_required_failure {
                        Some((existing, _)) => index < *existing,
                        None => true,
                    };
                    if replace {
                        self.first_required_failure = Some((index, err.clone()));
                    }
                }
            }
        }
        if self.first_completion.is_none() {
            self.first_completion = Some((index, result));
        }
    }

    /// `None` while the join condition is still open
    fn verdict(&self, join: Join) -> Option<Result<(), Error>> {
        match join {
            Join::All => (self.finished == self.total).then(|| self.required_verdict()),
            Join::AllRequired => {
                (self.required_finished == self.required_total).then(|| self.required_verdict())
            }
            Join::Any => self.first_completion.as_ref().map(|(index, result)| {
                match result {
                    Ok(_) => Ok(()),
                    Err(err) if self.required[*index] => Err(err.clone()),
                    Err(_) => Ok(()),
                }
            }),
            Join::FirstSuccess => {
                if self.first_success.is_some() {
                    Some(Ok(()))
                } else if self.finished == self.total {
                    Some(self.required_verdict())
                } else {
                    None
                }
            }
        }
    }

    fn required_verdict(&self) -> Result<(), Error> {
        match &self.first_required_failure {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Bindings to serialize into the context on resume
    fn bindings(&self, join: Join) -> Vec<(usize, SlotValue)> {
        let mut picked: Vec<(usize, SlotValue)> = match join {
            Join::All | Join::AllRequired => self
                .successes
                .iter()
                .filter_map(|(i, v)| v.clone().map(|v| (*i, v)))
                .collect(),
            Join::Any => self
                .first_completion
                .iter()
                .filter_map(|(i, r)| match r {
                    Ok(Some(v)) => Some((*i, v.clone())),
                    _ => None,
                })
                .collect(),
            Join::FirstSuccess => self
                .first_success
                .and_then(|first| {
                    self.successes
                        .iter()
                        .find(|(i, _)| *i == first)
                        .and_then(|(i, v)| v.clone().map(|v| (*i, v)))
                })
                .into_iter()
                .collect(),
        };
        picked.sort_by_key(|(i, _)| *i);
        picked
    }
}

/// Owns effect dispatch for the engine
pub struct Coordinator {
    scheduler: Arc<dyn Scheduler>,
    effectors: Arc<EffectorRegistry>,
    retry_defaults: RetryDefaults,
    limits: LimitsConfig,
    targets: StdMutex<HashMap<String, Arc<Semaphore>>>,
}

/// Everything an effect job needs, owned so the job future is `'static`
#[derive(Clone)]
struct RunCx {
    effectors: Arc<EffectorRegistry>,
    trace: TraceHandle,
    request_id: Uuid,
    need_sequence: u64,
    request_cancel: CancelToken,
    need_cancel: CancelToken,
    policy: RetryPolicy,
    target_sem: Arc<Semaphore>,
    inflight_sem: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        effectors: Arc<EffectorRegistry>,
        retry_defaults: RetryDefaults,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            scheduler,
            effectors,
            retry_defaults,
            limits,
            targets: StdMutex::new(HashMap::new()),
        }
    }

    /// Run one need to its join verdict and bind results
    pub(crate) async fn run_need(
        &self,
        ctx: &mut RequestContext,
        need: Need,
        issued_by: &str,
        sequence: u64,
        inflight_cap: usize,
    ) -> NeedOutcome {
        if need.effects.is_empty() {
            return NeedOutcome::Failed(Error::invalid_input("need", "empty"));
        }

        let trace = ctx.trace().clone();
        trace.record(TraceEvent::NeedScheduled {
            request_id: ctx.request_id(),
            sequence,
            effect_count: need.effects.len(),
            mode: need.mode,
            join: need.join,
        });

        let need_cancel = CancelToken::new();
        let inflight_sem = Arc::new(Semaphore::new(inflight_cap.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let mut state = JoinState::new(&need.effects);

        let verdict = match need.mode {
            Mode::Sequential => {
                for (index, effect) in need.effects.iter().enumerate() {
                    // any/first_success stop dispatching once decided; the
                    // all-variants run every effect to completion
                    if matches!(need.join, Join::Any | Join::FirstSuccess)
                        && state.verdict(need.join).is_some()
                    {
                        break;
                    }
                    match self
                        .submit_effect(
                            index,
                            effect,
                            sequence,
                            ctx,
                            &trace,
                            &need_cancel,
                            &inflight_sem,
                            &tx,
                        )
                        .await
                    {
                        Ok(()) => {
                            if let Some(completion) = rx.recv().await {
                                state.absorb(completion);
                            }
                        }
                        Err(err) => state.absorb(Completion {
                            index,
                            result: Err(err),
                        }),
                    }
                }
                state
                    .verdict(need.join)
                    .unwrap_or_else(|| state.required_verdict())
            }
            Mode::Parallel => {
                for (index, effect) in need.effects.iter().enumerate() {
                    if let Err(err) = self
                        .submit_effect(
                            index,
                            effect,
                            sequence,
                            ctx,
                            &trace,
                            &need_cancel,
                            &inflight_sem,
                            &tx,
                        )
                        .await
                    {
                        state.absorb(Completion {
                            index,
                            result: Err(err),
                        });
                    }
                }
                loop {
                    if let Some(verdict) = state.verdict(need.join) {
                        break verdict;
                    }
                    if state.finished == state.total {
                        break state.required_verdict();
                    }
                    match rx.recv().await {
                        Some(completion) => state.absorb(completion),
                        None => break state.required_verdict(),
                    }
                }
            }
        };

        // blocking-reference semantics: completions that already arrived are
        // still absorbed and bound before the continuation runs
        if matches!(need.join, Join::All | Join::AllRequired) {
            while let Ok(completion) = rx.try_recv() {
                state.absorb(completion);
            }
        }

        if matches!(need.join, Join::Any | Join::FirstSuccess) && self.limits.any_join_cancels {
            need_cancel.cancel();
        }

        match verdict {
            Ok(()) => {
                for (index, value) in state.bindings(need.join) {
                    let token = need.effects[index].token();
                    if let Err(err) = ctx.write_slot(issued_by, token, value) {
                        return NeedOutcome::Failed(err);
                    }
                }
                ctx.push_compensations(need.compensations);
                NeedOutcome::Resume {
                    resume: need.resume,
                }
            }
            Err(err) => NeedOutcome::Failed(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_effect(
        &self,
        index: usize,
        effect: &Effect,
        sequence: u64,
        ctx: &RequestContext,
        trace: &TraceHandle,
        need_cancel: &CancelToken,
        inflight_sem: &Arc<Semaphore>,
        tx: &mpsc::UnboundedSender<Completion>,
    ) -> Result<(), Error> {
        let cx = RunCx {
            effectors: self.effectors.clone(),
            trace: trace.clone(),
            request_id: ctx.request_id(),
            need_sequence: sequence,
            request_cancel: ctx.cancel_token().clone(),
            need_cancel: need_cancel.clone(),
            policy: effect
                .retry()
                .cloned()
                .unwrap_or_else(|| self.default_policy()),
            target_sem: self.target_semaphore(&effect.cap_key()),
            inflight_sem: inflight_sem.clone(),
        };
        let effect = effect.clone();
        let tx = tx.clone();
        let queue = match effect.kind() {
            crate::effect::EffectKind::ComputeTask | crate::effect::EffectKind::Compensate => {
                QueueKind::Compute
            }
            _ => QueueKind::Effector,
        };
        let job = Job::new(queue, format!("effect:{}", effect.kind()), async move {
            let result = run_effect(&cx, &effect).await;
            let _ = tx.send(Completion { index, result });
        })
        .with_trace(trace.clone());

        self.scheduler
            .submit(job)
            .await
            .map_err(|err| self.shed_error(err))
    }

    fn shed_error(&self, err: ScheduleError) -> Error {
        match err {
            ScheduleError::QueueFull(queue) => {
                tracing::warn!(queue = %queue, "effect shed: queue full");
                Error::new(self.limits.shed_kind.error_kind(), "queue", queue.as_str())
            }
            ScheduleError::Rejected(queue) => Error::internal("pool", queue.as_str()),
            ScheduleError::Shutdown => Error::internal("scheduler", "shutdown"),
        }
    }

    fn default_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_defaults.max_attempts,
            initial_delay_ms: self.retry_defaults.initial_delay_ms,
            max_delay_ms: self.retry_defaults.max_delay_ms,
            backoff: Backoff::Exponential {
                multiplier: self.retry_defaults.multiplier,
            },
            jitter: self.retry_defaults.jitter,
            per_attempt_timeout_ms: None,
        }
    }

    fn target_semaphore(&self, target: &str) -> Arc<Semaphore> {
        let mut targets = self.targets.lock().expect("targets poisoned");
        targets
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limits.per_target_concurrency.max(1))))
            .clone()
    }

    /// Run registered compensations in reverse declaration order.
    ///
    /// Failures are traced and logged, never propagated; a failed request
    /// stays failed.
    pub(crate) async fn run_compensations(&self, ctx: &mut RequestContext) {
        let compensations = ctx.take_compensations();
        if compensations.is_empty() {
            return;
        }
        let trace = ctx.trace().clone();
        for effect in compensations.into_iter().rev() {
            let cx = EffectorCx {
                request_id: ctx.request_id(),
                need_sequence: 0,
                // compensation runs during teardown, past request cancellation
                cancel: CancelToken::new(),
            };
            let started = Instant::now();
            trace.record(TraceEvent::EffectStart {
                request_id: ctx.request_id(),
                kind: effect.kind(),
                target: effect.target(),
                token: effect.token(),
                required: false,
                timeout_ms: effect.opts().timeout_ms,
                attempt: 1,
                idem: effect.idem_key().map(str::to_string),
                ts: chrono::Utc::now(),
            });
            let budget = effect.timeout().unwrap_or(Duration::from_secs(5));
            let result = match tokio::time::timeout(budget, self.effectors.perform(&effect, &cx))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::timeout("compensate", effect.target())),
            };
            let success = result.is_ok();
            trace.record(TraceEvent::EffectEnd {
                request_id: ctx.request_id(),
                kind: effect.kind(),
                token: effect.token(),
                success,
                duration_ns: started.elapsed().as_nanos() as u64,
                bytes: None,
                error: result.as_ref().err().cloned(),
            });
            if let Err(err) = result {
                tracing::warn!(target = %effect.target(), %err, "compensation failed");
                trace.record(TraceEvent::Error {
                    request_id: ctx.request_id(),
                    error: err,
                    ts: chrono::Utc::now(),
                });
            }
        }
    }
}

/// Select over the effect work and both cancellation sources
async fn cancellable<T>(
    request_cancel: &CancelToken,
    need_cancel: &CancelToken,
    work: impl Future<Output = FlowResult<T>>,
) -> FlowResult<T> {
    tokio::select! {
        _ = request_cancel.cancelled() => Err(Error::cancelled("effect", "request")),
        _ = need_cancel.cancelled() => Err(Error::cancelled("effect", "need")),
        result = work => result,
    }
}

/// One effect: attempts, per-attempt timeout, backoff, total timeout
async fn run_effect(cx: &RunCx, effect: &Effect) -> FlowResult<Option<SlotValue>> {
    let _inflight = cx
        .inflight_sem
        .acquire()
        .await
        .map_err(|_| Error::internal("coordinator", "inflight"))?;

    let attempts_loop = run_attempts(cx, effect);
    match effect.timeout() {
        Some(total) => match tokio::time::timeout(total, attempts_loop).await {
            Ok(result) => result,
            Err(_) => {
                let err = Error::timeout("effect", effect.kind().as_str());
                // the in-flight attempt was dropped mid-air; close its span
                cx.trace.record(TraceEvent::EffectEnd {
                    request_id: cx.request_id,
                    kind: effect.kind(),
                    token: effect.token(),
                    success: false,
                    duration_ns: total.as_nanos() as u64,
                    bytes: None,
                    error: Some(err.clone()),
                });
                Err(err)
            }
        },
        None => attempts_loop.await,
    }
}

async fn run_attempts(cx: &RunCx, effect: &Effect) -> FlowResult<Option<SlotValue>> {
    let attempts = cx.policy.attempts();
    let mut last_err = Error::internal("effect", "no_attempt");
    for attempt in 1..=attempts {
        if cx.request_cancel.is_cancelled() || cx.need_cancel.is_cancelled() {
            return Err(Error::cancelled("effect", effect.kind().as_str()));
        }
        cx.trace.record(TraceEvent::EffectStart {
            request_id: cx.request_id,
            kind: effect.kind(),
            target: effect.target(),
            token: effect.token(),
            required: effect.required(),
            timeout_ms: effect.opts().timeout_ms,
            attempt,
            idem: effect.idem_key().map(str::to_string),
            ts: chrono::Utc::now(),
        });

        let started = Instant::now();
        let permit = cx
            .target_sem
            .acquire()
            .await
            .map_err(|_| Error::internal("coordinator", "target"))?;
        let ecx = EffectorCx {
            request_id: cx.request_id,
            need_sequence: cx.need_sequence,
            cancel: cx.request_cancel.clone(),
        };
        let work = cx.effectors.perform(effect, &ecx);
        let outcome = match cx.policy.per_attempt_timeout() {
            Some(per_attempt) => {
                match tokio::time::timeout(
                    per_attempt,
                    cancellable(&cx.request_cancel, &cx.need_cancel, work),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout("effect", effect.kind().as_str())),
                }
            }
            None => cancellable(&cx.request_cancel, &cx.need_cancel, work).await,
        };
        drop(permit);

        let bytes = match &outcome {
            Ok(Some(value)) => Some(value.byte_len() as u64),
            _ => None,
        };
        cx.trace.record(TraceEvent::EffectEnd {
            request_id: cx.request_id,
            kind: effect.kind(),
            token: effect.token(),
            success: outcome.is_ok(),
            duration_ns: started.elapsed().as_nanos() as u64,
            bytes,
            error: outcome.as_ref().err().cloned(),
        });

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                let is_cancelled = err.kind == ErrorKind::Cancelled;
                last_err = err;
                if is_cancelled || attempt == attempts {
                    break;
                }
                let delay = cx.policy.delay(attempt);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cx.request_cancel.cancelled() => {
                            return Err(Error::cancelled("effect", effect.kind().as_str()));
                        }
                        _ = cx.need_cancel.cancelled() => {
                            return Err(Error::cancelled("effect", effect.kind().as_str()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
    Err(last_err)
}
