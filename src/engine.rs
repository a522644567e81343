//! # Engine
//!
//! The facade wiring every component together: router, scheduler,
//! coordinator, effectors, trace exporter, error renderer. Hosts build one
//! [`Engine`] at startup, hand it parsed requests, and write the responses it
//! returns.
//!
//! ```rust
//! use pipeflow_rs::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), pipeflow_rs::BuildError> {
//! let engine = Engine::builder()
//!     .schema(SlotSchema::new())
//!     .route(Route::new(Method::Get, "/health").step(StepDescriptor::from_fn(
//!         "health",
//!         |_| Ok(Decision::done(Response::ok("ok"))),
//!     )))
//!     .build()?;
//!
//! let response = engine.handle(Request::new(Method::Get, "/health")).await;
//! assert_eq!(response.status, 200);
//! # Ok(())
//! # }
//! ```
//!
//! Routes are validated at build time; every request gets a fresh context,
//! a deadline watchdog, and a complete trace that is exported after the
//! response is produced.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::arena::Arena;
use crate::config::RuntimeConfig;
use crate::context::{CancelToken, RequestContext};
use crate::coordinator::{Coordinator, NeedOutcome};
use crate::effector::compute::ComputeRegistry;
use crate::effector::http::HttpClient;
use crate::effector::sql::SqlDriver;
use crate::effector::{EffectorRegistry, KvAdapter};
use crate::error::Error;
use crate::pipeline::{BuildError, StepYield, run_segment, validate_route};
use crate::render::{ErrorRenderer, JsonErrorRenderer, render_bare};
use crate::request::{Request, Response};
use crate::router::{Route, Router};
use crate::scheduler::{InlineScheduler, Job, QueueKind, Scheduler};
use crate::slot::SlotSchema;
use crate::step::StepDescriptor;
use crate::trace::{NullExporter, TraceEvent, TraceExporter, TraceHandle, TraceRecorder};

/// Runaway-continuation guard; a pipeline appending more resume steps than
/// this is cyclic
const MAX_PIPELINE_STEPS: usize = 1024;

/// Builder for [`Engine`]
pub struct EngineBuilder {
    schema: SlotSchema,
    config: RuntimeConfig,
    routes: Vec<Route>,
    global_before: Vec<Arc<StepDescriptor>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    kv: Option<Arc<dyn KvAdapter>>,
    sql: Option<Arc<dyn SqlDriver>>,
    http: Option<Arc<dyn HttpClient>>,
    compute: ComputeRegistry,
    exporter: Option<Arc<dyn TraceExporter>>,
    renderer: Option<Arc<dyn ErrorRenderer>>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            schema: SlotSchema::new(),
            config: RuntimeConfig::default(),
            routes: Vec::new(),
            global_before: Vec::new(),
            scheduler: None,
            kv: None,
            sql: None,
            http: None,
            compute: ComputeRegistry::new(),
            exporter: None,
            renderer: None,
        }
    }

    pub fn schema(mut self, schema: SlotSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Step run before every route's own pipeline
    pub fn global_before(mut self, desc: StepDescriptor) -> Self {
        self.global_before.push(Arc::new(desc));
        self
    }

    /// Defaults to the blocking [`InlineScheduler`]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn kv(mut self, adapter: Arc<dyn KvAdapter>) -> Self {
        self.kv = Some(adapter);
        self
    }

    pub fn sql(mut self, driver: Arc<dyn SqlDriver>) -> Self {
        self.sql = Some(driver);
        self
    }

    pub fn http(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    pub fn compute_task(
        mut self,
        name: impl Into<String>,
        task: Arc<dyn crate::effector::compute::ComputeTask>,
    ) -> Self {
        self.compute.register(name, task);
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn TraceExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn ErrorRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Validate every route and assemble the engine
    pub fn build(self) -> Result<Engine, BuildError> {
        let mut router = Router::new();
        for route in self.routes {
            validate_route(&self.schema, &self.global_before, &route)?;
            router.register(route)?;
        }

        let mut effectors = EffectorRegistry::new().with_compute(self.compute);
        if let Some(kv) = self.kv {
            effectors = effectors.with_kv(kv);
        }
        if let Some(sql) = self.sql {
            effectors = effectors.with_sql(sql);
        }
        if let Some(http) = self.http {
            effectors = effectors.with_http(http);
        }

        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(InlineScheduler::new()));
        let coordinator = Coordinator::new(
            scheduler.clone(),
            Arc::new(effectors),
            self.config.retry.clone(),
            self.config.limits.clone(),
        );
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(JsonErrorRenderer::new(&self.config.render)));

        Ok(Engine {
            schema: Arc::new(self.schema),
            router,
            global_before: self.global_before,
            scheduler,
            coordinator,
            exporter: self.exporter.unwrap_or_else(|| Arc::new(NullExporter)),
            renderer,
            config: self.config,
        })
    }
}

/// The assembled execution core
pub struct Engine {
    schema: Arc<SlotSchema>,
    router: Router,
    global_before: Vec<Arc<StepDescriptor>>,
    scheduler: Arc<dyn Scheduler>,
    coordinator: Coordinator,
    exporter: Arc<dyn TraceExporter>,
    renderer: Arc<dyn ErrorRenderer>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Execute one request to a response
    pub async fn handle(&self, request: Request) -> Response {
        self.handle_with_cancel(request, CancelToken::new()).await
    }

    /// Execute one request with an externally held cancellation token
    /// (client disconnects cancel through it)
    pub async fn handle_with_cancel(&self, request: Request, cancel: CancelToken) -> Response {
        let trace = TraceRecorder::new(Uuid::new_v4());
        trace.record(TraceEvent::RequestStart {
            request_id: trace.request_id(),
            method: request.method,
            path: request.path.clone(),
            ts: Utc::now(),
        });

        let deadline = request
            .deadline
            .or(self
                .config
                .request
                .total_deadline_ms
                .map(Duration::from_millis))
            .map(|budget| Instant::now() + budget);
        let watchdog = self.spawn_watchdog(deadline, &cancel, &trace);

        let response = match self.router.route(request.method, &request.path) {
            None => {
                let err = Error::not_found("route", request.path.clone());
                trace.record(TraceEvent::Error {
                    request_id: trace.request_id(),
                    error: err.clone(),
                    ts: Utc::now(),
                });
                render_bare(&err, &self.config.render)
            }
            Some(matched) => {
                let arena = Arena::new(
                    self.config.arena.soft_cap_bytes,
                    self.config.arena.hard_cap_bytes,
                );
                match RequestContext::new(
                    request,
                    matched.params,
                    self.schema.clone(),
                    arena,
                    deadline,
                    trace.clone(),
                    cancel.clone(),
                ) {
                    Ok(ctx) => self.run_pipeline(Box::new(ctx), matched.route, &trace).await,
                    Err(err) => {
                        trace.record(TraceEvent::Error {
                            request_id: trace.request_id(),
                            error: err.clone(),
                            ts: Utc::now(),
                        });
                        render_bare(&err, &self.config.render)
                    }
                }
            }
        };

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        trace.record(TraceEvent::RequestEnd {
            request_id: trace.request_id(),
            status: response.status,
            duration_ns: trace.elapsed_ns(),
            cancelled: cancel.is_cancelled() || trace.is_cancelled(),
        });
        self.exporter.export(trace.request_id(), &trace.snapshot());
        response
    }

    fn spawn_watchdog(
        &self,
        deadline: Option<Instant>,
        cancel: &CancelToken,
        trace: &TraceHandle,
    ) -> Option<JoinHandle<()>> {
        let deadline = deadline?;
        let cancel = cancel.clone();
        let trace = trace.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            trace.mark_cancelled();
            cancel.cancel();
        }))
    }

    /// Drive the interpreter/coordinator loop to a terminal response
    async fn run_pipeline(
        &self,
        mut ctx: Box<RequestContext>,
        route: Arc<Route>,
        trace: &TraceHandle,
    ) -> Response {
        // resume targets: any step in the pipeline by name, continuations
        // taking precedence
        let mut resume_targets: HashMap<String, Arc<StepDescriptor>> = HashMap::new();
        for desc in self
            .global_before
            .iter()
            .chain(route.before.iter())
            .chain(route.steps.iter())
        {
            resume_targets.insert(desc.name.clone(), desc.clone());
        }
        for continuation in &route.continuations {
            resume_targets.insert(continuation.step.name.clone(), continuation.step.clone());
        }

        let inflight_cap = route
            .budget
            .and_then(|b| b.max_concurrent_effects)
            .unwrap_or(self.config.limits.per_request_inflight);

        let mut steps: Vec<Arc<StepDescriptor>> = self
            .global_before
            .iter()
            .chain(route.before.iter())
            .chain(route.steps.iter())
            .cloned()
            .collect();
        let mut pos = 0usize;
        let mut seq = 0u64;

        loop {
            let (tx, rx) = oneshot::channel();
            let job_steps = steps.clone();
            let mut job_ctx = ctx;
            let (job_pos, job_seq) = (pos, seq);
            let job = Job::new(QueueKind::Continuation, "continuation", async move {
                let (mut pos, mut seq) = (job_pos, job_seq);
                let yielded = run_segment(&mut job_ctx, &job_steps, &mut pos, &mut seq).await;
                let _ = tx.send((job_ctx, yielded, pos, seq));
            })
            .with_trace(trace.clone());

            if let Err(err) = self.scheduler.submit(job).await {
                // the context travelled with the shed job; render without it
                let err = Error::new(
                    self.config.limits.shed_kind.error_kind(),
                    "queue",
                    err.to_string(),
                );
                trace.record(TraceEvent::Error {
                    request_id: trace.request_id(),
                    error: err.clone(),
                    ts: Utc::now(),
                });
                return render_bare(&err, &self.config.render);
            }
            let Ok((ctx_back, yielded, new_pos, new_seq)) = rx.await else {
                let err = Error::internal("scheduler", "continuation_lost");
                return render_bare(&err, &self.config.render);
            };
            ctx = ctx_back;
            pos = new_pos;
            seq = new_seq;

            match yielded {
                StepYield::Done(response) => {
                    run_exit_callbacks(&mut ctx);
                    return response;
                }
                StepYield::Fail(err) => {
                    return self.fail(&mut ctx, err).await;
                }
                StepYield::Need {
                    need,
                    issued_by,
                    sequence,
                } => {
                    match self
                        .coordinator
                        .run_need(&mut ctx, need, &issued_by, sequence, inflight_cap)
                        .await
                    {
                        NeedOutcome::Failed(err) => {
                            return self.fail(&mut ctx, err).await;
                        }
                        NeedOutcome::Resume { resume } => {
                            let Some(target) = resume_targets.get(&resume) else {
                                let err = Error::internal("continuation", resume);
                                return self.fail(&mut ctx, err).await;
                            };
                            if steps.len() >= MAX_PIPELINE_STEPS {
                                let err = Error::internal("pipeline", "max_steps");
                                return self.fail(&mut ctx, err).await;
                            }
                            trace.record(TraceEvent::ContinuationResume {
                                request_id: trace.request_id(),
                                sequence,
                                resume_target: resume.clone(),
                            });
                            steps.push(target.clone());
                            pos = steps.len() - 1;
                        }
                    }
                }
            }
        }
    }

    /// Terminal failure: error event, compensations, renderer, exit callbacks
    async fn fail(&self, ctx: &mut RequestContext, err: Error) -> Response {
        ctx.set_last_error(err.clone());
        ctx.trace().record(TraceEvent::Error {
            request_id: ctx.request_id(),
            error: err.clone(),
            ts: Utc::now(),
        });
        self.coordinator.run_compensations(ctx).await;
        let response = self.renderer.render(&err, ctx);
        run_exit_callbacks(ctx);
        response
    }
}

fn run_exit_callbacks(ctx: &mut RequestContext) {
    let callbacks = ctx.take_exit_callbacks();
    for callback in callbacks.into_iter().rev() {
        callback(ctx);
    }
}
