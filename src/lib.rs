//! # PipeFlow-RS
//!
//! An observable, deterministic request-execution core for backend services.
//!
//! PipeFlow models request handling as a **Pipeline + Slot Store + Effects**:
//! - **Step**: a pure decision function over typed per-request slots
//! - **Effect**: a declarative I/O request the runtime performs on the step's
//!   behalf, with retry, timeout, and join policies
//! - **Slot Store**: schema-typed, write-once per-request state connecting
//!   steps and effect results
//!
//! Every request produces a complete trace timeline (steps, effects, slot
//! writes, scheduler jobs) exported as a hierarchical span tree.
//!
//! ## 🏗️ Architecture
//!
//! A request enters the [`Engine`], which routes it to a pipeline of steps.
//! Each step returns one of four decisions:
//!
//! - `Continue`: proceed to the next step
//! - `Done`: terminate with a response
//! - `Fail`: terminate through the error renderer
//! - `Need`: dispatch effects, then resume at a named continuation step
//!
//! Effects run on the scheduler's effector pool under the declared mode
//! (sequential/parallel) and join policy (all / all_required / any /
//! first_success); results land in the slots the effects named, and the
//! continuation runs on the continuation pool.
//!
//! ## 🚀 Quick Start
//!
//! ```rust
//! use pipeflow_rs::prelude::*;
//! use std::sync::Arc;
//!
//! const TODO: SlotId = SlotId(0);
//!
//! # async fn demo() -> Result<(), pipeflow_rs::BuildError> {
//! let kv = Arc::new(MemoryKv::new());
//! kv.seed("todos", "todo:42", r#"{"id":"42","title":"x"}"#);
//!
//! let engine = Engine::builder()
//!     .schema(SlotSchema::new().slot(TODO, "TodoItem", SlotType::Bytes))
//!     .kv(kv)
//!     .route(
//!         Route::new(Method::Get, "/todos/:id")
//!             .step(
//!                 StepDescriptor::from_fn("load", |view| {
//!                     let id = view.param("id").unwrap_or_default();
//!                     Ok(Decision::need(
//!                         Need::resume_at("render")
//!                             .effect(
//!                                 Effect::db_get("todos", format!("todo:{id}"), TODO)
//!                                     .with_required(true),
//!                             )
//!                             .build(),
//!                     ))
//!                 })
//!                 .effects([TODO]),
//!             )
//!             .continuation(
//!                 StepDescriptor::from_fn("render", |view| {
//!                     let body = view.require_bytes(TODO)?.clone();
//!                     Ok(Decision::done(Response::ok(body)))
//!                 })
//!                 .reads([TODO]),
//!             ),
//!     )
//!     .build()?;
//!
//! let response = engine.handle(Request::new(Method::Get, "/todos/42")).await;
//! assert_eq!(response.status, 200);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `builtin-steps` (default): ready-made steps (LogStep, SetSlotStep, ...)
//! - `http-client`: outbound HTTP effector backed by reqwest
//! - `full`: everything

// ============================================================================
// CORE MODULES
// ============================================================================

pub mod arena;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod decision;
pub mod effect;
pub mod effector;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod request;
pub mod router;
pub mod scheduler;
pub mod slot;
pub mod step;
pub mod trace;
pub mod view;

// ============================================================================
// CORE RE-EXPORTS
// ============================================================================

pub use arena::Arena;
pub use config::{ComputePoolKind, RuntimeConfig, ShedKind};
pub use context::{CancelToken, RequestContext};
pub use decision::{Decision, Join, Mode, Need, NeedBuilder};
pub use effect::{Backoff, Effect, EffectKind, RetryPolicy};
pub use effector::compute::{ComputeRegistry, ComputeTask, FnComputeTask};
pub use effector::http::{HttpClient, HttpRequest, HttpResponse};
pub use effector::memory::MemoryKv;
pub use effector::sql::{SqlDriver, SqlRow, SqlValue};
pub use effector::{EffectorCx, EffectorRegistry, KvAdapter};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, ErrorKind, FlowResult};
pub use pipeline::BuildError;
pub use render::{ErrorRenderer, JsonErrorRenderer};
pub use request::{Headers, Method, Request, Response};
pub use router::{Continuation, Route, RouteBudget, RouteMatch, RoutePattern, Router, RouterError};
pub use scheduler::{InlineScheduler, Job, PooledScheduler, QueueKind, ScheduleError, Scheduler};
pub use slot::{SlotId, SlotSchema, SlotStore, SlotType, SlotValue};
pub use step::{FnStep, Step, StepDescriptor};
pub use trace::{
    CollectingExporter, NullExporter, PromotionThresholds, SpanKind, SpanNode, SpanTreeExporter,
    TraceEvent, TraceExporter, TraceHandle, TraceRecorder, build_span_tree,
};
pub use view::StepView;

// ============================================================================
// FEATURE-GATED RE-EXPORTS
// ============================================================================

/// Built-in steps
#[cfg(feature = "builtin-steps")]
pub use step::builtin::{ExtractParamStep, FailStep, LogStep, RespondStep, SetSlotStep};

/// Production HTTP client
#[cfg(feature = "http-client")]
pub use effector::http::ReqwestClient;

// ============================================================================
// CONVENIENCE RE-EXPORTS
// ============================================================================

/// Commonly used external types
pub use bytes::Bytes;
pub use serde_json::Value as JsonValue;

/// Convenient re-exports for common types and traits
pub mod prelude {
    pub use crate::{
        Bytes, CancelToken, CollectingExporter, Decision, Effect, EffectKind, Engine, Error,
        ErrorKind, FlowResult, Headers, InlineScheduler, Join, JsonValue, MemoryKv, Method, Mode,
        Need, PooledScheduler, Request, Response, RetryPolicy, Route, Router, RuntimeConfig,
        SlotId, SlotSchema, SlotType, SlotValue, Step, StepDescriptor, StepView, TraceEvent,
    };

    #[cfg(feature = "builtin-steps")]
    pub use crate::step::builtin::{ExtractParamStep, FailStep, LogStep, RespondStep, SetSlotStep};

    #[cfg(feature = "http-client")]
    pub use crate::effector::http::ReqwestClient;
}
