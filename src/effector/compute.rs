//! Named compute tasks behind `compute_task` and `compensate`.
//!
//! CPU-heavy work and compensation actions are registered by name at engine
//! construction; effects reference them by that name. The scheduler routes
//! them to the compute pool (or the continuation pool when it is shared).

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::CancelToken;
use crate::error::{Error, FlowResult};
use crate::slot::SlotValue;

/// A named CPU task invoked by `compute_task` / `compensate` effects
#[async_trait]
pub trait ComputeTask: Send + Sync {
    async fn run(&self, input: Value, cancel: &CancelToken) -> FlowResult<SlotValue>;
}

impl std::fmt::Debug for dyn ComputeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeTask").finish()
    }
}

type ComputeFn =
    Box<dyn Fn(Value, CancelToken) -> BoxFuture<'static, FlowResult<SlotValue>> + Send + Sync>;

/// A compute task backed by a closure
pub struct FnComputeTask {
    f: ComputeFn,
}

impl FnComputeTask {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = FlowResult<SlotValue>> + Send + 'static,
    {
        Self {
            f: Box::new(move |input, cancel| Box::pin(f(input, cancel))),
        }
    }
}

#[async_trait]
impl ComputeTask for FnComputeTask {
    async fn run(&self, input: Value, cancel: &CancelToken) -> FlowResult<SlotValue> {
        (self.f)(input, cancel.clone()).await
    }
}

/// Registry of named compute tasks
#[derive(Default)]
pub struct ComputeRegistry {
    tasks: HashMap<String, Arc<dyn ComputeTask>>,
}

impl ComputeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, task: Arc<dyn ComputeTask>) {
        self.tasks.insert(name.into(), task);
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = FlowResult<SlotValue>> + Send + 'static,
    {
        self.register(name, Arc::new(FnComputeTask::new(f)));
    }

    pub fn get(&self, name: &str) -> FlowResult<&Arc<dyn ComputeTask>> {
        self.tasks
            .get(name)
            .ok_or_else(|| Error::internal("compute", name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
