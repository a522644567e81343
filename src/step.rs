//! # Steps
//!
//! A step is a pure decision function: it reads declared slots and request
//! attributes through its [`StepView`] and returns a [`Decision`]. All I/O
//! happens by returning `Decision::Need` and letting the runtime perform the
//! effects.
//!
//! Pipelines are built from [`StepDescriptor`]s: the step implementation
//! plus its declared reads, writes, and the slots its effects may bind. The
//! declarations are what the pipeline validator checks at build time and what
//! the view enforces at run time.
//!
//! For quick wiring there is [`FnStep`], which lifts a plain closure into a
//! step:
//!
//! ```rust
//! use pipeflow_rs::{Decision, Response, StepDescriptor};
//!
//! let hello = StepDescriptor::from_fn("hello", |_view| {
//!     Ok(Decision::done(Response::ok("hi")))
//! });
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::decision::Decision;
use crate::error::FlowResult;
use crate::slot::SlotId;
use crate::view::StepView;

/// The unit of computation in a pipeline
#[async_trait]
pub trait Step: Send + Sync {
    async fn call(&self, view: &mut StepView<'_>) -> FlowResult<Decision>;
}

/// A step plus its declared slot footprint
#[derive(Clone)]
pub struct StepDescriptor {
    pub name: String,
    /// Slots the step may `require`/`optional`
    pub reads: Vec<SlotId>,
    /// Slots the step may `put`
    pub writes: Vec<SlotId>,
    /// Slots the step's needs may bind through effect tokens
    pub effect_writes: Vec<SlotId>,
    pub step: Arc<dyn Step>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            effect_writes: Vec::new(),
            step,
        }
    }

    /// Descriptor around a synchronous closure
    pub fn from_fn(
        name: impl Into<String>,
        f: impl Fn(&mut StepView<'_>) -> FlowResult<Decision> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, Arc::new(FnStep::new(f)))
    }

    pub fn reads(mut self, slots: impl IntoIterator<Item = SlotId>) -> Self {
        self.reads.extend(slots);
        self
    }

    pub fn writes(mut self, slots: impl IntoIterator<Item = SlotId>) -> Self {
        self.writes.extend(slots);
        self
    }

    /// Declare the slots this step's effects may write
    pub fn effects(mut self, slots: impl IntoIterator<Item = SlotId>) -> Self {
        self.effect_writes.extend(slots);
        self
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("effect_writes", &self.effect_writes)
            .finish_non_exhaustive()
    }
}

type StepFn = Box<dyn Fn(&mut StepView<'_>) -> FlowResult<Decision> + Send + Sync>;

/// A step backed by a plain closure
pub struct FnStep {
    f: StepFn,
}

impl FnStep {
    pub fn new(
        f: impl Fn(&mut StepView<'_>) -> FlowResult<Decision> + Send + Sync + 'static,
    ) -> Self {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl Step for FnStep {
    async fn call(&self, view: &mut StepView<'_>) -> FlowResult<Decision> {
        (self.f)(view)
    }
}

#[cfg(feature = "builtin-steps")]
pub mod builtin;
