//! # View Discipline
//!
//! A step never touches the context directly; it receives a [`StepView`], a
//! capability scoped to the reads and writes its descriptor declared. The
//! pipeline validator checks declarations at build time (undeclared
//! read-before-write, duplicate writers); the view is the run-time fallback
//! that refuses any access slipping past a declaration.
//!
//! `require` and `put` failing here means a programming error in the step's
//! declaration, so they surface as `Internal` rather than a client-visible
//! kind.

use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{Error, FlowResult};
use crate::request::Method;
use crate::slot::{SlotId, SlotValue};
use crate::step::StepDescriptor;

/// The capability a step executes against
pub struct StepView<'a> {
    ctx: &'a mut RequestContext,
    desc: &'a StepDescriptor,
}

impl<'a> StepView<'a> {
    pub(crate) fn new(ctx: &'a mut RequestContext, desc: &'a StepDescriptor) -> Self {
        Self { ctx, desc }
    }

    /// Name of the step this view belongs to
    pub fn step_name(&self) -> &str {
        &self.desc.name
    }

    // -- declared slot access ---------------------------------------------

    /// Read a slot the step declared in `reads`; missing → `InvalidInput`
    pub fn require(&self, slot: SlotId) -> FlowResult<&SlotValue> {
        if !self.desc.reads.contains(&slot) {
            return Err(self.undeclared("read", slot));
        }
        self.ctx.slot_required(slot)
    }

    /// Read a slot that may be unset; valid for declared reads or writes
    pub fn optional(&self, slot: SlotId) -> FlowResult<Option<&SlotValue>> {
        if !self.desc.reads.contains(&slot) && !self.desc.writes.contains(&slot) {
            return Err(self.undeclared("read", slot));
        }
        Ok(self.ctx.slot_optional(slot))
    }

    /// Write a slot the step declared in `writes`
    pub fn put(&mut self, slot: SlotId, value: impl Into<SlotValue>) -> FlowResult<()> {
        if !self.desc.writes.contains(&slot) {
            return Err(self.undeclared("write", slot));
        }
        let name = self.desc.name.clone();
        self.ctx.write_slot(&name, slot, value.into())
    }

    fn undeclared(&self, op: &str, slot: SlotId) -> Error {
        Error::internal(
            "view",
            format!(
                "{}: undeclared {op} of {}",
                self.desc.name,
                self.ctx.schema().name(slot)
            ),
        )
    }

    // -- typed convenience reads ------------------------------------------

    pub fn require_bytes(&self, slot: SlotId) -> FlowResult<&Bytes> {
        self.require(slot)?
            .as_bytes()
            .ok_or_else(|| Error::internal("slot", self.ctx.schema().name(slot)))
    }

    pub fn require_text(&self, slot: SlotId) -> FlowResult<&str> {
        self.require(slot)?
            .as_text()
            .ok_or_else(|| Error::internal("slot", self.ctx.schema().name(slot)))
    }

    pub fn require_json(&self, slot: SlotId) -> FlowResult<&Value> {
        self.require(slot)?
            .as_json()
            .ok_or_else(|| Error::internal("slot", self.ctx.schema().name(slot)))
    }

    // -- request attributes (always readable) ------------------------------

    pub fn request_id(&self) -> Uuid {
        self.ctx.request_id()
    }

    pub fn method(&self) -> Method {
        self.ctx.method()
    }

    pub fn path(&self) -> &str {
        self.ctx.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.ctx.header(name)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.ctx.param(name)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.ctx.query_param(name)
    }

    pub fn body(&self) -> &Bytes {
        self.ctx.body()
    }

    pub fn client_addr(&self) -> &str {
        self.ctx.client_addr()
    }

    /// Register a LIFO teardown hook
    pub fn on_exit(&mut self, callback: impl FnOnce(&mut RequestContext) + Send + Sync + 'static) {
        self.ctx.on_exit(callback);
    }
}
