//! Built-in steps for common wiring
//!
//! Small, ready-made steps used by demo pipelines and tests: logging,
//! seeding slots, canned responses, forced failures, and path-parameter
//! extraction.

use async_trait::async_trait;

use crate::decision::Decision;
use crate::error::{Error, FlowResult};
use crate::request::Response;
use crate::slot::{SlotId, SlotValue};
use crate::step::{Step, StepDescriptor};
use crate::view::StepView;
use std::sync::Arc;

/// Logs a message through `tracing` and continues
pub struct LogStep {
    message: String,
}

impl LogStep {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn descriptor(self, name: impl Into<String>) -> StepDescriptor {
        StepDescriptor::new(name, Arc::new(self))
    }
}

#[async_trait]
impl Step for LogStep {
    async fn call(&self, view: &mut StepView<'_>) -> FlowResult<Decision> {
        tracing::info!(request_id = %view.request_id(), step = view.step_name(), "{}", self.message);
        Ok(Decision::Continue)
    }
}

/// Writes a fixed value into a slot and continues
pub struct SetSlotStep {
    slot: SlotId,
    value: SlotValue,
}

impl SetSlotStep {
    pub fn new(slot: SlotId, value: impl Into<SlotValue>) -> Self {
        Self {
            slot,
            value: value.into(),
        }
    }

    pub fn descriptor(self, name: impl Into<String>) -> StepDescriptor {
        let slot = self.slot;
        StepDescriptor::new(name, Arc::new(self)).writes([slot])
    }
}

#[async_trait]
impl Step for SetSlotStep {
    async fn call(&self, view: &mut StepView<'_>) -> FlowResult<Decision> {
        view.put(self.slot, self.value.clone())?;
        Ok(Decision::Continue)
    }
}

/// Terminates with a canned response
pub struct RespondStep {
    response: Response,
}

impl RespondStep {
    pub fn new(response: Response) -> Self {
        Self { response }
    }

    pub fn ok(body: &'static str) -> Self {
        Self::new(Response::ok(body))
    }

    pub fn descriptor(self, name: impl Into<String>) -> StepDescriptor {
        StepDescriptor::new(name, Arc::new(self))
    }
}

#[async_trait]
impl Step for RespondStep {
    async fn call(&self, _view: &mut StepView<'_>) -> FlowResult<Decision> {
        Ok(Decision::done(self.response.clone()))
    }
}

/// Terminates with a fixed failure
pub struct FailStep {
    error: Error,
}

impl FailStep {
    pub fn new(error: Error) -> Self {
        Self { error }
    }

    pub fn descriptor(self, name: impl Into<String>) -> StepDescriptor {
        StepDescriptor::new(name, Arc::new(self))
    }
}

#[async_trait]
impl Step for FailStep {
    async fn call(&self, _view: &mut StepView<'_>) -> FlowResult<Decision> {
        Ok(Decision::fail(self.error.clone()))
    }
}

/// Copies a path parameter into a text slot; missing → `InvalidInput`
pub struct ExtractParamStep {
    param: String,
    slot: SlotId,
}

impl ExtractParamStep {
    pub fn new(param: impl Into<String>, slot: SlotId) -> Self {
        Self {
            param: param.into(),
            slot,
        }
    }

    pub fn descriptor(self, name: impl Into<String>) -> StepDescriptor {
        let slot = self.slot;
        StepDescriptor::new(name, Arc::new(self)).writes([slot])
    }
}

#[async_trait]
impl Step for ExtractParamStep {
    async fn call(&self, view: &mut StepView<'_>) -> FlowResult<Decision> {
        match view.param(&self.param) {
            Some(value) => {
                let value = value.to_string();
                view.put(self.slot, value)?;
                Ok(Decision::Continue)
            }
            None => Ok(Decision::fail(Error::invalid_input(
                "param",
                self.param.clone(),
            ))),
        }
    }
}
