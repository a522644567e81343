//! Pipeline assembly: build-time validation and the step interpreter.

mod interpreter;
mod validate;

pub use validate::BuildError;

pub(crate) use interpreter::{StepYield, run_segment};
pub(crate) use validate::validate_route;
