//! # Decisions
//!
//! A step returns exactly one of four decisions, and the interpreter is a
//! state machine over them:
//!
//! - [`Decision::Continue`]: advance to the next step
//! - [`Decision::Done`]: terminate with a response
//! - [`Decision::Fail`]: terminate through the error renderer
//! - [`Decision::Need`]: request effects and nominate a continuation step
//!
//! [`Need`] bundles the effects with a dispatch [`Mode`], a [`Join`] policy
//! deciding when the continuation may run, the continuation step name, and an
//! optional compensation list run in reverse order on later pipeline failure.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::effect::Effect;
use crate::error::Error;
use crate::request::Response;

/// Whether a need's effects run one-by-one or concurrently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Sequential,
    Parallel,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Sequential => "sequential",
            Mode::Parallel => "parallel",
        })
    }
}

/// When the continuation becomes runnable relative to effect completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Join {
    /// Every effect has finished, success or failure
    #[default]
    All,
    /// Every *required* effect has finished; optional stragglers detach
    AllRequired,
    /// The first completion, success or failure
    Any,
    /// The first success; all-failed falls back to the required rules
    FirstSuccess,
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Join::All => "all",
            Join::AllRequired => "all_required",
            Join::Any => "any",
            Join::FirstSuccess => "first_success",
        })
    }
}

/// A request for effects plus the continuation to run when they join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Need {
    pub effects: Vec<Effect>,
    pub mode: Mode,
    pub join: Join,
    /// Name of the continuation step
    pub resume: String,
    /// Undo effects, run in reverse declaration order on later failure
    pub compensations: Vec<Effect>,
}

impl Need {
    /// Start building a need that resumes at the named step
    pub fn resume_at(resume: impl Into<String>) -> NeedBuilder {
        NeedBuilder {
            need: Need {
                effects: Vec::new(),
                mode: Mode::default(),
                join: Join::default(),
                resume: resume.into(),
                compensations: Vec::new(),
            },
        }
    }
}

/// Fluent builder for [`Need`]
pub struct NeedBuilder {
    need: Need,
}

impl NeedBuilder {
    pub fn effect(mut self, effect: Effect) -> Self {
        self.need.effects.push(effect);
        self
    }

    pub fn effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.need.effects.extend(effects);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.need.mode = mode;
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.need.join = join;
        self
    }

    pub fn compensate(mut self, effect: Effect) -> Self {
        self.need.compensations.push(effect);
        self
    }

    pub fn build(self) -> Need {
        self.need
    }
}

/// The four-variant result of a step call
#[derive(Debug, Clone)]
pub enum Decision {
    /// Proceed to the next step in the pipeline
    Continue,
    /// Terminate successfully with this response
    Done(Response),
    /// Terminate through the error renderer
    Fail(Error),
    /// Dispatch effects, then resume at the named continuation
    Need(Need),
}

impl Decision {
    pub fn done(response: Response) -> Self {
        Decision::Done(response)
    }

    pub fn fail(error: Error) -> Self {
        Decision::Fail(error)
    }

    pub fn need(need: Need) -> Self {
        Decision::Need(need)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Decision::Done(_) | Decision::Fail(_))
    }

    /// Variant label used in `step_end` trace events
    pub fn outcome_str(&self) -> &'static str {
        match self {
            Decision::Continue => "continue",
            Decision::Done(_) => "done",
            Decision::Fail(_) => "fail",
            Decision::Need(_) => "need",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotId;

    #[test]
    fn test_need_builder() {
        let need = Need::resume_at("render")
            .effect(Effect::db_get("todos", "todo:1", SlotId(0)).with_required(true))
            .effect(Effect::http_get("https://example.com", SlotId(1)))
            .mode(Mode::Parallel)
            .join(Join::AllRequired)
            .compensate(Effect::compensate("undo_put", serde_json::json!({}), SlotId(2)))
            .build();

        assert_eq!(need.effects.len(), 2);
        assert_eq!(need.mode, Mode::Parallel);
        assert_eq!(need.join, Join::AllRequired);
        assert_eq!(need.resume, "render");
        assert_eq!(need.compensations.len(), 1);
    }

    #[test]
    fn test_defaults() {
        let need = Need::resume_at("next").build();
        assert_eq!(need.mode, Mode::Sequential);
        assert_eq!(need.join, Join::All);
        assert!(need.effects.is_empty());
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(Decision::Continue.outcome_str(), "continue");
        assert_eq!(
            Decision::fail(Error::internal("x", "y")).outcome_str(),
            "fail"
        );
    }

    #[test]
    fn test_join_display() {
        assert_eq!(Join::AllRequired.to_string(), "all_required");
        assert_eq!(Join::FirstSuccess.to_string(), "first_success");
        assert_eq!(Mode::Parallel.to_string(), "parallel");
    }
}
