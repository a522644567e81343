//! The step interpreter.
//!
//! Drives a request through its step sequence, converting each decision into
//! a state transition. One call to [`run_segment`] is one continuation job:
//! it executes steps until the pipeline terminates or suspends on a need,
//! which is the only suspension point the concurrency model allows.
//!
//! Anything a step does that is not an explicit decision (an `Err` return, a
//! panic) is captured and converted to `Fail(Internal)` with the underlying
//! reason in the error context.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use crate::context::RequestContext;
use crate::decision::{Decision, Need};
use crate::error::Error;
use crate::request::Response;
use crate::step::StepDescriptor;
use crate::trace::TraceEvent;
use crate::view::StepView;

/// How a segment of step execution ended
pub(crate) enum StepYield {
    Done(Response),
    Fail(Error),
    Need {
        need: Need,
        issued_by: String,
        /// Trace sequence of the issuing step
        sequence: u64,
    },
}

/// Run steps from `pos` until the pipeline terminates or suspends.
///
/// `pos` and `seq` are advanced in place so the caller can resume the walk
/// after a need settles. Walking past the last step without a terminal
/// decision is itself a failure: the pipeline produced no response.
pub(crate) async fn run_segment(
    ctx: &mut RequestContext,
    steps: &[Arc<StepDescriptor>],
    pos: &mut usize,
    seq: &mut u64,
) -> StepYield {
    loop {
        if ctx.is_cancelled() {
            return StepYield::Fail(cancel_error(ctx));
        }
        let Some(desc) = steps.get(*pos) else {
            return StepYield::Fail(Error::internal("pipeline", "no_response"));
        };

        let this_seq = *seq;
        *seq += 1;
        ctx.trace().record(TraceEvent::StepStart {
            request_id: ctx.request_id(),
            step_name: desc.name.clone(),
            sequence: this_seq,
            ts: Utc::now(),
        });

        let started = Instant::now();
        let desc = desc.clone();
        let decision = {
            let mut view = StepView::new(ctx, &desc);
            match AssertUnwindSafe(desc.step.call(&mut view))
                .catch_unwind()
                .await
            {
                Ok(Ok(decision)) => decision,
                Ok(Err(err)) => Decision::Fail(err),
                Err(panic) => Decision::Fail(Error::internal("step", panic_message(&panic))),
            }
        };

        ctx.trace().record(TraceEvent::StepEnd {
            request_id: ctx.request_id(),
            step_name: desc.name.clone(),
            sequence: this_seq,
            outcome: decision.outcome_str().to_string(),
            duration_ns: started.elapsed().as_nanos() as u64,
        });

        match decision {
            Decision::Continue => {
                *pos += 1;
            }
            Decision::Done(response) => return StepYield::Done(response),
            Decision::Fail(err) => return StepYield::Fail(err),
            Decision::Need(need) => {
                return StepYield::Need {
                    need,
                    issued_by: desc.name.clone(),
                    sequence: this_seq,
                };
            }
        }
    }
}

fn cancel_error(ctx: &RequestContext) -> Error {
    let key = match ctx.deadline() {
        Some(deadline) if Instant::now() >= deadline => "deadline",
        _ => "client",
    };
    Error::cancelled("request", key)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::context::CancelToken;
    use crate::request::{Method, Request};
    use crate::slot::{SlotId, SlotSchema, SlotType};
    use crate::step::StepDescriptor;
    use crate::trace::TraceRecorder;
    use uuid::Uuid;

    fn make_ctx() -> RequestContext {
        let schema = Arc::new(SlotSchema::new().slot(SlotId(0), "Out", SlotType::Text));
        RequestContext::new(
            Request::new(Method::Get, "/"),
            Vec::new(),
            schema,
            Arena::new(1024, 4096),
            None,
            TraceRecorder::new(Uuid::new_v4()),
            CancelToken::new(),
        )
        .unwrap()
    }

    fn descs(list: Vec<StepDescriptor>) -> Vec<Arc<StepDescriptor>> {
        list.into_iter().map(Arc::new).collect()
    }

    #[tokio::test]
    async fn test_continue_then_done() {
        let mut ctx = make_ctx();
        let steps = descs(vec![
            StepDescriptor::from_fn("first", |_| Ok(Decision::Continue)),
            StepDescriptor::from_fn("second", |_| {
                Ok(Decision::done(Response::ok("done")))
            }),
        ]);
        let (mut pos, mut seq) = (0, 0);
        match run_segment(&mut ctx, &steps, &mut pos, &mut seq).await {
            StepYield::Done(resp) => assert_eq!(resp.status, 200),
            _ => panic!("expected done"),
        }
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn test_falling_off_the_end_fails() {
        let mut ctx = make_ctx();
        let steps = descs(vec![StepDescriptor::from_fn("only", |_| {
            Ok(Decision::Continue)
        })]);
        let (mut pos, mut seq) = (0, 0);
        match run_segment(&mut ctx, &steps, &mut pos, &mut seq).await {
            StepYield::Fail(err) => {
                assert_eq!(err.what, "pipeline");
                assert_eq!(err.key, "no_response");
            }
            _ => panic!("expected fail"),
        }
    }

    #[tokio::test]
    async fn test_step_error_becomes_fail() {
        let mut ctx = make_ctx();
        let steps = descs(vec![StepDescriptor::from_fn("broken", |_| {
            Err(Error::invalid_input("body", "json"))
        })]);
        let (mut pos, mut seq) = (0, 0);
        match run_segment(&mut ctx, &steps, &mut pos, &mut seq).await {
            StepYield::Fail(err) => assert_eq!(err.what, "body"),
            _ => panic!("expected fail"),
        }
    }

    #[tokio::test]
    async fn test_panic_captured_as_internal() {
        let mut ctx = make_ctx();
        let steps = descs(vec![StepDescriptor::from_fn("bomb", |_| {
            panic!("boom");
        })]);
        let (mut pos, mut seq) = (0, 0);
        match run_segment(&mut ctx, &steps, &mut pos, &mut seq).await {
            StepYield::Fail(err) => {
                assert_eq!(err.kind, crate::error::ErrorKind::Internal);
                assert_eq!(err.what, "step");
                assert!(err.key.contains("boom"));
            }
            _ => panic!("expected fail"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_step() {
        let mut ctx = make_ctx();
        ctx.cancel_token().cancel();
        let steps = descs(vec![StepDescriptor::from_fn("never", |_| {
            panic!("should not run");
        })]);
        let (mut pos, mut seq) = (0, 0);
        match run_segment(&mut ctx, &steps, &mut pos, &mut seq).await {
            StepYield::Fail(err) => assert_eq!(err.kind, crate::error::ErrorKind::Cancelled),
            _ => panic!("expected fail"),
        }
        // the step never started
        assert_eq!(seq, 0);
    }

    #[tokio::test]
    async fn test_need_yields_with_issuer() {
        let mut ctx = make_ctx();
        let steps = descs(vec![
            StepDescriptor::from_fn("first", |_| Ok(Decision::Continue)),
            StepDescriptor::from_fn("load", |_| {
                Ok(Decision::need(
                    Need::resume_at("render")
                        .effect(crate::effect::Effect::db_get("ns", "k", SlotId(0)))
                        .build(),
                ))
            }),
        ]);
        let (mut pos, mut seq) = (0, 0);
        match run_segment(&mut ctx, &steps, &mut pos, &mut seq).await {
            StepYield::Need {
                issued_by,
                sequence,
                need,
            } => {
                assert_eq!(issued_by, "load");
                assert_eq!(sequence, 1);
                assert_eq!(need.resume, "render");
            }
            _ => panic!("expected need"),
        }
        // pos still points at the issuing step
        assert_eq!(pos, 1);
    }
}
