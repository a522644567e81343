//! Build-time pipeline validation.
//!
//! Routes are checked when the engine is built, before any request runs:
//!
//! - every slot a step reads must have a writer (step `put` or effect token)
//!   earlier in the pipeline; read-before-write is a build error, not a
//!   runtime surprise;
//! - two declared writers of the same single-write slot are rejected, across
//!   steps *and* effect tokens, including continuation steps;
//! - every declared slot must exist in the schema;
//! - a route with no steps can never produce a response and is rejected.
//!
//! Continuations run after the need that names them, so their reads are
//! checked against everything the pipeline can have written by then.
//! Continuations registered as mutually exclusive alternatives (same
//! exclusivity group) may declare the same slot writes: only one of them
//! runs per need, so the duplicate-writer check does not apply between
//! members of a group.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::router::{Route, RouterError};
use crate::slot::{SlotId, SlotSchema};
use crate::step::StepDescriptor;

/// Engine construction failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("route {route}: step {step} reads slot {slot} before any writer")]
    ReadBeforeWrite {
        route: String,
        step: String,
        slot: String,
    },
    #[error("route {route}: slot {slot} has two writers, {first} and {second}")]
    DuplicateWriter {
        route: String,
        slot: String,
        first: String,
        second: String,
    },
    #[error("route {route}: step {step} declares unknown slot {slot}")]
    UnknownSlot {
        route: String,
        step: String,
        slot: String,
    },
    #[error("route {route} has no steps")]
    EmptyPipeline { route: String },
}

/// Validate one route against the schema and the global before-steps
pub(crate) fn validate_route(
    schema: &SlotSchema,
    global_before: &[Arc<StepDescriptor>],
    route: &Route,
) -> Result<(), BuildError> {
    let route_name = format!("{} {}", route.method, route.pattern);
    if route.steps.is_empty() {
        return Err(BuildError::EmptyPipeline { route: route_name });
    }

    let sequence: Vec<&Arc<StepDescriptor>> = global_before
        .iter()
        .chain(route.before.iter())
        .chain(route.steps.iter())
        .collect();

    let mut available: HashSet<SlotId> = HashSet::new();
    // slot -> (first writer, its exclusivity group)
    let mut writers: HashMap<SlotId, (String, Option<String>)> = HashMap::new();

    let mut claim_writer =
        |slot: SlotId, step: &str, group: Option<&str>| -> Result<(), BuildError> {
            let multi = schema.def(slot).is_some_and(|d| d.multi_write);
            if let Some((first, first_group)) = writers.get(&slot) {
                // alternates in the same exclusive group never run together
                let exclusive_peers =
                    matches!((first_group.as_deref(), group), (Some(a), Some(b)) if a == b);
                if !multi && !exclusive_peers {
                    return Err(BuildError::DuplicateWriter {
                        route: route_name.clone(),
                        slot: schema.name(slot),
                        first: first.clone(),
                        second: step.to_string(),
                    });
                }
            } else {
                writers.insert(slot, (step.to_string(), group.map(str::to_string)));
            }
            Ok(())
        };

    for desc in &sequence {
        check_known(schema, &route_name, desc)?;
        for read in &desc.reads {
            if !available.contains(read) {
                return Err(BuildError::ReadBeforeWrite {
                    route: route_name.clone(),
                    step: desc.name.clone(),
                    slot: schema.name(*read),
                });
            }
        }
        for write in desc.writes.iter().chain(desc.effect_writes.iter()) {
            claim_writer(*write, &desc.name, None)?;
            available.insert(*write);
        }
    }

    // continuations may run after any prefix that issued a need, so their
    // reads are checked against the full write set
    for continuation in &route.continuations {
        let desc = &continuation.step;
        check_known(schema, &route_name, desc)?;
        for read in &desc.reads {
            if !available.contains(read) {
                return Err(BuildError::ReadBeforeWrite {
                    route: route_name.clone(),
                    step: desc.name.clone(),
                    slot: schema.name(*read),
                });
            }
        }
        for write in desc.writes.iter().chain(desc.effect_writes.iter()) {
            claim_writer(*write, &desc.name, continuation.group.as_deref())?;
        }
    }

    Ok(())
}

fn check_known(
    schema: &SlotSchema,
    route: &str,
    desc: &StepDescriptor,
) -> Result<(), BuildError> {
    for slot in desc
        .reads
        .iter()
        .chain(desc.writes.iter())
        .chain(desc.effect_writes.iter())
    {
        if schema.def(*slot).is_none() {
            return Err(BuildError::UnknownSlot {
                route: route.to_string(),
                step: desc.name.clone(),
                slot: slot.to_string(),
            });
        }
    }
    Ok(())
}
