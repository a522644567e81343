//! Prints the exported span tree for one traced request.
//!
//! ```bash
//! cargo run --bin span_tree
//! ```

use pipeflow_rs::prelude::*;
use pipeflow_rs::{PromotionThresholds, SpanNode, build_span_tree};
use std::sync::Arc;

const TODO_ITEM: SlotId = SlotId(0);

fn print_span(span: &SpanNode, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}{:?} {} ({}us) {}",
        span.kind,
        span.name,
        span.duration_ns / 1_000,
        span.notes.join(" ")
    );
    for child in &span.children {
        print_span(child, depth + 1);
    }
}

#[tokio::main]
async fn main() -> Result<(), pipeflow_rs::BuildError> {
    let kv = Arc::new(MemoryKv::new());
    kv.seed("todo", "7", r#"{"id":"7"}"#);
    let exporter = CollectingExporter::new();

    let engine = Engine::builder()
        .schema(SlotSchema::new().slot(TODO_ITEM, "TodoItem", SlotType::Bytes))
        .kv(kv)
        .exporter(exporter.clone())
        .route(
            Route::new(Method::Get, "/todos/:id")
                .step(
                    StepDescriptor::from_fn("load", |view| {
                        let id = view.param("id").unwrap_or_default().to_string();
                        Ok(Decision::need(
                            Need::resume_at("render")
                                .effect(Effect::db_get("todo", id, TODO_ITEM).with_required(true))
                                .build(),
                        ))
                    })
                    .effects([TODO_ITEM]),
                )
                .continuation(
                    StepDescriptor::from_fn("render", |view| {
                        let body = view.require_bytes(TODO_ITEM)?.clone();
                        Ok(Decision::done(Response::ok(body)))
                    })
                    .reads([TODO_ITEM]),
                ),
        )
        .build()?;

    let response = engine.handle(Request::new(Method::Get, "/todos/7")).await;
    println!("status: {}\n", response.status);

    let events = exporter.last();
    println!("timeline ({} events):", events.len());
    for event in &events {
        println!("  {}", serde_json::to_string(event).unwrap_or_default());
    }

    // promote every job so the full tree is visible
    let tree = build_span_tree(
        &events,
        PromotionThresholds {
            queue_wait_ns: 0,
            run_active_ns: 0,
        },
    )
    .expect("timeline has a request span");
    println!("\nspan tree:");
    print_span(&tree, 0);

    Ok(())
}
