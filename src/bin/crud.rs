//! Minimal CRUD service over the in-memory KV adapter.
//!
//! ```bash
//! cargo run --bin crud
//! ```

use pipeflow_rs::prelude::*;
use std::sync::Arc;

const ID: SlotId = SlotId(0);
const TODO_ITEM: SlotId = SlotId(1);
const RECEIPT: SlotId = SlotId(2);

fn extract_id() -> StepDescriptor {
    StepDescriptor::from_fn("extract_id", |view| {
        match view.param("id") {
            Some(id) => {
                let id = id.to_string();
                view.put(ID, id)?;
                Ok(Decision::Continue)
            }
            None => Ok(Decision::fail(Error::invalid_input("param", "id"))),
        }
    })
    .writes([ID])
}

#[tokio::main]
async fn main() -> Result<(), pipeflow_rs::BuildError> {
    let kv = Arc::new(MemoryKv::new());
    kv.seed("todo", "1", r#"{"id":"1","title":"write the demo"}"#);

    let engine = Engine::builder()
        .schema(
            SlotSchema::new()
                .slot(ID, "Id", SlotType::Text)
                .slot(TODO_ITEM, "TodoItem", SlotType::Bytes)
                .slot(RECEIPT, "Receipt", SlotType::Bool),
        )
        .kv(kv)
        .route(
            Route::new(Method::Get, "/todos/:id")
                .step(extract_id())
                .step(
                    StepDescriptor::from_fn("load", |view| {
                        let id = view.require_text(ID)?.to_string();
                        Ok(Decision::need(
                            Need::resume_at("render")
                                .effect(Effect::db_get("todo", id, TODO_ITEM).with_required(true))
                                .build(),
                        ))
                    })
                    .reads([ID])
                    .effects([TODO_ITEM]),
                )
                .continuation(
                    StepDescriptor::from_fn("render", |view| {
                        let body = view.require_bytes(TODO_ITEM)?.clone();
                        Ok(Decision::done(
                            Response::new(200)
                                .with_header("content-type", "application/json")
                                .with_body(body),
                        ))
                    })
                    .reads([TODO_ITEM]),
                ),
        )
        .route(
            Route::new(Method::Put, "/todos/:id")
                .step(extract_id())
                .step(
                    StepDescriptor::from_fn("store", |view| {
                        let id = view.require_text(ID)?.to_string();
                        let body = view.body().clone();
                        Ok(Decision::need(
                            Need::resume_at("created")
                                .effect(
                                    Effect::db_put("todo", id.clone(), body, RECEIPT)
                                        .with_required(true)
                                        .with_idem(format!("put-{id}")),
                                )
                                .build(),
                        ))
                    })
                    .reads([ID])
                    .effects([RECEIPT]),
                )
                .continuation(StepDescriptor::from_fn("created", |_| {
                    Ok(Decision::done(Response::new(201)))
                })),
        )
        .build()?;

    let response = engine.handle(Request::new(Method::Get, "/todos/1")).await;
    println!("GET /todos/1 -> {} {:?}", response.status, response.body);

    let response = engine
        .handle(
            Request::new(Method::Put, "/todos/2").with_body(r#"{"id":"2","title":"ship it"}"#),
        )
        .await;
    println!("PUT /todos/2 -> {}", response.status);

    let response = engine.handle(Request::new(Method::Get, "/todos/2")).await;
    println!("GET /todos/2 -> {} {:?}", response.status, response.body);

    let response = engine.handle(Request::new(Method::Get, "/todos/404")).await;
    println!("GET /todos/404 -> {} {:?}", response.status, response.body);

    Ok(())
}
