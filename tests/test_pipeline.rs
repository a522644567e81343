//! Engine-level pipeline interpreter behavior: step ordering, terminal
//! decisions, exit callbacks, and error rendering.

use pipeflow_rs::prelude::*;
use std::sync::{Arc, Mutex};

fn recorder_step(name: &str, log: &Arc<Mutex<Vec<String>>>) -> StepDescriptor {
    let log = log.clone();
    let tag = name.to_string();
    StepDescriptor::from_fn(name, move |_| {
        log.lock().unwrap().push(tag.clone());
        Ok(Decision::Continue)
    })
}

#[tokio::test]
async fn test_global_before_route_before_steps_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::builder()
        .global_before(recorder_step("global", &log))
        .route(
            Route::new(Method::Get, "/x")
                .before(recorder_step("route_before", &log))
                .step(recorder_step("main", &log))
                .step(StepDescriptor::from_fn("respond", |_| {
                    Ok(Decision::done(Response::ok("done")))
                })),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    assert_eq!(response.status, 200);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["global", "route_before", "main"]
    );
}

#[tokio::test]
async fn test_exit_callbacks_run_lifo() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let (a, b) = (order.clone(), order.clone());
    let engine = Engine::builder()
        .route(
            Route::new(Method::Get, "/x").step(StepDescriptor::from_fn("respond", move |view| {
                let (a, b) = (a.clone(), b.clone());
                view.on_exit(move |_| a.lock().unwrap().push("first"));
                view.on_exit(move |_| b.lock().unwrap().push("second"));
                Ok(Decision::done(Response::ok("ok")))
            })),
        )
        .build()
        .unwrap();

    engine.handle(Request::new(Method::Get, "/x")).await;
    // registered first, runs last
    assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
}

#[tokio::test]
async fn test_exit_callbacks_run_on_failure_too() {
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    let engine = Engine::builder()
        .route(
            Route::new(Method::Get, "/x").step(StepDescriptor::from_fn("failing", move |view| {
                let flag = flag.clone();
                view.on_exit(move |_| *flag.lock().unwrap() = true);
                Ok(Decision::fail(Error::forbidden("user", "anonymous")))
            })),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    assert_eq!(response.status, 403);
    assert!(*ran.lock().unwrap());
}

#[tokio::test]
async fn test_fail_renders_structured_body() {
    let engine = Engine::builder()
        .route(
            Route::new(Method::Get, "/todos/:id").step(StepDescriptor::from_fn("lookup", |view| {
                let id = view.param("id").unwrap_or_default().to_string();
                Ok(Decision::fail(Error::not_found("todo", id)))
            })),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/todos/42")).await;
    assert_eq!(response.status, 404);
    assert_eq!(response.headers.get("content-type"), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["what"], "todo");
    assert_eq!(body["key"], "42");
}

#[tokio::test]
async fn test_panic_becomes_internal_500() {
    let engine = Engine::builder()
        .route(
            Route::new(Method::Get, "/x")
                .step(StepDescriptor::from_fn("bomb", |_| panic!("kaboom"))),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    assert_eq!(response.status, 500);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["error"], "internal");
    assert_eq!(body["what"], "step");
}

#[tokio::test]
async fn test_no_terminal_decision_is_internal() {
    let engine = Engine::builder()
        .route(
            Route::new(Method::Get, "/x")
                .step(StepDescriptor::from_fn("drifter", |_| Ok(Decision::Continue))),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    assert_eq!(response.status, 500);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["what"], "pipeline");
    assert_eq!(body["key"], "no_response");
}

#[tokio::test]
async fn test_missing_required_slot_is_invalid_input() {
    const DATA: SlotId = SlotId(0);
    let engine = Engine::builder()
        .schema(SlotSchema::new().slot(DATA, "Data", SlotType::Text))
        .route(
            Route::new(Method::Get, "/x")
                // declared writer never actually writes
                .step(StepDescriptor::from_fn("skips_write", |_| Ok(Decision::Continue)).writes([DATA]))
                .step(
                    StepDescriptor::from_fn("reader", |view| {
                        let text = view.require_text(DATA)?.to_string();
                        Ok(Decision::done(Response::ok(text)))
                    })
                    .reads([DATA]),
                ),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    assert_eq!(response.status, 400);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["what"], "slot");
    assert_eq!(body["key"], "Data");
}

#[tokio::test]
async fn test_build_rejects_read_before_write() {
    const DATA: SlotId = SlotId(0);
    let result = Engine::builder()
        .schema(SlotSchema::new().slot(DATA, "Data", SlotType::Text))
        .route(
            Route::new(Method::Get, "/x").step(
                StepDescriptor::from_fn("reader", |_| Ok(Decision::Continue)).reads([DATA]),
            ),
        )
        .build();
    let err = result.unwrap_err();
    assert!(err.to_string().contains("reader"));
    assert!(err.to_string().contains("Data"));
}

#[tokio::test]
async fn test_build_rejects_duplicate_writers() {
    const DATA: SlotId = SlotId(0);
    let result = Engine::builder()
        .schema(SlotSchema::new().slot(DATA, "Data", SlotType::Text))
        .route(
            Route::new(Method::Get, "/x")
                .step(StepDescriptor::from_fn("w1", |_| Ok(Decision::Continue)).writes([DATA]))
                .step(StepDescriptor::from_fn("w2", |_| Ok(Decision::Continue)).writes([DATA])),
        )
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_route_params_reach_steps() {
    let engine = Engine::builder()
        .route(
            Route::new(Method::Get, "/todos/:id/items/:item").step(StepDescriptor::from_fn(
                "echo",
                |view| {
                    let id = view.param("id").unwrap_or_default();
                    let item = view.param("item").unwrap_or_default();
                    Ok(Decision::done(Response::ok(format!("{id}/{item}"))))
                },
            )),
        )
        .build()
        .unwrap();

    let response = engine
        .handle(Request::new(Method::Get, "/todos/42/items/7"))
        .await;
    assert_eq!(&response.body[..], b"42/7");
}

#[tokio::test]
async fn test_precedence_through_engine() {
    let engine = Engine::builder()
        .route(
            Route::new(Method::Get, "/todos/:id").step(StepDescriptor::from_fn("param", |_| {
                Ok(Decision::done(Response::ok("param")))
            })),
        )
        .route(
            Route::new(Method::Get, "/todos/special").step(StepDescriptor::from_fn(
                "literal",
                |_| Ok(Decision::done(Response::ok("literal"))),
            )),
        )
        .build()
        .unwrap();

    let response = engine
        .handle(Request::new(Method::Get, "/todos/special"))
        .await;
    assert_eq!(&response.body[..], b"literal");
    let response = engine.handle(Request::new(Method::Get, "/todos/42")).await;
    assert_eq!(&response.body[..], b"param");
}

#[tokio::test]
async fn test_exclusive_continuations_branch_at_runtime() {
    const RAW: SlotId = SlotId(0);
    const OUT: SlotId = SlotId(1);

    let kv = Arc::new(MemoryKv::new());
    kv.seed("cache", "profile", "cached-bytes");
    // both alternates write OUT; only one runs per request, picked by the
    // issuing step's resume target
    let engine = Engine::builder()
        .schema(
            SlotSchema::new()
                .slot(RAW, "Raw", SlotType::Bytes)
                .slot(OUT, "Out", SlotType::Text),
        )
        .kv(kv)
        .route(
            Route::new(Method::Get, "/lookup")
                .step(
                    StepDescriptor::from_fn("check", |view| {
                        let resume = if view.query_param("fresh").is_some() {
                            "cache_miss"
                        } else {
                            "cache_hit"
                        };
                        Ok(Decision::need(
                            Need::resume_at(resume)
                                .effect(
                                    Effect::db_get("cache", "profile", RAW).with_required(true),
                                )
                                .build(),
                        ))
                    })
                    .effects([RAW]),
                )
                .exclusive_continuation(
                    "lookup",
                    StepDescriptor::from_fn("cache_hit", |view| {
                        let raw = view.require_bytes(RAW)?.clone();
                        let body = format!("hit:{}", String::from_utf8_lossy(&raw));
                        view.put(OUT, body.clone())?;
                        Ok(Decision::done(Response::ok(body)))
                    })
                    .reads([RAW])
                    .writes([OUT]),
                )
                .exclusive_continuation(
                    "lookup",
                    StepDescriptor::from_fn("cache_miss", |view| {
                        let raw = view.require_bytes(RAW)?.clone();
                        let body = format!("miss:{}", String::from_utf8_lossy(&raw));
                        view.put(OUT, body.clone())?;
                        Ok(Decision::done(Response::ok(body)))
                    })
                    .reads([RAW])
                    .writes([OUT]),
                ),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/lookup")).await;
    assert_eq!(&response.body[..], b"hit:cached-bytes");

    let response = engine
        .handle(Request::new(Method::Get, "/lookup").with_query("fresh", "1"))
        .await;
    assert_eq!(&response.body[..], b"miss:cached-bytes");
}

#[tokio::test]
async fn test_body_over_arena_hard_cap_fails() {
    let config: RuntimeConfig = serde_json::from_str(
        r#"{"arena": {"soft_cap_bytes": 8, "hard_cap_bytes": 16}}"#,
    )
    .unwrap();
    let engine = Engine::builder()
        .config(config)
        .route(
            Route::new(Method::Post, "/x").step(StepDescriptor::from_fn("ok", |_| {
                Ok(Decision::done(Response::ok("ok")))
            })),
        )
        .build()
        .unwrap();

    let response = engine
        .handle(Request::new(Method::Post, "/x").with_body(vec![0u8; 64]))
        .await;
    assert_eq!(response.status, 500);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["what"], "arena");

    // a small body passes
    let response = engine
        .handle(Request::new(Method::Post, "/x").with_body("tiny"))
        .await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_step_error_return_fails_pipeline() {
    let engine = Engine::builder()
        .route(
            Route::new(Method::Post, "/x").step(StepDescriptor::from_fn("parse", |view| {
                if view.body().is_empty() {
                    return Err(Error::invalid_input("body", "empty"));
                }
                Ok(Decision::done(Response::ok("parsed")))
            })),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Post, "/x")).await;
    assert_eq!(response.status, 400);

    let response = engine
        .handle(Request::new(Method::Post, "/x").with_body("data"))
        .await;
    assert_eq!(response.status, 200);
}
