//! Effect coordination: modes, join policies, retries, idempotency,
//! compensation, and runtime need validation.

use async_trait::async_trait;
use bytes::Bytes;
use pipeflow_rs::prelude::*;
use pipeflow_rs::{FnComputeTask, HttpClient, HttpRequest, HttpResponse};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const A: SlotId = SlotId(0);
const B: SlotId = SlotId(1);
const OUT: SlotId = SlotId(2);

/// Scripted upstream: URL → (status, body), recording calls and idem keys
#[derive(Default)]
struct ScriptedHttp {
    responses: HashMap<String, (u16, &'static str)>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedHttp {
    fn new() -> Self {
        Self::default()
    }

    fn respond(mut self, url: &str, status: u16, body: &'static str) -> Self {
        self.responses.insert(url.to_string(), (status, body));
        self
    }

    fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn call(
        &self,
        request: HttpRequest,
        _cancel: &CancelToken,
    ) -> pipeflow_rs::FlowResult<HttpResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((request.url.clone(), request.idem.clone()));
        let (status, body) = self
            .responses
            .get(&request.url)
            .copied()
            .unwrap_or((404, "missing"));
        Ok(HttpResponse {
            status,
            headers: Headers::new(),
            body: Bytes::from_static(body.as_bytes()),
        })
    }
}

fn two_slot_schema() -> SlotSchema {
    SlotSchema::new()
        .slot(A, "A", SlotType::Bytes)
        .slot(B, "B", SlotType::Bytes)
        .slot(OUT, "Out", SlotType::Int)
}

/// Step issuing a need over the given effects, resuming at `render`
fn need_step(effects: Vec<Effect>, mode: Mode, join: Join) -> StepDescriptor {
    StepDescriptor::from_fn("dispatch", move |_| {
        Ok(Decision::need(
            Need::resume_at("render")
                .effects(effects.clone())
                .mode(mode)
                .join(join)
                .build(),
        ))
    })
    .effects([A, B])
}

/// Continuation reporting which of A/B are set
fn render_step() -> StepDescriptor {
    StepDescriptor::from_fn("render", |view| {
        let a = view.optional(A)?.is_some();
        let b = view.optional(B)?.is_some();
        Ok(Decision::done(Response::ok(format!("a={a} b={b}"))))
    })
    .reads([A, B])
}

async fn run_join(
    http: Arc<ScriptedHttp>,
    effects: Vec<Effect>,
    mode: Mode,
    join: Join,
) -> Response {
    let engine = Engine::builder()
        .schema(two_slot_schema())
        .http(http)
        .route(
            Route::new(Method::Get, "/x")
                .step(need_step(effects, mode, join))
                .continuation(render_step()),
        )
        .build()
        .unwrap();
    engine.handle(Request::new(Method::Get, "/x")).await
}

#[tokio::test]
async fn test_parallel_all_required_failure_uses_declaration_order() {
    let http = Arc::new(
        ScriptedHttp::new()
            .respond("http://up/a", 503, "down")
            .respond("http://up/b", 500, "also down"),
    );
    let response = run_join(
        http,
        vec![
            Effect::http_get("http://up/a", A).with_required(true),
            Effect::http_get("http://up/b", B).with_required(true),
        ],
        Mode::Parallel,
        Join::All,
    )
    .await;
    assert_eq!(response.status, 502);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    // the first declared failure surfaces, not the second
    assert!(body["key"].as_str().unwrap().starts_with("503"));
}

#[tokio::test]
async fn test_all_join_with_optional_failure_continues() {
    let http = Arc::new(
        ScriptedHttp::new()
            .respond("http://up/a", 200, "profile")
            .respond("http://up/b", 500, "webhook down"),
    );
    let response = run_join(
        http,
        vec![
            Effect::http_get("http://up/a", A).with_required(true),
            Effect::http_get("http://up/b", B),
        ],
        Mode::Parallel,
        Join::All,
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"a=true b=false");
}

#[tokio::test]
async fn test_sequential_dispatch_order() {
    let http = Arc::new(
        ScriptedHttp::new()
            .respond("http://up/1", 200, "one")
            .respond("http://up/2", 200, "two"),
    );
    let response = run_join(
        http.clone(),
        vec![
            Effect::http_get("http://up/1", A),
            Effect::http_get("http://up/2", B),
        ],
        Mode::Sequential,
        Join::All,
    )
    .await;
    assert_eq!(response.status, 200);
    let calls: Vec<String> = http.calls().into_iter().map(|(url, _)| url).collect();
    assert_eq!(calls, vec!["http://up/1", "http://up/2"]);
}

#[tokio::test]
async fn test_any_resumes_on_first_completion_even_failure() {
    let http = Arc::new(
        ScriptedHttp::new()
            .respond("http://up/fast-fail", 500, "nope")
            .respond("http://up/slow-ok", 200, "late"),
    );
    let exporter = CollectingExporter::new();
    let engine = Engine::builder()
        .schema(two_slot_schema())
        .http(http)
        .exporter(exporter.clone())
        .route(
            Route::new(Method::Get, "/x")
                .step(need_step(
                    vec![
                        Effect::http_get("http://up/fast-fail", A),
                        Effect::http_get("http://up/slow-ok", B),
                    ],
                    Mode::Parallel,
                    Join::Any,
                ))
                .continuation(render_step()),
        )
        .build()
        .unwrap();
    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    // first completion was an optional failure: continuation runs, nothing bound
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"a=false b=false");

    let resumes = exporter
        .last()
        .iter()
        .filter(|e| matches!(e, TraceEvent::ContinuationResume { .. }))
        .count();
    assert_eq!(resumes, 1);
}

#[tokio::test]
async fn test_first_success_binds_only_the_winner() {
    let http = Arc::new(
        ScriptedHttp::new()
            .respond("http://up/a", 200, "winner")
            .respond("http://up/b", 200, "runner-up"),
    );
    let response = run_join(
        http,
        vec![
            Effect::http_get("http://up/a", A),
            Effect::http_get("http://up/b", B),
        ],
        Mode::Sequential,
        Join::FirstSuccess,
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"a=true b=false");
}

#[tokio::test]
async fn test_first_success_all_fail_optional_continues_unset() {
    let http = Arc::new(
        ScriptedHttp::new()
            .respond("http://up/a", 500, "x")
            .respond("http://up/b", 500, "y"),
    );
    let response = run_join(
        http,
        vec![
            Effect::http_get("http://up/a", A),
            Effect::http_get("http://up/b", B),
        ],
        Mode::Parallel,
        Join::FirstSuccess,
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"a=false b=false");
}

#[tokio::test]
async fn test_first_success_all_fail_required_fails() {
    let http = Arc::new(
        ScriptedHttp::new()
            .respond("http://up/a", 503, "x")
            .respond("http://up/b", 503, "y"),
    );
    let response = run_join(
        http,
        vec![
            Effect::http_get("http://up/a", A).with_required(true),
            Effect::http_get("http://up/b", B),
        ],
        Mode::Parallel,
        Join::FirstSuccess,
    )
    .await;
    assert_eq!(response.status, 502);
}

#[tokio::test]
async fn test_retries_reissue_with_same_idem_key() {
    let http = Arc::new(ScriptedHttp::new().respond("http://up/hook", 500, "flaky"));
    let engine = Engine::builder()
        .schema(two_slot_schema())
        .http(http.clone())
        .route(
            Route::new(Method::Post, "/x")
                .step(need_step(
                    vec![
                        Effect::http_post("http://up/hook", "payload", A)
                            .with_required(true)
                            .with_idem("hook-42")
                            .with_retry(RetryPolicy::constant(2, 0)),
                    ],
                    Mode::Sequential,
                    Join::All,
                ))
                .continuation(render_step()),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Post, "/x")).await;
    assert_eq!(response.status, 502);

    let calls = http.calls();
    // 1 + max_attempts total attempts, same key on every one
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|(_, idem)| idem.as_deref() == Some("hook-42")));
}

#[tokio::test]
async fn test_zero_effect_need_rejected() {
    let engine = Engine::builder()
        .schema(two_slot_schema())
        .route(
            Route::new(Method::Get, "/x")
                .step(need_step(vec![], Mode::Sequential, Join::All))
                .continuation(render_step()),
        )
        .build()
        .unwrap();
    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    assert_eq!(response.status, 400);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["what"], "need");
    assert_eq!(body["key"], "empty");
}

#[tokio::test]
async fn test_compute_effect_binds_result() {
    let engine = Engine::builder()
        .schema(two_slot_schema())
        .compute_task(
            "double",
            Arc::new(FnComputeTask::new(|input, _| async move {
                Ok(SlotValue::Int(input.as_i64().unwrap_or(0) * 2))
            })),
        )
        .route(
            Route::new(Method::Get, "/x")
                .step(
                    StepDescriptor::from_fn("dispatch", |_| {
                        Ok(Decision::need(
                            Need::resume_at("render")
                                .effect(
                                    Effect::compute("double", json!(21), OUT).with_required(true),
                                )
                                .build(),
                        ))
                    })
                    .effects([OUT]),
                )
                .continuation(
                    StepDescriptor::from_fn("render", |view| {
                        let n = view.require(OUT)?.as_int().unwrap_or(0);
                        Ok(Decision::done(Response::ok(n.to_string())))
                    })
                    .reads([OUT]),
                ),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"42");
}

#[tokio::test]
async fn test_compensations_run_in_reverse_on_later_failure() {
    let undone: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (u1, u2) = (undone.clone(), undone.clone());

    let kv = Arc::new(MemoryKv::new());
    let engine = Engine::builder()
        .schema(two_slot_schema())
        .kv(kv)
        .compute_task(
            "undo_first",
            Arc::new(FnComputeTask::new(move |_, _| {
                let undone = u1.clone();
                async move {
                    undone.lock().unwrap().push("undo_first".into());
                    Ok(SlotValue::Bool(true))
                }
            })),
        )
        .compute_task(
            "undo_second",
            Arc::new(FnComputeTask::new(move |_, _| {
                let undone = u2.clone();
                async move {
                    undone.lock().unwrap().push("undo_second".into());
                    Ok(SlotValue::Bool(true))
                }
            })),
        )
        .route(
            Route::new(Method::Post, "/x")
                .step(
                    StepDescriptor::from_fn("write_both", |_| {
                        Ok(Decision::need(
                            Need::resume_at("verify")
                                .effect(Effect::db_put("ns", "k1", "v1", A).with_required(true))
                                .effect(Effect::db_put("ns", "k2", "v2", B).with_required(true))
                                .compensate(Effect::compensate("undo_first", json!({}), A))
                                .compensate(Effect::compensate("undo_second", json!({}), B))
                                .build(),
                        ))
                    })
                    .effects([A, B]),
                )
                .continuation(StepDescriptor::from_fn("verify", |_| {
                    Ok(Decision::fail(Error::conflict("todo", "stale")))
                })),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Post, "/x")).await;
    assert_eq!(response.status, 409);
    // reverse declaration order
    assert_eq!(*undone.lock().unwrap(), vec!["undo_second", "undo_first"]);
}

#[tokio::test]
async fn test_db_get_roundtrip_through_need() {
    let kv = Arc::new(MemoryKv::new());
    kv.seed("todos", "todo:7", "payload-7");
    let engine = Engine::builder()
        .schema(two_slot_schema())
        .kv(kv)
        .route(
            Route::new(Method::Get, "/todos/:id")
                .step(
                    StepDescriptor::from_fn("load", |view| {
                        let id = view.param("id").unwrap_or_default();
                        Ok(Decision::need(
                            Need::resume_at("render")
                                .effect(
                                    Effect::db_get("todos", format!("todo:{id}"), A)
                                        .with_required(true),
                                )
                                .build(),
                        ))
                    })
                    .effects([A]),
                )
                .continuation(
                    StepDescriptor::from_fn("render", |view| {
                        let body = view.require_bytes(A)?.clone();
                        Ok(Decision::done(Response::ok(body)))
                    })
                    .reads([A]),
                ),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/todos/7")).await;
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"payload-7");
}

/// Canned SQL driver recording statements and bound parameters
#[derive(Default)]
struct FakeSql {
    rows: Vec<pipeflow_rs::SqlRow>,
    statements: Mutex<Vec<(String, Vec<pipeflow_rs::SqlValue>)>>,
}

#[async_trait]
impl pipeflow_rs::SqlDriver for FakeSql {
    async fn query(
        &self,
        sql: &str,
        params: &[pipeflow_rs::SqlValue],
        _cancel: &CancelToken,
    ) -> pipeflow_rs::FlowResult<Vec<pipeflow_rs::SqlRow>> {
        self.statements
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        Ok(self.rows.clone())
    }
}

#[tokio::test]
async fn test_db_query_binds_typed_rows() {
    use pipeflow_rs::{SqlRow, SqlValue};

    let sql = Arc::new(FakeSql {
        rows: vec![SqlRow::new(vec![
            SqlValue::Int(42),
            SqlValue::Text("buy milk".into()),
        ])],
        statements: Mutex::new(Vec::new()),
    });
    let engine = Engine::builder()
        .schema(SlotSchema::new().slot(OUT, "Rows", SlotType::Json))
        .sql(sql.clone())
        .route(
            Route::new(Method::Get, "/todos")
                .step(
                    StepDescriptor::from_fn("query", |_| {
                        Ok(Decision::need(
                            Need::resume_at("render")
                                .effect(
                                    Effect::db_query(
                                        "select id, title from todos where id = ?",
                                        vec![SqlValue::Int(42)],
                                        OUT,
                                    )
                                    .with_required(true),
                                )
                                .build(),
                        ))
                    })
                    .effects([OUT]),
                )
                .continuation(
                    StepDescriptor::from_fn("render", |view| {
                        let rows = view.require_json(OUT)?;
                        let title = rows[0][1]["value"].as_str().unwrap_or_default().to_string();
                        Ok(Decision::done(Response::ok(title)))
                    })
                    .reads([OUT]),
                ),
        )
        .build()
        .unwrap();

    let response = engine.handle(Request::new(Method::Get, "/todos")).await;
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"buy milk");

    let statements = sql.statements.lock().unwrap().clone();
    assert_eq!(statements.len(), 1);
    assert_eq!(statements[0].1, vec![SqlValue::Int(42)]);
}

#[tokio::test]
async fn test_unknown_continuation_is_internal() {
    let engine = Engine::builder()
        .schema(two_slot_schema())
        .http(Arc::new(ScriptedHttp::new().respond("http://up/a", 200, "x")))
        .route(
            Route::new(Method::Get, "/x").step(
                StepDescriptor::from_fn("dispatch", |_| {
                    Ok(Decision::need(
                        Need::resume_at("nowhere")
                            .effect(Effect::http_get("http://up/a", A))
                            .build(),
                    ))
                })
                .effects([A]),
            ),
        )
        .build()
        .unwrap();
    let response = engine.handle(Request::new(Method::Get, "/x")).await;
    assert_eq!(response.status, 500);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["what"], "continuation");
    assert_eq!(body["key"], "nowhere");
}
