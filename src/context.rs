//! # Request Context
//!
//! One [`RequestContext`] exists per request: the immutable request
//! attributes, the slot store, the arena accountant, the error state, exit
//! callbacks, the trace handle, and the cancellation token. It is created at
//! pipeline entry, owned exclusively by the interpreter for the request's
//! duration, and dropped after the response is written and every exit
//! callback has run.
//!
//! Nothing here is thread-local: continuations may hop workers, so the
//! context is passed explicitly to every step and effector call.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

use crate::arena::Arena;
use crate::effect::Effect;
use crate::error::{Error, FlowResult};
use crate::request::{Headers, Method, Request};
use crate::slot::{SlotError, SlotId, SlotSchema, SlotStore, SlotValue};
use crate::trace::{TraceEvent, TraceHandle};

/// Cooperative cancellation signal carried by every request.
///
/// Cloning is cheap; any clone can cancel, and all clones observe it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

type ExitCallback = Box<dyn FnOnce(&mut RequestContext) + Send + Sync>;

/// Per-request state, owned by the interpreter
pub struct RequestContext {
    request_id: Uuid,
    method: Method,
    path: String,
    headers: Headers,
    params: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Bytes,
    client_addr: String,
    deadline: Option<Instant>,
    schema: Arc<SlotSchema>,
    store: SlotStore,
    arena: Arena,
    last_error: Option<Error>,
    exit_callbacks: Vec<ExitCallback>,
    compensations: Vec<Effect>,
    trace: TraceHandle,
    cancel: CancelToken,
}

impl RequestContext {
    /// Build the context for one request.
    ///
    /// Charges the body against the arena up front; a body past the hard cap
    /// fails the request before any step runs.
    pub fn new(
        request: Request,
        params: Vec<(String, String)>,
        schema: Arc<SlotSchema>,
        arena: Arena,
        deadline: Option<Instant>,
        trace: TraceHandle,
        cancel: CancelToken,
    ) -> FlowResult<Self> {
        arena.charge(request.body.len())?;
        Ok(Self {
            request_id: trace.request_id(),
            method: request.method,
            path: request.path,
            headers: request.headers,
            params,
            query: request.query,
            body: request.body,
            client_addr: request.client_addr,
            deadline,
            schema,
            store: SlotStore::new(),
            arena,
            last_error: None,
            exit_callbacks: Vec::new(),
            compensations: Vec::new(),
            trace,
            cancel,
        })
    }

    // -- request attributes ------------------------------------------------

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Path parameter bound by the router
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Query parameter, as supplied by the wire collaborator
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn client_addr(&self) -> &str {
        &self.client_addr
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    // -- slots -------------------------------------------------------------

    pub fn schema(&self) -> &SlotSchema {
        &self.schema
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    /// Write a slot, charging the arena and emitting a `slot_write` event.
    ///
    /// `writer` names the step (or the step that issued the effect) for the
    /// trace.
    pub fn write_slot(&mut self, writer: &str, id: SlotId, value: SlotValue) -> FlowResult<()> {
        self.arena.charge(value.byte_len())?;
        match self.store.put(&self.schema, id, value) {
            Ok(replaced) => {
                if let Some(bytes) = replaced {
                    self.arena.discharge(bytes);
                }
                self.trace.record(TraceEvent::SlotWrite {
                    request_id: self.request_id,
                    step_name: writer.to_string(),
                    slot_id: id,
                    ts: Utc::now(),
                });
                Ok(())
            }
            Err(err) => Err(self.slot_error(err)),
        }
    }

    /// Required read; missing slots fail the pipeline with `InvalidInput`
    pub fn slot_required(&self, id: SlotId) -> FlowResult<&SlotValue> {
        match self.store.get_required(id) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.slot_error(err)),
        }
    }

    pub fn slot_optional(&self, id: SlotId) -> Option<&SlotValue> {
        self.store.get_optional(id)
    }

    fn slot_error(&self, err: SlotError) -> Error {
        match err {
            SlotError::DuplicateWrite(id) => Error::conflict("slot", self.schema.name(id)),
            SlotError::Missing(id) => Error::invalid_input("slot", self.schema.name(id)),
            SlotError::TypeMismatch { slot, .. } => Error::internal("slot", self.schema.name(slot)),
            SlotError::Unknown(id) => Error::internal("slot", id.to_string()),
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    // -- lifecycle ---------------------------------------------------------

    /// Register a teardown hook; hooks run in LIFO order at termination
    pub fn on_exit(&mut self, callback: impl FnOnce(&mut RequestContext) + Send + Sync + 'static) {
        self.exit_callbacks.push(Box::new(callback));
    }

    pub(crate) fn take_exit_callbacks(&mut self) -> Vec<ExitCallback> {
        std::mem::take(&mut self.exit_callbacks)
    }

    /// Record compensations from a completed need; run on later failure
    pub(crate) fn push_compensations(&mut self, effects: impl IntoIterator<Item = Effect>) {
        self.compensations.extend(effects);
    }

    pub(crate) fn take_compensations(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.compensations)
    }

    pub fn set_last_error(&mut self, error: Error) {
        self.last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    // -- cancellation ------------------------------------------------------

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// True once the token fired or the deadline passed
    pub fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub fn trace(&self) -> &TraceHandle {
        &self.trace
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("slots", &self.store.len())
            .field("arena_used", &self.arena.used())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotType;
    use crate::trace::TraceRecorder;

    fn make_ctx() -> RequestContext {
        let schema = Arc::new(
            SlotSchema::new()
                .slot(SlotId(0), "Payload", SlotType::Bytes)
                .slot(SlotId(1), "UserId", SlotType::Text),
        );
        let trace = TraceRecorder::new(Uuid::new_v4());
        let request = Request::new(Method::Get, "/todos/42")
            .with_body("hello")
            .with_query("verbose", "1");
        RequestContext::new(
            request,
            vec![("id".to_string(), "42".to_string())],
            schema,
            Arena::new(1024, 4096),
            None,
            trace,
            CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_attributes() {
        let ctx = make_ctx();
        assert_eq!(ctx.method(), Method::Get);
        assert_eq!(ctx.param("id"), Some("42"));
        assert_eq!(ctx.query_param("verbose"), Some("1"));
        assert_eq!(&ctx.body()[..], b"hello");
    }

    #[test]
    fn test_slot_write_emits_trace_event() {
        let mut ctx = make_ctx();
        ctx.write_slot("extract", SlotId(1), "u-1".into()).unwrap();
        assert!(ctx.trace().tags().contains('w'));
        assert_eq!(
            ctx.slot_required(SlotId(1)).unwrap().as_text(),
            Some("u-1")
        );
    }

    #[test]
    fn test_missing_required_slot_maps_to_invalid_input() {
        let ctx = make_ctx();
        let err = ctx.slot_required(SlotId(1)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
        assert_eq!(err.what, "slot");
        assert_eq!(err.key, "UserId");
    }

    #[test]
    fn test_duplicate_write_maps_to_conflict() {
        let mut ctx = make_ctx();
        ctx.write_slot("a", SlotId(1), "x".into()).unwrap();
        let err = ctx.write_slot("b", SlotId(1), "y".into()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_body_charged_against_arena() {
        let ctx = make_ctx();
        assert_eq!(ctx.arena().used(), 5);
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        handle.await.unwrap();
    }
}
