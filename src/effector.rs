//! # Effector Interfaces
//!
//! Effect handlers plug into the runtime through the adapter traits in this
//! module tree:
//!
//! - [`KvAdapter`]: key-value storage behind `db_get/put/del/scan`
//! - [`sql::SqlDriver`]: parameterized statements behind `db_query`
//! - [`http::HttpClient`]: outbound HTTP behind `http_get/post/call`
//! - [`compute::ComputeTask`]: named CPU tasks behind `compute_task` and
//!   `compensate`
//!
//! The [`EffectorRegistry`] is the dispatch table: it routes one effect
//! attempt to the right adapter and converts the adapter's result into the
//! slot value the coordinator binds. Retries, timeouts, and concurrency caps
//! are the coordinator's business, not the registry's.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::CancelToken;
use crate::effect::Effect;
use crate::error::{Error, FlowResult};
use crate::slot::SlotValue;

pub mod compute;
pub mod http;
pub mod memory;
pub mod sql;

use compute::ComputeRegistry;
use http::{HttpClient, HttpRequest};
use sql::SqlDriver;

/// Key-value storage adapter behind the `db_*` effect variants.
///
/// Write variants receive the effect's idempotency key and must deduplicate
/// server-side: a repeated key is acknowledged without re-applying the write.
#[async_trait]
pub trait KvAdapter: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> FlowResult<Option<Bytes>>;

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Bytes,
        idem: Option<&str>,
    ) -> FlowResult<()>;

    /// Returns whether the key existed
    async fn del(&self, namespace: &str, key: &str, idem: Option<&str>) -> FlowResult<bool>;

    /// Keys with the given prefix, in key order
    async fn scan(
        &self,
        namespace: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> FlowResult<Vec<(String, Bytes)>>;
}

/// Context handed to adapters for one effect attempt
#[derive(Debug, Clone)]
pub struct EffectorCx {
    pub request_id: Uuid,
    /// Sequence of the step that issued the need
    pub need_sequence: u64,
    pub cancel: CancelToken,
}

/// Dispatch table from effect variants to registered adapters
#[derive(Default)]
pub struct EffectorRegistry {
    kv: Option<Arc<dyn KvAdapter>>,
    sql: Option<Arc<dyn SqlDriver>>,
    http: Option<Arc<dyn HttpClient>>,
    compute: ComputeRegistry,
}

impl EffectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kv(mut self, adapter: Arc<dyn KvAdapter>) -> Self {
        self.kv = Some(adapter);
        self
    }

    pub fn with_sql(mut self, driver: Arc<dyn SqlDriver>) -> Self {
        self.sql = Some(driver);
        self
    }

    pub fn with_http(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    pub fn with_compute(mut self, registry: ComputeRegistry) -> Self {
        self.compute = registry;
        self
    }

    pub fn compute(&self) -> &ComputeRegistry {
        &self.compute
    }

    /// Perform one attempt of `effect`.
    ///
    /// `Ok(Some(value))` binds the value to the effect's token; `Ok(None)`
    /// is a success with nothing to bind (writes and deletes).
    pub async fn perform(
        &self,
        effect: &Effect,
        cx: &EffectorCx,
    ) -> FlowResult<Option<SlotValue>> {
        match effect {
            Effect::DbGet { namespace, key, .. } => {
                let kv = self.kv()?;
                match kv.get(namespace, key).await? {
                    Some(bytes) => Ok(Some(SlotValue::Bytes(bytes))),
                    None => Err(Error::not_found(namespace.clone(), key.clone())),
                }
            }
            Effect::DbPut {
                namespace,
                key,
                value,
                idem,
                ..
            } => {
                self.kv()?
                    .put(namespace, key, value.clone(), idem.as_deref())
                    .await?;
                Ok(None)
            }
            Effect::DbDel {
                namespace, key, idem, ..
            } => {
                let existed = self.kv()?.del(namespace, key, idem.as_deref()).await?;
                Ok(Some(SlotValue::Bool(existed)))
            }
            Effect::DbScan {
                namespace,
                prefix,
                limit,
                ..
            } => {
                let entries = self.kv()?.scan(namespace, prefix, *limit).await?;
                let rows: Vec<serde_json::Value> = entries
                    .into_iter()
                    .map(|(key, value)| {
                        json!({
                            "key": key,
                            "value": String::from_utf8_lossy(&value),
                        })
                    })
                    .collect();
                Ok(Some(SlotValue::Json(serde_json::Value::Array(rows))))
            }
            Effect::DbQuery { sql, params, .. } => {
                let driver = self
                    .sql
                    .as_ref()
                    .ok_or_else(|| Error::internal("effector", "sql"))?;
                let rows = driver.query(sql, params, &cx.cancel).await?;
                Ok(Some(SlotValue::Json(sql::rows_to_json(&rows))))
            }
            Effect::HttpGet { url, headers, .. } => {
                self.http_call(
                    HttpRequest::new(crate::request::Method::Get, url.clone())
                        .with_headers(headers.clone()),
                    cx,
                )
                .await
            }
            Effect::HttpPost {
                url,
                headers,
                body,
                idem,
                ..
            } => {
                self.http_call(
                    HttpRequest::new(crate::request::Method::Post, url.clone())
                        .with_headers(headers.clone())
                        .with_body(body.clone())
                        .with_idem(idem.clone()),
                    cx,
                )
                .await
            }
            Effect::HttpCall {
                method,
                url,
                headers,
                body,
                idem,
                ..
            } => {
                self.http_call(
                    HttpRequest::new(*method, url.clone())
                        .with_headers(headers.clone())
                        .with_body(body.clone())
                        .with_idem(idem.clone()),
                    cx,
                )
                .await
            }
            Effect::ComputeTask { task, input, .. } | Effect::Compensate { task, input, .. } => {
                let handler = self.compute.get(task)?;
                let value = handler.run(input.clone(), &cx.cancel).await?;
                Ok(Some(value))
            }
        }
    }

    fn kv(&self) -> FlowResult<&Arc<dyn KvAdapter>> {
        self.kv
            .as_ref()
            .ok_or_else(|| Error::internal("effector", "kv"))
    }

    async fn http_call(
        &self,
        request: HttpRequest,
        cx: &EffectorCx,
    ) -> FlowResult<Option<SlotValue>> {
        let client = self
            .http
            .as_ref()
            .ok_or_else(|| Error::internal("effector", "http"))?;
        let response = client.call(request, &cx.cancel).await?;
        if response.status >= 400 {
            return Err(http::status_error(response.status, &response));
        }
        Ok(Some(SlotValue::Bytes(response.body)))
    }
}
