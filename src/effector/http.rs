//! Outbound HTTP client adapter behind the `http_*` effects.
//!
//! The trait is transport-agnostic; [`ReqwestClient`] (feature `http-client`)
//! is the production implementation. Idempotency keys travel as an
//! `idempotency-key` header. Non-2xx statuses are converted to typed errors
//! by the registry so the join rules see a plain failure.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::context::CancelToken;
use crate::error::{Error, ErrorKind, FlowResult};
use crate::request::{Headers, Method};

/// One outbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    /// Per-attempt budget, enforced by the client where supported
    pub timeout: Option<Duration>,
    pub idem: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            timeout: None,
            idem: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_idem(mut self, idem: Option<String>) -> Self {
        self.idem = idem;
        self
    }
}

/// One upstream response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

/// Outbound HTTP contract
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn call(&self, request: HttpRequest, cancel: &CancelToken) -> FlowResult<HttpResponse>;
}

/// Map an upstream error status to the error taxonomy
pub fn status_error(status: u16, response: &HttpResponse) -> Error {
    let kind = match status {
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        429 => ErrorKind::TooManyRequests,
        400..=499 => ErrorKind::InvalidInput,
        _ => ErrorKind::UpstreamUnavailable,
    };
    let detail = String::from_utf8_lossy(&response.body);
    Error::new(
        kind,
        "http",
        format!("{status}:{}", detail.chars().take(120).collect::<String>()),
    )
}

/// Production client over reqwest
#[cfg(feature = "http-client")]
pub struct ReqwestClient {
    client: reqwest::Client,
}

#[cfg(feature = "http-client")]
impl ReqwestClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "http-client")]
impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl HttpClient for ReqwestClient {
    async fn call(&self, request: HttpRequest, cancel: &CancelToken) -> FlowResult<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|_| Error::invalid_input("method", request.method.as_str()))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(idem) = &request.idem {
            builder = builder.header("idempotency-key", idem);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let send = builder.send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled("http", request.url.clone())),
            result = send => result.map_err(|err| {
                if err.is_timeout() {
                    Error::timeout("http", request.url.clone())
                } else {
                    Error::upstream_unavailable("http", err.to_string())
                }
            })?,
        };

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| Error::upstream_unavailable("http", err.to_string()))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(status: u16, body: &'static str) -> HttpResponse {
        HttpResponse {
            status,
            headers: Headers::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn test_status_error_mapping() {
        assert_eq!(status_error(404, &resp(404, "")).kind, ErrorKind::NotFound);
        assert_eq!(
            status_error(429, &resp(429, "")).kind,
            ErrorKind::TooManyRequests
        );
        assert_eq!(
            status_error(503, &resp(503, "")).kind,
            ErrorKind::UpstreamUnavailable
        );
        assert_eq!(
            status_error(422, &resp(422, "")).kind,
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_status_error_carries_detail() {
        let err = status_error(502, &resp(502, "bad gateway"));
        assert!(err.key.starts_with("502:"));
        assert!(err.key.contains("bad gateway"));
    }
}
