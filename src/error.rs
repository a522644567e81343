//! # Error Taxonomy
//!
//! Every failure the runtime can surface to a caller is an [`Error`]: a closed
//! [`ErrorKind`] plus a `{what, key}` context pair naming the thing that failed
//! and the identifier involved. Kinds map canonically to HTTP status codes, so
//! the error renderer never has to guess.
//!
//! Steps signal failure by returning `Decision::Fail(error)` (or an `Err` from
//! their call, which the interpreter converts). Infrastructure failures such as
//! queue overflow, arena overflow, and cancellation use the same type so the trace and
//! the response agree on what happened.

use serde::{Deserialize, Serialize};

/// Result type alias for runtime operations
pub type FlowResult<T> = Result<T, Error>;

/// The closed set of failure categories the runtime recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request or a slot access was malformed
    InvalidInput,
    /// Authentication is missing or invalid
    Unauthorized,
    /// Authenticated but not allowed
    Forbidden,
    /// The addressed entity does not exist
    NotFound,
    /// A write conflicted with existing state (includes duplicate slot writes)
    Conflict,
    /// Backpressure: a queue or concurrency bound was exceeded
    TooManyRequests,
    /// An upstream collaborator failed or refused
    UpstreamUnavailable,
    /// A per-attempt, per-effect, or per-request deadline expired
    Timeout,
    /// The request was cancelled (client disconnect or deadline)
    Cancelled,
    /// Anything the runtime cannot classify
    Internal,
}

impl ErrorKind {
    /// Canonical HTTP status code for this kind
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::UpstreamUnavailable => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Cancelled => 499,
            ErrorKind::Internal => 500,
        }
    }

    /// Stable string code used in rendered error bodies and traces
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::TooManyRequests => "too_many_requests",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A typed runtime error: kind plus `{what, key}` context
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{} ({what}/{key})", .kind.code())]
pub struct Error {
    pub kind: ErrorKind,
    /// What failed ("todo", "slot", "queue", "pipeline", ...)
    pub what: String,
    /// The identifier involved ("42", "TodoItem", "effector", ...)
    pub key: String,
}

impl Error {
    /// Create an error with explicit kind and context
    pub fn new(kind: ErrorKind, what: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind,
            what: what.into(),
            key: key.into(),
        }
    }

    pub fn invalid_input(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, what, key)
    }

    pub fn unauthorized(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, what, key)
    }

    pub fn forbidden(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, what, key)
    }

    pub fn not_found(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what, key)
    }

    pub fn conflict(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, what, key)
    }

    pub fn too_many_requests(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooManyRequests, what, key)
    }

    pub fn upstream_unavailable(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, what, key)
    }

    pub fn timeout(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, what, key)
    }

    pub fn cancelled(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, what, key)
    }

    pub fn internal(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, what, key)
    }

    /// HTTP status this error maps to
    pub fn status(&self) -> u16 {
        self.kind.status()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::internal("serialization", err.to_string())
    }
}
