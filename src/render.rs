//! # Error Renderer
//!
//! Converts a pipeline failure into the response contract. The default
//! renderer emits the canonical status for the error kind and a structured
//! JSON body `{error, what, key}`; hosts replace it by implementing
//! [`ErrorRenderer`] and handing their own to the engine builder.

use serde_json::json;

use crate::config::RenderConfig;
use crate::context::RequestContext;
use crate::error::{Error, ErrorKind};
use crate::request::Response;

/// User-replaceable failure-to-response conversion
pub trait ErrorRenderer: Send + Sync {
    fn render(&self, error: &Error, ctx: &RequestContext) -> Response;
}

/// Default renderer: canonical status, JSON body with the stable error code
#[derive(Debug, Default)]
pub struct JsonErrorRenderer {
    expose_cancelled: bool,
}

impl JsonErrorRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            expose_cancelled: config.expose_cancelled,
        }
    }

    fn status_for(&self, error: &Error) -> u16 {
        // cancellation is an internal condition unless explicitly exposed
        if error.kind == ErrorKind::Cancelled && !self.expose_cancelled {
            return ErrorKind::Internal.status();
        }
        error.status()
    }
}

impl ErrorRenderer for JsonErrorRenderer {
    fn render(&self, error: &Error, _ctx: &RequestContext) -> Response {
        Response::json(
            self.status_for(error),
            &json!({
                "error": error.kind.code(),
                "what": error.what,
                "key": error.key,
            }),
        )
    }
}

/// Render without a context, for failures before the context exists
pub(crate) fn render_bare(error: &Error, config: &RenderConfig) -> Response {
    let status = if error.kind == ErrorKind::Cancelled && !config.expose_cancelled {
        ErrorKind::Internal.status()
    } else {
        error.status()
    };
    Response::json(
        status,
        &json!({
            "error": error.kind.code(),
            "what": error.what,
            "key": error.key,
        }),
    )
}
