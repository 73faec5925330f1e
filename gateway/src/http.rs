//! HTTP glue: runs each request through the registry pipeline.
//!
//! Order per request:
//!
//! 1. resolve the endpoint (404 if unregistered)
//! 2. security chain (rejection code, default 403)
//! 3. decoder chain
//! 4. [`Backend`] produces the response payload
//! 5. encoder chain
//! 6. header managers
//!
//! The whole sequence runs under one deadline. When it expires the request
//! future is dropped, so no further stage starts, and the client gets 504.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::pipeline::{Payload, ServerContext};
use crate::registry::{ApiRegistry, MISSING_ENDPOINT_REASON};

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Error raised by a [`Backend`].
#[derive(Debug)]
pub enum BackendError {
    /// The target does not exist.
    NotFound(String),
    /// The target kind is not served by this backend.
    Unsupported(String),
    Io {
        target: String,
        source: std::io::Error,
    },
    /// The backend ran but failed to produce a response.
    Failed(String),
}

impl BackendError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Failed(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(target) => write!(f, "target not found: {target}"),
            Self::Unsupported(target) => write!(f, "unsupported target: {target}"),
            Self::Io { target, source } => write!(f, "cannot read {target}: {source}"),
            Self::Failed(reason) => write!(f, "backend failed: {reason}"),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Produces the response payload for a resolved endpoint target.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn handle(
        &self,
        target: &str,
        request: &Payload,
        headers: &HeaderMap,
        ctx: &ServerContext,
    ) -> Result<Payload, BackendError>;
}

/// Serves the target file: parsed JSON when it parses, text otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBackend;

#[async_trait]
impl Backend for FileBackend {
    async fn handle(
        &self,
        target: &str,
        _request: &Payload,
        _headers: &HeaderMap,
        _ctx: &ServerContext,
    ) -> Result<Payload, BackendError> {
        if target.contains("://") {
            return Err(BackendError::Unsupported(target.to_string()));
        }
        let text = match tokio::fs::read_to_string(PathBuf::from(target)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(target.to_string()));
            }
            Err(source) => {
                return Err(BackendError::Io {
                    target: target.to_string(),
                    source,
                });
            }
        };
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text)))
    }
}

/// Shared state of the HTTP handler.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<ApiRegistry>,
    pub backend: Arc<dyn Backend>,
    pub request_timeout: Duration,
}

/// A router that sends every request through the pipeline.
pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(handle_request).with_state(state)
}

/// Run one request through the pipeline under the request deadline.
pub async fn handle_request(State(state): State<GatewayState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
    let ctx = ServerContext {
        remote_addr: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0),
        method: parts.method.to_string(),
    };

    let pipeline = run_pipeline(&state, &url, &parts.headers, body, &ctx);
    if let Ok(response) = tokio::time::timeout(state.request_timeout, pipeline).await {
        response
    } else {
        tracing::warn!(url, "request timed out");
        error_response(StatusCode::GATEWAY_TIMEOUT, "request timed out")
    }
}

async fn run_pipeline(
    state: &GatewayState,
    url: &str,
    headers: &HeaderMap,
    body: Body,
    ctx: &ServerContext,
) -> Response {
    let registry = &state.registry;
    let Some(target) = registry.resolve(url) else {
        tracing::debug!(url, "no endpoint registered");
        return error_response(StatusCode::NOT_FOUND, MISSING_ENDPOINT_REASON);
    };

    let request = match read_payload(body).await {
        Ok(request) => request,
        Err(reason) => return error_response(StatusCode::BAD_REQUEST, &reason),
    };

    if let Err(rejection) = registry.check_security(url, &request, headers, ctx).await {
        let status = StatusCode::from_u16(rejection.code).unwrap_or(StatusCode::FORBIDDEN);
        return error_response(status, &rejection.reason);
    }

    let request = match registry.decode(url, request, headers, ctx).await {
        Ok(Some(request)) => request,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, MISSING_ENDPOINT_REASON),
        Err(e) => {
            tracing::error!(url, "{e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let response = match state.backend.handle(&target, &request, headers, ctx).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url, resource = %target, "{e}");
            return error_response(e.status(), &e.to_string());
        }
    };

    let mut response_headers = HeaderMap::new();
    let response = match registry
        .encode(url, response, headers, &mut response_headers, ctx)
        .await
    {
        Ok(Some(response)) => response,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, MISSING_ENDPOINT_REASON),
        Err(e) => {
            tracing::error!(url, "{e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    registry
        .inject_response_headers(url, &response, headers, &mut response_headers, ctx, &request)
        .await;

    let body = match response {
        Value::String(text) => text,
        other => other.to_string(),
    };
    (StatusCode::OK, response_headers, body).into_response()
}

async fn read_payload(body: Body) -> Result<Payload, String> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| format!("cannot read request body: {e}"))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| format!("request body is not JSON: {e}"))
}

fn error_response(status: StatusCode, reason: &str) -> Response {
    (status, Json(json!({ "error": reason }))).into_response()
}
