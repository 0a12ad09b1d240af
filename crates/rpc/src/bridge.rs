//! HTTP/JSON bridge: `POST /{package.Service}/{Method}` over the handler
//! chain.
//!
//! Call metadata travels in `rpc-metadata-*` request headers. Errors become
//! an HTTP status plus a JSON body with a machine-readable `code` and a
//! `message`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::CallContext;
use crate::error::{ConnectionError, Error, ProtocolError};
use crate::middleware::{MethodPath, ServerHandler};
use crate::protocol::{Encoding, MAX_FRAME_SIZE};
use crate::stream::{MessageStream, PairStream};
use crate::ws;

/// Prefix of the request headers carrying call metadata.
pub const METADATA_HEADER_PREFIX: &str = "rpc-metadata-";

/// Shared state of the HTTP bridge and WebSocket proxy.
#[derive(Clone)]
pub(crate) struct ProxyState {
    pub(crate) chain: Arc<dyn ServerHandler>,
    pub(crate) token: CancellationToken,
    pub(crate) websocket: bool,
}

/// Build the bridge router; every path falls through to the RPC dispatch
/// handler, with WebSocket upgrades peeled off first when enabled.
pub(crate) fn router(state: ProxyState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<ProxyState>, request: Request) -> Response {
    if state.websocket && ws::is_upgrade_request(request.headers()) {
        return ws::upgrade(state, request).await;
    }
    unary(state, request).await
}

async fn unary(state: ProxyState, request: Request) -> Response {
    if *request.method() != Method::POST {
        return error_body(
            StatusCode::METHOD_NOT_ALLOWED,
            "INVALID_METHOD",
            "only POST is supported",
        );
    }

    let content_type = header_str(request.headers(), CONTENT_TYPE.as_str());
    let Some(encoding) = Encoding::from_content_type(content_type) else {
        return reject(&ProtocolError::UnsupportedContentType(content_type.to_string()).into());
    };

    let path = request.uri().path().to_string();
    if MethodPath::parse(&path).is_none() {
        return reject(&ProtocolError::InvalidMethod(path).into());
    }

    let metadata = metadata_from_headers(request.headers());
    let body = match axum::body::to_bytes(request.into_body(), MAX_FRAME_SIZE).await {
        Ok(bytes) => bytes,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, "INVALID_BODY", &e.to_string()),
    };

    let ctx = CallContext::from_parts(metadata, state.token.child_token());
    let (local, remote) = PairStream::pair(ctx.clone(), encoding);

    if local.send(body).await.is_err() {
        return reject(&Error::Internal("bridge stream unavailable".to_string()));
    }
    let _ = local.close_send().await;

    if let Err(e) = state.chain.handle_rpc(Box::new(remote), &path).await {
        debug!(path, error = %e, "bridged call failed");
        ctx.cancel();
        return reject(&e);
    }

    let reply = local.recv().await;
    ctx.cancel();

    match reply {
        Ok(Some(bytes)) => (
            StatusCode::OK,
            [(CONTENT_TYPE, encoding.content_type())],
            Body::from(bytes),
        )
            .into_response(),
        // Fire-and-forget handlers produce no reply message.
        Ok(None) | Err(Error::Connection(ConnectionError::Closed)) => (
            StatusCode::OK,
            [(CONTENT_TYPE, encoding.content_type())],
            Body::empty(),
        )
            .into_response(),
        Err(e) => reject(&e),
    }
}

/// Render an error as its HTTP status plus a JSON body.
pub(crate) fn reject(error: &Error) -> Response {
    error_body(error.http_status(), error.code(), &error.to_string())
}

pub(crate) fn error_body(status: StatusCode, code: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "code": code,
        "message": message,
    });
    (status, axum::Json(body)).into_response()
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

/// Collect `rpc-metadata-*` headers into a metadata map.
pub(crate) fn metadata_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if let Some(key) = name.strip_prefix(METADATA_HEADER_PREFIX) {
            if let Ok(value) = value.to_str() {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
    }
    metadata
}
