//! WebSocket streaming proxy.
//!
//! Lets a duplex call be driven by a WebSocket connection when the native
//! transport cannot be reached (browsers), degrading to the HTTP bridge for
//! non-upgrade requests. The upgraded socket is adapted into the stream
//! abstraction the handler chain expects.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::FromRequestParts;
use axum::extract::Request;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::HeaderMap;
use http::header::{CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bridge::{ProxyState, header_str, metadata_from_headers, reject};
use crate::context::CallContext;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::Encoding;
use crate::stream::MessageStream;

/// Metadata key the echoed bearer sub-protocol is stored under.
pub const AUTHORIZATION_METADATA_KEY: &str = "authorization";

/// Whether the request asks for a WebSocket upgrade.
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    wants_upgrade
        && header_str(headers, UPGRADE.as_str()).eq_ignore_ascii_case("websocket")
}

/// Upgrade the request and dispatch the socket to the handler chain.
pub(crate) async fn upgrade(state: ProxyState, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();

    // Browsers cannot set Content-Type on an upgrade; absence means JSON.
    let content_type = header_str(&parts.headers, CONTENT_TYPE.as_str());
    let encoding = if content_type.is_empty() {
        Encoding::Json
    } else {
        match Encoding::from_content_type(content_type) {
            Some(encoding) => encoding,
            None => {
                return reject(
                    &ProtocolError::UnsupportedContentType(content_type.to_string()).into(),
                );
            }
        }
    };

    let mut metadata = metadata_from_headers(&parts.headers);

    // A `Bearer` sub-protocol carries credentials on a channel that has no
    // Authorization header; echo it back so the handshake completes.
    let bearer = parts
        .headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| value.starts_with("Bearer"))
        .map(ToString::to_string);
    if let Some(bearer) = &bearer {
        metadata.insert(AUTHORIZATION_METADATA_KEY.to_string(), bearer.clone());
    }

    let method = sanitize_method(parts.uri.path());

    let upgrader = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrader) => upgrader,
        Err(rejection) => {
            return reject(
                &ProtocolError::InvalidConnectionType(rejection.to_string()).into(),
            );
        }
    };
    let upgrader = if bearer.is_some() {
        upgrader.protocols(["Bearer"])
    } else {
        upgrader
    };

    let ctx = CallContext::from_parts(metadata, state.token.child_token());
    let chain = state.chain;

    upgrader
        .on_upgrade(move |socket| async move {
            let done = ctx.clone();
            let adapter = WsStream::new(socket, ctx, encoding);
            if let Err(e) = chain.handle_rpc(Box::new(adapter), &method).await {
                warn!(method = %method, error = %e, "websocket rpc failed");
            }
            done.cancel();
        })
        .into_response()
}

/// Strip control characters and HTML-escape the request path before using it
/// as a method name.
pub(crate) fn sanitize_method(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars().filter(|c| !c.is_control()) {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Stream adapter over an upgraded WebSocket.
///
/// Text frames carry JSON payloads, binary frames everything else. A normal
/// close from the peer is end-of-stream, not an error; a receive that races
/// an immediate close simply observes end-of-stream, which is what lets
/// fire-and-forget calls issue a first receive with no payload pending.
struct WsStream {
    ctx: CallContext,
    encoding: Encoding,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    frames: Mutex<SplitStream<WebSocket>>,
    close_sent: AtomicBool,
    remote_done: AtomicBool,
}

impl WsStream {
    fn new(socket: WebSocket, ctx: CallContext, encoding: Encoding) -> Self {
        let (sink, frames) = socket.split();
        Self {
            ctx,
            encoding,
            sink: Mutex::new(sink),
            frames: Mutex::new(frames),
            close_sent: AtomicBool::new(false),
            remote_done: AtomicBool::new(false),
        }
    }

    fn encode_message(&self, message: Bytes) -> Result<Message> {
        match self.encoding {
            Encoding::Json => {
                let text = String::from_utf8(message.to_vec()).map_err(|_| {
                    Error::from(ProtocolError::InvalidFrame(
                        "non-utf8 payload on a json stream".to_string(),
                    ))
                })?;
                Ok(Message::Text(text.into()))
            }
            Encoding::Protobuf => Ok(Message::Binary(message)),
        }
    }
}

#[async_trait]
impl MessageStream for WsStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    async fn send(&self, message: Bytes) -> Result<()> {
        if self.close_sent.load(Ordering::SeqCst) {
            return Err(ProtocolError::SendAfterClose.into());
        }
        let message = self.encode_message(message)?;

        tokio::select! {
            () = self.ctx.cancelled() => Err(Error::Cancelled),
            sent = async {
                self.sink
                    .lock()
                    .await
                    .send(message)
                    .await
                    .map_err(|e| Error::Io(std::io::Error::other(e)))
            } => sent,
        }
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        if self.remote_done.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut frames = self.frames.lock().await;
        loop {
            let next = tokio::select! {
                () = self.ctx.cancelled() => return Err(Error::Cancelled),
                next = frames.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes)),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_bytes())));
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.remote_done.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Ok(_)) => {} // ping/pong
                Some(Err(e)) => return Err(Error::Io(std::io::Error::other(e))),
            }
        }
    }

    async fn close_send(&self) -> Result<()> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Best-effort close handshake; the peer may already be gone.
        if let Err(e) = self.sink.lock().await.send(Message::Close(None)).await {
            debug!(error = %e, "websocket close frame not delivered");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_send().await?;
        self.ctx.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::HeaderValue;

    #[test]
    fn upgrade_detection_requires_both_headers() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(!is_upgrade_request(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));
    }

    #[test]
    fn method_sanitization_strips_controls_and_escapes_html() {
        assert_eq!(
            sanitize_method("/echo.Echo/Ping\r\n"),
            "/echo.Echo/Ping"
        );
        assert_eq!(
            sanitize_method("/<script>&'\"x"),
            "/&lt;script&gt;&amp;&#39;&quot;x"
        );
    }
}
