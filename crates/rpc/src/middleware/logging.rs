//! Structured call logging.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use crate::context::CallContext;
use crate::error::Result;
use crate::protocol::Encoding;
use crate::stream::RpcStream;

use super::{ClientInterceptor, ClientLayer, MethodPath, ServerHandler, ServerLayer};

/// Emits a start record and a completion record per call.
///
/// Unary calls log completion inline. For streams the completion record is
/// deferred until the stream's context signals done, since the call outlives
/// the open operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging;

impl Logging {
    /// Create the layer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

struct Parts {
    package: String,
    service: String,
    method: String,
}

fn split(method: &str) -> Parts {
    MethodPath::parse(method).map_or_else(
        || Parts {
            package: String::new(),
            service: String::new(),
            method: method.to_string(),
        },
        |p| Parts {
            package: p.package.to_string(),
            service: p.service.to_string(),
            method: p.method.to_string(),
        },
    )
}

fn log_finished(parts: &Parts, elapsed: std::time::Duration) {
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = elapsed.as_millis() as u64;
    info!(
        package = %parts.package,
        service = %parts.service,
        method = %parts.method,
        duration = ?elapsed,
        duration_ms,
        "rpc call finished"
    );
}

fn defer_finish(parts: Parts, ctx: &CallContext, start: Instant) {
    let token = ctx.token().clone();
    tokio::spawn(async move {
        token.cancelled().await;
        log_finished(&parts, start.elapsed());
    });
}

struct LogClient {
    next: Arc<dyn ClientInterceptor>,
}

#[async_trait]
impl ClientInterceptor for LogClient {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
        request: Bytes,
    ) -> Result<Bytes> {
        let parts = split(method);
        info!(
            package = %parts.package,
            service = %parts.service,
            method = %parts.method,
            metadata = ?ctx.metadata(),
            "rpc call starting"
        );

        let start = Instant::now();
        let result = self.next.invoke(ctx, method, encoding, request).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => log_finished(&parts, elapsed),
            Err(e) => {
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                warn!(
                    package = %parts.package,
                    service = %parts.service,
                    method = %parts.method,
                    duration = ?elapsed,
                    duration_ms,
                    error = %e,
                    "rpc call failed"
                );
            }
        }

        result
    }

    async fn open_stream(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<RpcStream> {
        let parts = split(method);
        info!(
            package = %parts.package,
            service = %parts.service,
            method = %parts.method,
            metadata = ?ctx.metadata(),
            "rpc stream starting"
        );

        let start = Instant::now();
        match self.next.open_stream(ctx, method, encoding).await {
            Ok(stream) => {
                defer_finish(parts, stream.context(), start);
                Ok(stream)
            }
            Err(e) => {
                warn!(
                    package = %parts.package,
                    service = %parts.service,
                    method = %parts.method,
                    error = %e,
                    "rpc stream failed to open"
                );
                Err(e)
            }
        }
    }
}

impl ClientLayer for Logging {
    fn wrap(&self, next: Arc<dyn ClientInterceptor>) -> Arc<dyn ClientInterceptor> {
        Arc::new(LogClient { next })
    }
}

struct LogServer {
    next: Arc<dyn ServerHandler>,
}

#[async_trait]
impl ServerHandler for LogServer {
    async fn handle_rpc(&self, stream: RpcStream, method: &str) -> Result<()> {
        let parts = split(method);
        info!(
            package = %parts.package,
            service = %parts.service,
            method = %parts.method,
            metadata = ?stream.context().metadata(),
            "rpc call starting"
        );

        // Server calls are stream-shaped; completion is logged once the
        // stream's context signals done.
        defer_finish(parts, stream.context(), Instant::now());

        self.next.handle_rpc(stream, method).await
    }
}

impl ServerLayer for Logging {
    fn wrap(&self, next: Arc<dyn ServerHandler>) -> Arc<dyn ServerHandler> {
        Arc::new(LogServer { next })
    }
}
