//! Panic containment.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tracing::error;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::protocol::Encoding;
use crate::stream::RpcStream;

use super::{ClientInterceptor, ClientLayer, ServerHandler, ServerLayer};

/// Converts a panic inside the wrapped call into an internal error.
///
/// The fault is caught at the scope of the single call, so one failing
/// request never takes down the owning task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recover;

impl Recover {
    /// Create the layer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn fault_to_error(panic: &(dyn Any + Send)) -> Error {
    let message = panic.downcast_ref::<&str>().map_or_else(
        || {
            panic
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "unidentified fault".to_string())
        },
        |s| (*s).to_string(),
    );
    error!(fault = %message, "contained panic in rpc call");
    Error::Internal(message)
}

struct RecoverClient {
    next: Arc<dyn ClientInterceptor>,
}

#[async_trait]
impl ClientInterceptor for RecoverClient {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
        request: Bytes,
    ) -> Result<Bytes> {
        match AssertUnwindSafe(self.next.invoke(ctx, method, encoding, request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(fault_to_error(&panic)),
        }
    }

    async fn open_stream(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<RpcStream> {
        match AssertUnwindSafe(self.next.open_stream(ctx, method, encoding))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(fault_to_error(&panic)),
        }
    }
}

impl ClientLayer for Recover {
    fn wrap(&self, next: Arc<dyn ClientInterceptor>) -> Arc<dyn ClientInterceptor> {
        Arc::new(RecoverClient { next })
    }
}

struct RecoverServer {
    next: Arc<dyn ServerHandler>,
}

#[async_trait]
impl ServerHandler for RecoverServer {
    async fn handle_rpc(&self, stream: RpcStream, method: &str) -> Result<()> {
        match AssertUnwindSafe(self.next.handle_rpc(stream, method))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(fault_to_error(&panic)),
        }
    }
}

impl ServerLayer for Recover {
    fn wrap(&self, next: Arc<dyn ServerHandler>) -> Arc<dyn ServerHandler> {
        Arc::new(RecoverServer { next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::stream::PairStream;

    struct PanickingHandler;

    #[async_trait]
    impl ServerHandler for PanickingHandler {
        async fn handle_rpc(&self, _stream: RpcStream, _method: &str) -> Result<()> {
            panic!("handler exploded");
        }
    }

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let chain = Recover.wrap(Arc::new(PanickingHandler));
        let (stream, _peer) = PairStream::pair(CallContext::new(), Encoding::Json);

        let err = chain
            .handle_rpc(Box::new(stream), "/test.Test/Boom")
            .await
            .unwrap_err();

        match err {
            Error::Internal(message) => assert!(message.contains("handler exploded")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
