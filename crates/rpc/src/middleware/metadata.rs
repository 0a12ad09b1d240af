//! Client-side metadata injection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::CallContext;
use crate::error::Result;
use crate::protocol::Encoding;
use crate::stream::RpcStream;

use super::{ClientInterceptor, ClientLayer};

/// Attaches a fixed key/value map to every outgoing call context.
#[derive(Debug, Clone)]
pub struct MetadataInjector {
    entries: HashMap<String, String>,
}

impl MetadataInjector {
    /// Create the layer from the entries to inject.
    #[must_use]
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

struct InjectClient {
    entries: HashMap<String, String>,
    next: Arc<dyn ClientInterceptor>,
}

impl InjectClient {
    fn apply(&self, mut ctx: CallContext) -> CallContext {
        for (key, value) in &self.entries {
            ctx.insert(key.clone(), value.clone());
        }
        ctx
    }
}

#[async_trait]
impl ClientInterceptor for InjectClient {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
        request: Bytes,
    ) -> Result<Bytes> {
        self.next
            .invoke(self.apply(ctx), method, encoding, request)
            .await
    }

    async fn open_stream(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<RpcStream> {
        self.next
            .open_stream(self.apply(ctx), method, encoding)
            .await
    }
}

impl ClientLayer for MetadataInjector {
    fn wrap(&self, next: Arc<dyn ClientInterceptor>) -> Arc<dyn ClientInterceptor> {
        Arc::new(InjectClient {
            entries: self.entries.clone(),
            next,
        })
    }
}
