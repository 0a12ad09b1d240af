//! Interceptor and handler chains.
//!
//! Both roles share the same composition rule: layers declared as
//! `[a, b, c]` fold onto the base handler in declaration order, producing
//! `c(b(a(base)))` — the first-declared layer sits innermost (closest to the
//! real handler) and the last-declared runs first on the way in.

mod auth;
mod logging;
mod metadata;
mod ratelimit;
mod recover;
mod retry;

pub use auth::BearerAuth;
pub use logging::Logging;
pub use metadata::MetadataInjector;
pub use ratelimit::{RateLimit, TokenBucket};
pub use recover::Recover;
pub use retry::Retry;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::CallContext;
use crate::error::Result;
use crate::protocol::Encoding;
use crate::stream::RpcStream;

/// Client-side call capability: unary invoke and stream open.
#[async_trait]
pub trait ClientInterceptor: Send + Sync {
    /// Execute a unary call and return the response payload.
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
        request: Bytes,
    ) -> Result<Bytes>;

    /// Open a duplex stream for the given method.
    async fn open_stream(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<RpcStream>;
}

/// A client middleware: wraps an interceptor in another of the same shape.
pub trait ClientLayer: Send + Sync {
    /// Produce the wrapped interceptor.
    fn wrap(&self, next: Arc<dyn ClientInterceptor>) -> Arc<dyn ClientInterceptor>;
}

/// Server-side call capability.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Process one call on its stream.
    async fn handle_rpc(&self, stream: RpcStream, method: &str) -> Result<()>;
}

/// A server middleware: wraps a handler in another of the same shape.
pub trait ServerLayer: Send + Sync {
    /// Produce the wrapped handler.
    fn wrap(&self, next: Arc<dyn ServerHandler>) -> Arc<dyn ServerHandler>;
}

/// Fold client layers onto a base interceptor (first-declared innermost).
pub fn assemble_client(
    base: Arc<dyn ClientInterceptor>,
    layers: &[Arc<dyn ClientLayer>],
) -> Arc<dyn ClientInterceptor> {
    let mut chain = base;
    for layer in layers {
        chain = layer.wrap(chain);
    }
    chain
}

/// Fold server layers onto a base handler (first-declared innermost).
pub fn assemble_server(
    base: Arc<dyn ServerHandler>,
    layers: &[Arc<dyn ServerLayer>],
) -> Arc<dyn ServerHandler> {
    let mut chain = base;
    for layer in layers {
        chain = layer.wrap(chain);
    }
    chain
}

/// A method path of the form `/package.Service/Method`, split into parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodPath<'a> {
    /// Proto package, empty when the service name is unqualified.
    pub package: &'a str,
    /// Bare service name.
    pub service: &'a str,
    /// Method name.
    pub method: &'a str,
}

impl<'a> MethodPath<'a> {
    /// Parse a method path. Returns `None` when the shape does not match.
    #[must_use]
    pub fn parse(path: &'a str) -> Option<Self> {
        let rest = path.strip_prefix('/')?;
        let (qualified, method) = rest.split_once('/')?;
        if method.is_empty() || method.contains('/') {
            return None;
        }
        let (package, service) = qualified.rsplit_once('.').unwrap_or(("", qualified));
        if service.is_empty() {
            return None;
        }
        Some(Self {
            package,
            service,
            method,
        })
    }

    /// The `package.Service` form used as a registry key.
    #[must_use]
    pub fn qualified_service(&self) -> String {
        if self.package.is_empty() {
            self.service.to_string()
        } else {
            format!("{}.{}", self.package, self.service)
        }
    }
}
