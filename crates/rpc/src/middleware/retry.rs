//! Client-side retry with linear backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::context::CallContext;
use crate::error::Result;
use crate::protocol::Encoding;
use crate::stream::RpcStream;

use super::{ClientInterceptor, ClientLayer};

/// Retries a failing unary call or stream open.
///
/// Any error is considered retryable. The delay before retrying attempt `n`
/// (1-based) is `base_delay * factor * n`; once `max_attempts` have been
/// made the last error is surfaced.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    max_attempts: u32,
    base_delay: Duration,
    factor: u32,
}

impl Retry {
    /// Create the layer.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, factor: u32) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            base_delay,
            factor,
        }
    }

    const fn delay_for(self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(self.factor.saturating_mul(attempt))
    }
}

struct RetryClient {
    policy: Retry,
    next: Arc<dyn ClientInterceptor>,
}

#[async_trait]
impl ClientInterceptor for RetryClient {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
        request: Bytes,
    ) -> Result<Bytes> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .next
                .invoke(ctx.clone(), method, encoding, request.clone())
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    warn!(method, attempt, delay_ms, error = %e, "retrying rpc call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn open_stream(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<RpcStream> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.next.open_stream(ctx.clone(), method, encoding).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = delay.as_millis() as u64;
                    warn!(method, attempt, delay_ms, error = %e, "retrying stream open");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl ClientLayer for Retry {
    fn wrap(&self, next: Arc<dyn ClientInterceptor>) -> Arc<dyn ClientInterceptor> {
        Arc::new(RetryClient {
            policy: *self,
            next,
        })
    }
}
