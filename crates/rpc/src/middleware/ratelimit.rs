//! Token-bucket rate limiting.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::protocol::Encoding;
use crate::stream::RpcStream;

use super::{ClientInterceptor, ClientLayer, ServerHandler, ServerLayer};

/// Thread-safe token bucket.
///
/// One bucket is shared by every call going through the layer that owns it;
/// `allow` never blocks.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate_per_sec`, with burst capacity equal
    /// to the rate (at least one token).
    #[must_use]
    pub fn new(rate_per_sec: f64) -> Self {
        let burst = rate_per_sec.max(1.0);
        Self {
            rate: rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                refilled: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refilled = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rejects calls with [`Error::RateLimited`] when the shared bucket is empty.
#[derive(Debug, Clone)]
pub struct RateLimit {
    bucket: Arc<TokenBucket>,
}

impl RateLimit {
    /// Create the layer around an explicit shared bucket.
    #[must_use]
    pub fn new(bucket: Arc<TokenBucket>) -> Self {
        Self { bucket }
    }

    /// Convenience constructor owning a fresh bucket.
    #[must_use]
    pub fn per_second(rate: f64) -> Self {
        Self::new(Arc::new(TokenBucket::new(rate)))
    }
}

struct LimitClient {
    bucket: Arc<TokenBucket>,
    next: Arc<dyn ClientInterceptor>,
}

#[async_trait]
impl ClientInterceptor for LimitClient {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
        request: Bytes,
    ) -> Result<Bytes> {
        if !self.bucket.allow() {
            return Err(Error::RateLimited);
        }
        self.next.invoke(ctx, method, encoding, request).await
    }

    async fn open_stream(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<RpcStream> {
        if !self.bucket.allow() {
            return Err(Error::RateLimited);
        }
        self.next.open_stream(ctx, method, encoding).await
    }
}

impl ClientLayer for RateLimit {
    fn wrap(&self, next: Arc<dyn ClientInterceptor>) -> Arc<dyn ClientInterceptor> {
        Arc::new(LimitClient {
            bucket: Arc::clone(&self.bucket),
            next,
        })
    }
}

struct LimitServer {
    bucket: Arc<TokenBucket>,
    next: Arc<dyn ServerHandler>,
}

#[async_trait]
impl ServerHandler for LimitServer {
    async fn handle_rpc(&self, stream: RpcStream, method: &str) -> Result<()> {
        if !self.bucket.allow() {
            return Err(Error::RateLimited);
        }
        self.next.handle_rpc(stream, method).await
    }
}

impl ServerLayer for RateLimit {
    fn wrap(&self, next: Arc<dyn ServerHandler>) -> Arc<dyn ServerHandler> {
        Arc::new(LimitServer {
            bucket: Arc::clone(&self.bucket),
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_and_refills() {
        let bucket = TokenBucket::new(1.0);
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn burst_matches_rate() {
        let bucket = TokenBucket::new(3.0);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }
}
