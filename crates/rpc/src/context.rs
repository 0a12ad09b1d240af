//! Per-call context: metadata plus cancellation.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

/// Context carried by every call and stream.
///
/// Holds the caller-visible metadata map and a cancellation token. Tokens
/// form a tree: [`CallContext::child`] derives a context that is cancelled
/// whenever its parent is, so server shutdown reaches every in-flight
/// stream.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    metadata: HashMap<String, String>,
    token: CancellationToken,
}

impl CallContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from existing metadata and a token.
    #[must_use]
    pub const fn from_parts(metadata: HashMap<String, String>, token: CancellationToken) -> Self {
        Self { metadata, token }
    }

    /// Derive a context whose token is a child of this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            token: self.token.child_token(),
        }
    }

    /// The metadata map.
    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Look up a metadata value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Insert a metadata entry, replacing any existing value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// The cancellation token backing this context.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and all children derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this context has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until this context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
