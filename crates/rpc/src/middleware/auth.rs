//! Bearer-token authentication for server handler chains.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::stream::RpcStream;

use super::{ServerHandler, ServerLayer};

/// Token validation callback.
pub type TokenValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Requires a valid bearer token in call metadata.
///
/// The token is read from metadata under the configured key; an absent token
/// fails with [`Error::MissingCredentials`], a token the validator rejects
/// with [`Error::InvalidCredentials`].
#[derive(Clone)]
pub struct BearerAuth {
    key: String,
    validator: TokenValidator,
}

impl BearerAuth {
    /// Create the layer from the metadata key and validation function.
    pub fn new(key: impl Into<String>, validator: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            key: key.into(),
            validator: Arc::new(validator),
        }
    }
}

struct AuthServer {
    key: String,
    validator: TokenValidator,
    next: Arc<dyn ServerHandler>,
}

#[async_trait]
impl ServerHandler for AuthServer {
    async fn handle_rpc(&self, stream: RpcStream, method: &str) -> Result<()> {
        let Some(token) = stream.context().get(&self.key) else {
            return Err(Error::MissingCredentials);
        };
        if !(self.validator)(token) {
            return Err(Error::InvalidCredentials);
        }
        self.next.handle_rpc(stream, method).await
    }
}

impl ServerLayer for BearerAuth {
    fn wrap(&self, next: Arc<dyn ServerHandler>) -> Arc<dyn ServerHandler> {
        Arc::new(AuthServer {
            key: self.key.clone(),
            validator: Arc::clone(&self.validator),
            next,
        })
    }
}
