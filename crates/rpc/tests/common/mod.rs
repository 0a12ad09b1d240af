//! Shared services and harness for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use ferrule_rpc::error::ProtocolError;
use ferrule_rpc::{Error, MessageStream, Result, RpcStream, Server, Service};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

/// Echoes every received message back on the stream.
pub struct EchoService;

#[async_trait]
impl Service for EchoService {
    fn name(&self) -> &str {
        "echo.Echo"
    }

    async fn call(&self, method: &str, stream: RpcStream) -> Result<()> {
        if method != "Ping" {
            return Err(ProtocolError::InvalidMethod(method.to_string()).into());
        }
        while let Some(message) = stream.recv().await? {
            stream.send(message).await?;
        }
        stream.close().await
    }
}

/// Sends `count` chunks without waiting for any request payload.
pub struct ChunkService {
    pub count: usize,
}

#[async_trait]
impl Service for ChunkService {
    fn name(&self) -> &str {
        "stream.Chunks"
    }

    async fn call(&self, _method: &str, stream: RpcStream) -> Result<()> {
        for i in 0..self.count {
            stream.send(Bytes::from(format!("\"chunk-{i}\""))).await?;
        }
        stream.close().await
    }
}

/// Fails the first `failures` invocations, then echoes one message.
pub struct FlakyService {
    pub failures: usize,
    pub invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for FlakyService {
    fn name(&self) -> &str {
        "flaky.Flaky"
    }

    async fn call(&self, _method: &str, stream: RpcStream) -> Result<()> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst);
        if invocation < self.failures {
            return Err(Error::Internal(format!(
                "transient failure on invocation {invocation}"
            )));
        }
        if let Some(message) = stream.recv().await? {
            stream.send(message).await?;
        }
        stream.close().await
    }
}

/// Replies "ok" when the expected metadata entry is present.
pub struct MetadataProbe {
    pub key: String,
    pub expected: String,
}

#[async_trait]
impl Service for MetadataProbe {
    fn name(&self) -> &str {
        "meta.Probe"
    }

    async fn call(&self, _method: &str, stream: RpcStream) -> Result<()> {
        let _ = stream.recv().await?;
        match stream.context().get(&self.key) {
            Some(value) if value == self.expected => {
                stream.send(Bytes::from_static(b"\"ok\"")).await?;
                stream.close().await
            }
            other => Err(Error::Internal(format!(
                "unexpected metadata {:?} under {}",
                other, self.key
            ))),
        }
    }
}

/// Replies "ok" when the websocket proxy delivered bearer credentials.
pub struct WsAuthProbe;

#[async_trait]
impl Service for WsAuthProbe {
    fn name(&self) -> &str {
        "ws.Auth"
    }

    async fn call(&self, _method: &str, stream: RpcStream) -> Result<()> {
        let authorized = stream
            .context()
            .get(ferrule_rpc::AUTHORIZATION_METADATA_KEY)
            .is_some_and(|value| value.starts_with("Bearer"));
        if !authorized {
            return Err(Error::MissingCredentials);
        }
        stream.send(Bytes::from_static(b"\"ok\"")).await?;
        stream.close().await
    }
}

/// A running server plus the task driving it.
pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn spawn(server: Server) -> Self {
        let server = Arc::new(server);
        let addr = server.local_addr().expect("tcp test server");
        let handle = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.start().await }
        });
        // Give the accept loop a beat to come up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self {
            server,
            addr,
            handle,
        }
    }

    pub async fn stop(self) {
        self.server.stop().await;
        let _ = self.handle.await;
    }
}

pub fn loopback() -> ferrule_rpc::ListenOn {
    ferrule_rpc::ListenOn::Tcp("127.0.0.1:0".parse().unwrap())
}
