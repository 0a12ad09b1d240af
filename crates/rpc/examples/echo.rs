//! Minimal echo round-trip over a loopback server.
//!
//! ```bash
//! cargo run --example echo
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use ferrule_rpc::{
    CallContext, Client, Encoding, ListenOn, MessageStream, Result, RpcStream, Server, Service,
    Target,
};

struct EchoService;

#[async_trait]
impl Service for EchoService {
    fn name(&self) -> &str {
        "echo.Echo"
    }

    async fn call(&self, _method: &str, stream: RpcStream) -> Result<()> {
        while let Some(message) = stream.recv().await? {
            stream.send(message).await?;
        }
        stream.close().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let server = Server::builder()
        .listen(ListenOn::Tcp("127.0.0.1:0".parse().unwrap()))
        .service(EchoService)
        .build()
        .await?;
    let addr = server.local_addr().expect("tcp listener");

    let server = std::sync::Arc::new(server);
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });

    let client = Client::builder()
        .target(Target::Tcp(addr.to_string()))
        .build()?;

    let reply = client
        .invoke(
            CallContext::new(),
            "/echo.Echo/Ping",
            Encoding::Json,
            Bytes::from_static(b"\"hello, ferrule\""),
        )
        .await?;
    println!("echoed: {}", String::from_utf8_lossy(&reply));

    client.close().await;
    server.stop().await;
    let _ = serving.await;

    Ok(())
}
