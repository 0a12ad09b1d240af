//! Embeddable RPC transport layer.
//!
//! A server and client pair for a compact binary RPC protocol with:
//!
//! - **Connection pooling**: the client lazily dials and reuses connections
//!   through [`ferrule_pool`]
//! - **Middleware chains**: composable interceptors on both roles (logging,
//!   panic containment, rate limiting, retry, bearer auth, metadata)
//! - **Protocol multiplexing**: native RPC and HTTP/JSON served from one
//!   listener, demultiplexed by a short protocol-selection header
//! - **WebSocket streaming**: duplex RPC streams for clients that cannot
//!   open raw sockets
//! - **TLS**: rustls configuration builders shared by both roles
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use ferrule_rpc::{
//!     CallContext, Client, Encoding, ListenOn, MessageStream, Result, RpcStream, Server,
//!     Service, Target,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Service for Echo {
//!     fn name(&self) -> &str {
//!         "echo.Echo"
//!     }
//!
//!     async fn call(&self, _method: &str, stream: RpcStream) -> Result<()> {
//!         while let Some(message) = stream.recv().await? {
//!             stream.send(message).await?;
//!         }
//!         stream.close().await
//!     }
//! }
//!
//! async fn example() -> Result<()> {
//!     let server = Server::builder()
//!         .listen(ListenOn::Tcp("127.0.0.1:0".parse().unwrap()))
//!         .service(Echo)
//!         .build()
//!         .await?;
//!     let addr = server.local_addr().unwrap();
//!     tokio::spawn(async move { server.start().await });
//!
//!     let client = Client::builder()
//!         .target(Target::Tcp(addr.to_string()))
//!         .build()?;
//!     let reply = client
//!         .invoke(
//!             CallContext::new(),
//!             "/echo.Echo/Ping",
//!             Encoding::Json,
//!             Bytes::from_static(b"hello"),
//!         )
//!         .await?;
//!     assert_eq!(reply, Bytes::from_static(b"hello"));
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bridge;
mod client;
mod context;
pub mod error;
pub mod middleware;
mod mux;
pub mod protocol;
mod server;
mod stream;
pub mod tls;
mod ws;

pub use bridge::METADATA_HEADER_PREFIX;
pub use client::{Client, ClientBuilder, Target};
pub use context::CallContext;
pub use error::{Error, Result};
pub use middleware::{
    BearerAuth, ClientInterceptor, ClientLayer, Logging, MetadataInjector, MethodPath, RateLimit,
    Recover, Retry, ServerHandler, ServerLayer, TokenBucket,
};
pub use protocol::{Encoding, PROTOCOL_HEADER};
pub use server::{ListenOn, Server, ServerBuilder, Service};
pub use stream::{MessageStream, PairStream, RpcStream};
pub use ws::AUTHORIZATION_METADATA_KEY;

// Re-export dependencies that are part of the public API.
pub use bytes::Bytes;
