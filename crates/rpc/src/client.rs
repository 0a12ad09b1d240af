//! RPC client: lazy-dialled, pooled connections with an interceptor chain.

#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use futures::stream::SplitStream;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use ferrule_pool::Pool;

use crate::context::CallContext;
use crate::error::{ConnectionError, Error, ProtocolError, Result};
use crate::middleware::{ClientInterceptor, ClientLayer, assemble_client};
use crate::protocol::{
    CloseEnvelope, DataEnvelope, Encoding, Frame, FrameCodec, FrameType, OpenEnvelope,
    PROTOCOL_HEADER, codec,
};
use crate::stream::{
    BoxIo, CallMap, EVENT_BUFFER, FrameSink, FramedStream, MessageStream, RpcStream, StreamEvent,
};
use crate::tls::{self, ClientTlsOptions};

/// Remote endpoint a client dials.
#[derive(Debug, Clone)]
pub enum Target {
    /// TCP address, `host:port`.
    Tcp(String),
    /// Unix-domain socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => f.write_str(addr),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    target: Option<Target>,
    tls: Option<ClientTlsOptions>,
    http_compat: bool,
    pool_limit: usize,
    layers: Vec<Arc<dyn ClientLayer>>,
}

impl ClientBuilder {
    /// Create a builder with defaults: no TLS, native protocol, pool of 8.
    #[must_use]
    pub fn new() -> Self {
        Self {
            target: None,
            tls: None,
            http_compat: false,
            pool_limit: 8,
            layers: Vec::new(),
        }
    }

    /// Set the remote endpoint.
    #[must_use]
    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// Enable TLS with the given options.
    #[must_use]
    pub fn tls(mut self, opts: ClientTlsOptions) -> Self {
        self.tls = Some(opts);
        self
    }

    /// Prefix each connection with the protocol-selection header so it can
    /// reach servers that share their port with HTTP.
    #[must_use]
    pub const fn http_compat(mut self) -> Self {
        self.http_compat = true;
        self
    }

    /// Cap the connection pool. Zero means unbounded.
    #[must_use]
    pub const fn pool_limit(mut self, limit: usize) -> Self {
        self.pool_limit = limit;
        self
    }

    /// Append an interceptor layer. Layers declared first run innermost.
    #[must_use]
    pub fn layer(mut self, layer: Arc<dyn ClientLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Build the client. Dialing happens lazily on first use.
    ///
    /// # Errors
    ///
    /// Fails when no target was set or the TLS options do not build.
    pub fn build(self) -> Result<Client> {
        let target = self.target.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "target address not specified",
            ))
        })?;

        let tls = match &self.tls {
            Some(opts) => {
                let config = tls::client_config(opts)?;
                let name = tls::parse_server_name(opts)?;
                Some((TlsConnector::from(Arc::new(config)), name))
            }
            None => None,
        };

        let http_compat = self.http_compat;
        let dial_target = target.clone();
        let pool = Pool::new(
            self.pool_limit,
            move || {
                let target = dial_target.clone();
                let tls = tls.clone();
                async move {
                    dial(&target, tls, http_compat)
                        .await
                        .map_err(|e| -> ferrule_pool::BoxError { Box::new(e) })
                }
            },
            |conn: Conn| async move {
                conn.shutdown()
                    .await
                    .map_err(|e| -> ferrule_pool::BoxError { Box::new(e) })
            },
        );

        Ok(Client {
            target,
            pool,
            layers: self.layers,
            closed: AtomicBool::new(false),
            closed_token: CancellationToken::new(),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC client bound to one remote address.
pub struct Client {
    target: Target,
    pool: Pool<Conn>,
    layers: Vec<Arc<dyn ClientLayer>>,
    closed: AtomicBool,
    closed_token: CancellationToken,
}

impl Client {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The endpoint this client dials.
    #[must_use]
    pub const fn target(&self) -> &Target {
        &self.target
    }

    /// Execute a unary call.
    ///
    /// A connection is checked out of the pool, the interceptor chain is
    /// assembled over it for this call, and the connection is returned
    /// whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns pool capacity errors, dial errors, and whatever the chain or
    /// remote side reports.
    pub async fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
        request: Bytes,
    ) -> Result<Bytes> {
        let conn = self.checkout().await?;
        let chain = assemble_client(
            Arc::new(ConnTarget { conn: conn.clone() }),
            &self.layers,
        );
        let result = chain.invoke(ctx, method, encoding, request).await;
        self.pool.put([conn]).await;
        result
    }

    /// Open a duplex stream.
    ///
    /// The connection returns to the pool once the stream is open; the
    /// stream keeps using it until closed.
    ///
    /// # Errors
    ///
    /// Returns pool capacity errors, dial errors, and whatever the chain
    /// reports.
    pub async fn open_stream(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<RpcStream> {
        let conn = self.checkout().await?;
        let chain = assemble_client(
            Arc::new(ConnTarget { conn: conn.clone() }),
            &self.layers,
        );
        let result = chain.open_stream(ctx, method, encoding).await;
        self.pool.put([conn]).await;
        result
    }

    /// Whether any connection is currently checked out.
    pub async fn is_active(&self) -> bool {
        self.pool.stats().await.active > 0
    }

    /// Token cancelled exactly once, when the client closes.
    #[must_use]
    pub const fn closed(&self) -> &CancellationToken {
        &self.closed_token
    }

    /// Close the client: drain the pool, closing every idle connection, and
    /// fire the closed notification. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(target = %self.target, "closing rpc client");
        let mut errors = self.pool.drain();
        while let Some(e) = errors.recv().await {
            warn!(error = %e, "connection close failed");
        }
        self.closed_token.cancel();
    }

    async fn checkout(&self) -> Result<Conn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        self.pool.get().await.map_err(unwrap_pool_error)
    }
}

/// Dial errors travel through the pool boxed; restore the native type so
/// callers see transport errors unmodified.
fn unwrap_pool_error(e: ferrule_pool::Error) -> Error {
    match e {
        ferrule_pool::Error::Build(source) => match source.downcast::<Error>() {
            Ok(inner) => *inner,
            Err(source) => Error::Pool(ferrule_pool::Error::Build(source)),
        },
        other => Error::Pool(other),
    }
}

async fn dial(
    target: &Target,
    tls: Option<(TlsConnector, rustls_pki_types::ServerName<'static>)>,
    http_compat: bool,
) -> Result<Conn> {
    let io: BoxIo = match target {
        Target::Tcp(addr) => Box::new(TcpStream::connect(addr.as_str()).await.map_err(|e| {
            ConnectionError::ConnectFailed {
                addr: addr.clone(),
                source: e,
            }
        })?),
        #[cfg(unix)]
        Target::Unix(path) => Box::new(tokio::net::UnixStream::connect(path).await.map_err(
            |e| ConnectionError::ConnectFailed {
                addr: path.display().to_string(),
                source: e,
            },
        )?),
    };

    let mut io: BoxIo = match tls {
        Some((connector, name)) => Box::new(connector.connect(name, io).await?),
        None => io,
    };

    if http_compat {
        io.write_all(&PROTOCOL_HEADER).await?;
        io.flush().await?;
    }

    debug!(target = %target, "dialled new connection");
    Ok(Conn::spawn(io))
}

/// A live connection: shared write half plus a driver task routing inbound
/// frames to calls by id.
pub(crate) struct Conn {
    sink: FrameSink,
    calls: CallMap,
    driver: Arc<tokio::task::JoinHandle<()>>,
}

impl Clone for Conn {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            calls: Arc::clone(&self.calls),
            driver: Arc::clone(&self.driver),
        }
    }
}

impl Conn {
    fn spawn(io: BoxIo) -> Self {
        let framed = Framed::new(io, FrameCodec::new());
        let (sink, stream) = framed.split();
        let calls: CallMap = Arc::new(DashMap::new());
        let driver = tokio::spawn(Self::drive(stream, Arc::clone(&calls)));

        Self {
            sink: Arc::new(Mutex::new(sink)),
            calls,
            driver: Arc::new(driver),
        }
    }

    async fn drive(mut frames: SplitStream<Framed<BoxIo, FrameCodec>>, calls: CallMap) {
        while let Some(next) = frames.next().await {
            match next {
                Ok(frame) => match frame.frame_type {
                    FrameType::Data => match codec::decode::<DataEnvelope>(&frame.payload) {
                        Ok(env) => {
                            let entry = calls.get(&env.id).map(|e| e.value().clone());
                            if let Some(tx) = entry {
                                let _ = tx.send(StreamEvent::Payload(env.payload.into())).await;
                            } else {
                                debug!(call_id = %env.id, "data for unknown call");
                            }
                        }
                        Err(e) => debug!(error = %e, "undecodable data envelope"),
                    },
                    FrameType::Close => {
                        if let Ok(env) = codec::decode::<CloseEnvelope>(&frame.payload) {
                            if let Some((_, tx)) = calls.remove(&env.id) {
                                let _ = tx.send(StreamEvent::End(env.error)).await;
                            }
                        }
                    }
                    FrameType::Ping => {}
                    FrameType::Open => debug!("unexpected open frame from server"),
                },
                Err(e) => {
                    debug!(error = %e, "connection stream error");
                    break;
                }
            }
        }

        // Dropping the senders surfaces a closed-connection error to any
        // call still waiting on this connection.
        calls.clear();
    }

    pub(crate) async fn open_call(
        &self,
        ctx: &CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<FramedStream> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.calls.insert(id, tx);

        let env = OpenEnvelope {
            id,
            method: method.to_string(),
            encoding,
            metadata: ctx.metadata().clone(),
        };
        let frame = Frame::new(FrameType::Open, codec::encode(&env)?);
        if let Err(e) = self.sink.lock().await.send(frame).await {
            self.calls.remove(&id);
            return Err(Error::Io(e));
        }

        Ok(FramedStream::new(
            id,
            ctx.child(),
            encoding,
            Arc::clone(&self.sink),
            rx,
            Arc::clone(&self.calls),
            Arc::new(AtomicBool::new(false)),
        ))
    }

    async fn shutdown(self) -> std::io::Result<()> {
        self.driver.abort();
        let mut sink = self.sink.lock().await;
        sink.close().await
    }
}

/// Base of the client chain: the pooled connection as an interceptor.
struct ConnTarget {
    conn: Conn,
}

#[async_trait]
impl ClientInterceptor for ConnTarget {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
        request: Bytes,
    ) -> Result<Bytes> {
        let stream = self.conn.open_call(&ctx, method, encoding).await?;
        stream.send(request).await?;
        stream.close_send().await?;

        let reply = match stream.recv().await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(ProtocolError::MissingResponse.into()),
            Err(e) => Err(e),
        };
        let _ = stream.close().await;
        reply
    }

    async fn open_stream(
        &self,
        ctx: CallContext,
        method: &str,
        encoding: Encoding,
    ) -> Result<RpcStream> {
        Ok(Box::new(self.conn.open_call(&ctx, method, encoding).await?))
    }
}
