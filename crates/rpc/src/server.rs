//! RPC server: dual-protocol listener, service registry, and lifecycle.
//!
//! A server moves through `Created -> Listening -> Serving -> Stopped`;
//! [`ServerBuilder::build`] binds the listener, [`Server::start`] serves
//! until failure or [`Server::stop`], and a stopped server cannot be
//! restarted.

use std::collections::HashMap;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bridge::{self, ProxyState};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::middleware::{MethodPath, ServerHandler, ServerLayer, assemble_server};
use crate::mux::{self, HttpSideListener, ListenAddr, PrefixedIo, Routed};
use crate::protocol::{
    CloseEnvelope, DataEnvelope, ErrorInfo, Frame, FrameCodec, FrameType, OpenEnvelope, codec,
};
use crate::stream::{BoxIo, CallMap, EVENT_BUFFER, FrameSink, FramedStream, StreamEvent};
use crate::stream::RpcStream;
use crate::tls::{self, ServerTlsOptions};

/// Local endpoint a server listens on.
#[derive(Debug, Clone)]
pub enum ListenOn {
    /// TCP socket address; port 0 binds an ephemeral port.
    Tcp(SocketAddr),
    /// Unix-domain socket path; any pre-existing file is replaced and the
    /// socket is restricted to owner-only permissions.
    #[cfg(unix)]
    Unix(PathBuf),
}

/// A service implementation registered with the server.
///
/// The server routes `/package.Service/Method` to the service whose
/// [`Service::name`] equals `package.Service`, passing the bare method name.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Fully-qualified service name, `package.Service`.
    fn name(&self) -> &str;

    /// Process one call on its stream.
    async fn call(&self, method: &str, stream: RpcStream) -> Result<()>;
}

/// Base of the server chain: route to the registered service.
struct Registry {
    services: HashMap<String, Arc<dyn Service>>,
}

#[async_trait]
impl ServerHandler for Registry {
    async fn handle_rpc(&self, stream: RpcStream, method: &str) -> Result<()> {
        let Some(path) = MethodPath::parse(method) else {
            return Err(crate::error::ProtocolError::InvalidMethod(method.to_string()).into());
        };
        let Some(service) = self.services.get(&path.qualified_service()) else {
            return Err(Error::UnknownService(path.qualified_service()));
        };
        service.call(path.method, stream).await
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    listen: Option<ListenOn>,
    services: Vec<Arc<dyn Service>>,
    layers: Vec<Arc<dyn ServerLayer>>,
    tls: Option<ServerTlsOptions>,
    http: bool,
    websocket: bool,
}

impl ServerBuilder {
    /// Create a builder with defaults: native RPC only, no TLS.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listen: None,
            services: Vec::new(),
            layers: Vec::new(),
            tls: None,
            http: false,
            websocket: false,
        }
    }

    /// Set the listen endpoint.
    #[must_use]
    pub fn listen(mut self, listen: ListenOn) -> Self {
        self.listen = Some(listen);
        self
    }

    /// Register a service implementation.
    #[must_use]
    pub fn service(mut self, service: impl Service) -> Self {
        self.services.push(Arc::new(service));
        self
    }

    /// Append a handler layer. Layers declared first run innermost.
    #[must_use]
    pub fn layer(mut self, layer: Arc<dyn ServerLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Terminate TLS on the listener.
    #[must_use]
    pub fn tls(mut self, opts: ServerTlsOptions) -> Self {
        self.tls = Some(opts);
        self
    }

    /// Share the listener with an HTTP/JSON bridge, demultiplexed by the
    /// protocol-selection header.
    #[must_use]
    pub const fn http(mut self, enabled: bool) -> Self {
        self.http = enabled;
        self
    }

    /// Wrap the HTTP bridge with the WebSocket streaming proxy. Implies
    /// HTTP support.
    #[must_use]
    pub const fn websocket(mut self, enabled: bool) -> Self {
        self.websocket = enabled;
        self
    }

    /// Bind the listener and assemble the handler chain.
    ///
    /// The middleware list is finalized here; the returned server is in the
    /// `Listening` state.
    ///
    /// # Errors
    ///
    /// Fails when no endpoint was configured, the bind fails, or TLS options
    /// do not build.
    pub async fn build(self) -> Result<Server> {
        let listen = self.listen.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "listen endpoint not specified",
            ))
        })?;

        let mut services = HashMap::new();
        for service in self.services {
            let name = service.name().to_string();
            if services.insert(name.clone(), service).is_some() {
                warn!(service = %name, "service registered twice; keeping the last");
            }
        }
        let chain = assemble_server(Arc::new(Registry { services }), &self.layers);

        let tls_acceptor = match &self.tls {
            Some(opts) => Some(TlsAcceptor::from(Arc::new(tls::server_config(opts)?))),
            None => None,
        };

        let (bound, local_addr) = Bound::bind(&listen).await?;
        info!(addr = %bound.describe(), tls = tls_acceptor.is_some(), http = self.http, "server listening");

        Ok(Server {
            listen,
            chain,
            listener: Mutex::new(Some(bound)),
            tls_acceptor,
            http: self.http || self.websocket,
            websocket: self.websocket,
            local_addr,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum Bound {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Bound {
    async fn bind(listen: &ListenOn) -> Result<(Self, Option<SocketAddr>)> {
        match listen {
            ListenOn::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                Ok((Self::Tcp(listener), Some(local)))
            }
            #[cfg(unix)]
            ListenOn::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                }
                Ok((Self::Unix(listener), None))
            }
        }
    }

    async fn accept(&self) -> std::io::Result<BoxIo> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "accepted connection");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _peer) = listener.accept().await?;
                debug!("accepted unix connection");
                Ok(Box::new(stream))
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map_or_else(|_| "tcp".to_string(), |a| a.to_string()),
            #[cfg(unix)]
            Self::Unix(_) => "unix".to_string(),
        }
    }
}

/// RPC server over one listener.
pub struct Server {
    listen: ListenOn,
    chain: Arc<dyn ServerHandler>,
    listener: Mutex<Option<Bound>>,
    tls_acceptor: Option<TlsAcceptor>,
    http: bool,
    websocket: bool,
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl Server {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The bound TCP address, when listening on TCP.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Serve until a task fails or [`Server::stop`] is called.
    ///
    /// Runs the RPC accept loop, the optional HTTP server, and the optional
    /// demultiplexer driver as one task group; the first error wins and
    /// cancels the siblings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on reuse, otherwise the first task
    /// failure.
    pub async fn start(&self) -> Result<()> {
        let bound = self
            .listener
            .lock()
            .take()
            .ok_or(Error::AlreadyStarted)?;

        let token = self.token.clone();
        let tracker = self.tracker.clone();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let (rpc_tx, mut rpc_rx) = mpsc::channel::<PrefixedIo>(64);
        let mut http_channel = if self.http {
            Some(mpsc::channel::<PrefixedIo>(64))
        } else {
            None
        };
        let http_tx = http_channel.as_ref().map(|(tx, _)| tx.clone());

        // Accept loop doubling as the demultiplexer driver.
        {
            let token = token.clone();
            let tracker = tracker.clone();
            let tls = self.tls_acceptor.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        accepted = bound.accept() => match accepted {
                            Ok(io) => {
                                let tls = tls.clone();
                                let rpc_tx = rpc_tx.clone();
                                let http_tx = http_tx.clone();
                                let token = token.clone();
                                tracker.spawn(async move {
                                    let io: BoxIo = match tls {
                                        Some(acceptor) => match acceptor.accept(io).await {
                                            Ok(stream) => Box::new(stream),
                                            Err(e) => {
                                                debug!(error = %e, "tls handshake failed");
                                                return;
                                            }
                                        },
                                        None => io,
                                    };
                                    if let Some(http_tx) = http_tx {
                                        match mux::sniff(io, &token).await {
                                            Some(Routed::Rpc(io)) => {
                                                let _ = rpc_tx.send(io).await;
                                            }
                                            Some(Routed::Http(io)) => {
                                                let _ = http_tx.send(io).await;
                                            }
                                            None => {}
                                        }
                                    } else {
                                        let _ = rpc_tx.send(PrefixedIo::bare(io)).await;
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "accept failed");
                                return Err(e.into());
                            }
                        }
                    }
                }
                Ok(())
            });
        }

        // Native RPC connections.
        {
            let chain = Arc::clone(&self.chain);
            let token = token.clone();
            let tracker = tracker.clone();
            tasks.spawn(async move {
                loop {
                    let io = tokio::select! {
                        () = token.cancelled() => None,
                        io = rpc_rx.recv() => io,
                    };
                    let Some(io) = io else { break };
                    let chain = Arc::clone(&chain);
                    let conn_token = token.child_token();
                    let conn_tracker = tracker.clone();
                    tracker.spawn(async move {
                        serve_connection(Box::new(io), chain, conn_token, conn_tracker).await;
                    });
                }
                Ok(())
            });
        }

        // HTTP bridge, optionally wrapped by the WebSocket proxy.
        if let Some((_http_tx, http_rx)) = http_channel.take() {
            let router = bridge::router(ProxyState {
                chain: Arc::clone(&self.chain),
                token: token.clone(),
                websocket: self.websocket,
            });
            let addr = ListenAddr(
                self.local_addr
                    .map_or_else(|| "unix".to_string(), |a| a.to_string()),
            );
            let listener = HttpSideListener::new(http_rx, addr);
            let shutdown = token.clone().cancelled_owned();
            tasks.spawn(async move {
                axum::serve(listener, router.into_make_service())
                    .with_graceful_shutdown(shutdown)
                    .await
                    .map_err(Error::Io)
            });
        }

        // Supervise: first task error wins; stop() cancels the token.
        let result = loop {
            tokio::select! {
                () = token.cancelled() => break Ok(()),
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => break Err(e),
                    Some(Err(join_error)) => break Err(Error::Internal(join_error.to_string())),
                    None => break Ok(()),
                }
            }
        };

        token.cancel();
        while tasks.join_next().await.is_some() {}
        self.tracker.close();
        self.tracker.wait().await;
        self.stopped.store(true, Ordering::SeqCst);
        self.cleanup();

        info!("server stopped");
        result
    }

    /// Stop the server: cancel every task, wait for them, and release the
    /// listener. Safe to call from any task, unblocks a pending
    /// [`Server::start`], and is idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("server stopping");
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        // Drop the listener if start() was never reached.
        self.listener.lock().take();
        self.cleanup();
    }

    fn cleanup(&self) {
        #[cfg(unix)]
        if let ListenOn::Unix(path) = &self.listen {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to remove socket file");
                }
            }
        }
        #[cfg(not(unix))]
        let _ = &self.listen;
    }
}

/// Drive one native RPC connection: demultiplex frames into per-call
/// streams and spawn the handler chain per call.
async fn serve_connection(
    io: BoxIo,
    chain: Arc<dyn ServerHandler>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let framed = Framed::new(io, FrameCodec::new());
    let (sink, mut frames) = framed.split();
    let sink: FrameSink = Arc::new(tokio::sync::Mutex::new(sink));
    let calls: CallMap = Arc::new(dashmap::DashMap::new());

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            frame = frames.next() => match frame {
                None => {
                    debug!("connection closed by peer");
                    break;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "connection frame error");
                    break;
                }
                Some(Ok(frame)) => match frame.frame_type {
                    FrameType::Open => match codec::decode::<OpenEnvelope>(&frame.payload) {
                        Ok(env) => spawn_call(env, &sink, &calls, &chain, &token, &tracker),
                        Err(e) => {
                            debug!(error = %e, "undecodable open envelope");
                            break;
                        }
                    },
                    FrameType::Data => {
                        if let Ok(env) = codec::decode::<DataEnvelope>(&frame.payload) {
                            let entry = calls.get(&env.id).map(|e| e.value().clone());
                            if let Some(tx) = entry {
                                // Suspends when the handler falls behind,
                                // backpressuring the whole connection.
                                let _ = tx.send(StreamEvent::Payload(env.payload.into())).await;
                            } else {
                                debug!(call_id = %env.id, "data for unknown call");
                            }
                        }
                    }
                    FrameType::Close => {
                        if let Ok(env) = codec::decode::<CloseEnvelope>(&frame.payload) {
                            if let Some((_, tx)) = calls.remove(&env.id) {
                                let _ = tx.send(StreamEvent::End(env.error)).await;
                            }
                        }
                    }
                    FrameType::Ping => {
                        let pong = Frame::new(FrameType::Ping, frame.payload);
                        if sink.lock().await.send(pong).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    calls.clear();
}

fn spawn_call(
    env: OpenEnvelope,
    sink: &FrameSink,
    calls: &CallMap,
    chain: &Arc<dyn ServerHandler>,
    conn_token: &CancellationToken,
    tracker: &TaskTracker,
) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    calls.insert(env.id, tx);

    let ctx = CallContext::from_parts(env.metadata, conn_token.child_token());
    let close_sent = Arc::new(AtomicBool::new(false));
    let stream = FramedStream::new(
        env.id,
        ctx.clone(),
        env.encoding,
        Arc::clone(sink),
        rx,
        Arc::clone(calls),
        Arc::clone(&close_sent),
    );

    let id = env.id;
    let method = env.method;
    let chain = Arc::clone(chain);
    let sink = Arc::clone(sink);
    let calls = Arc::clone(calls);
    tracker.spawn(async move {
        let result = chain.handle_rpc(Box::new(stream), &method).await;
        let error = result.err().map(|e| {
            warn!(method = %method, error = %e, "rpc handler failed");
            ErrorInfo {
                code: e.code().to_string(),
                message: e.to_string(),
            }
        });

        if !close_sent.swap(true, Ordering::SeqCst) {
            if let Ok(payload) = codec::encode(&CloseEnvelope { id, error }) {
                let _ = sink.lock().await.send(Frame::new(FrameType::Close, payload)).await;
            }
        }

        ctx.cancel();
        calls.remove(&id);
    });
}
