//! Duplex message stream abstraction.
//!
//! A stream is a sequence of opaque messages in each direction, bound to a
//! [`CallContext`]. Two implementations exist: [`FramedStream`] over a framed
//! network connection (one call multiplexed onto it by id), and
//! [`PairStream`] for in-process use by the HTTP bridge and tests. The
//! WebSocket proxy supplies a third implementation over an upgraded socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::SinkExt;
use futures::stream::SplitSink;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::Framed;
use tracing::debug;
use uuid::Uuid;

use crate::context::CallContext;
use crate::error::{ConnectionError, Error, ProtocolError, Result};
use crate::protocol::{
    CloseEnvelope, DataEnvelope, Encoding, ErrorInfo, Frame, FrameCodec, FrameType, codec,
};

/// Byte-stream transport a connection runs over.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Boxed transport; TCP, unix socket, or either wrapped in TLS.
pub(crate) type BoxIo = Box<dyn Io>;

/// Shared write half of a framed connection.
pub(crate) type FrameSink = Arc<Mutex<SplitSink<Framed<BoxIo, FrameCodec>, Frame>>>;

/// Routing table from call id to that call's inbound event queue.
pub(crate) type CallMap = Arc<DashMap<Uuid, mpsc::Sender<StreamEvent>>>;

/// Capacity of a single call's inbound queue.
pub(crate) const EVENT_BUFFER: usize = 64;

/// Inbound event routed to one call.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// A data message.
    Payload(Bytes),
    /// The remote side closed its direction, possibly reporting failure.
    End(Option<ErrorInfo>),
}

/// A duplex, message-oriented exchange bound to a cancellable context.
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// The context this stream is bound to.
    fn context(&self) -> &CallContext;

    /// Payload encoding negotiated for this call.
    fn encoding(&self) -> Encoding;

    /// Send one message.
    async fn send(&self, message: Bytes) -> Result<()>;

    /// Receive the next message; `Ok(None)` signals a clean end of stream.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Close this side's sending direction. Idempotent.
    async fn close_send(&self) -> Result<()>;

    /// Close the stream in both directions. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Boxed stream handed through handler chains.
pub type RpcStream = Box<dyn MessageStream>;

/// One call multiplexed onto a framed connection.
///
/// Outbound messages are written as `Data` frames through the connection's
/// shared sink; inbound events arrive on a per-call queue fed by the
/// connection's driver task.
pub(crate) struct FramedStream {
    id: Uuid,
    ctx: CallContext,
    encoding: Encoding,
    sink: FrameSink,
    events: Mutex<mpsc::Receiver<StreamEvent>>,
    calls: CallMap,
    close_sent: Arc<AtomicBool>,
    remote_done: AtomicBool,
}

impl FramedStream {
    pub(crate) fn new(
        id: Uuid,
        ctx: CallContext,
        encoding: Encoding,
        sink: FrameSink,
        events: mpsc::Receiver<StreamEvent>,
        calls: CallMap,
        close_sent: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            ctx,
            encoding,
            sink,
            events: Mutex::new(events),
            calls,
            close_sent,
            remote_done: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessageStream for FramedStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    async fn send(&self, message: Bytes) -> Result<()> {
        if self.close_sent.load(Ordering::SeqCst) {
            return Err(ProtocolError::SendAfterClose.into());
        }
        if self.ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let payload = codec::encode(&DataEnvelope {
            id: self.id,
            payload: message.to_vec(),
        })?;
        let frame = Frame::new(FrameType::Data, payload);

        tokio::select! {
            () = self.ctx.cancelled() => Err(Error::Cancelled),
            res = async { self.sink.lock().await.send(frame).await } => res.map_err(Error::Io),
        }
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        if self.remote_done.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut events = self.events.lock().await;
        tokio::select! {
            () = self.ctx.cancelled() => Err(Error::Cancelled),
            event = events.recv() => match event {
                Some(StreamEvent::Payload(bytes)) => Ok(Some(bytes)),
                Some(StreamEvent::End(None)) => {
                    self.remote_done.store(true, Ordering::SeqCst);
                    Ok(None)
                }
                Some(StreamEvent::End(Some(info))) => {
                    self.remote_done.store(true, Ordering::SeqCst);
                    Err(Error::Remote {
                        code: info.code,
                        message: info.message,
                    })
                }
                None => Err(ConnectionError::Closed.into()),
            },
        }
    }

    async fn close_send(&self) -> Result<()> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let payload = codec::encode(&CloseEnvelope {
            id: self.id,
            error: None,
        })?;
        self.sink
            .lock()
            .await
            .send(Frame::new(FrameType::Close, payload))
            .await
            .map_err(Error::Io)
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.close_send().await {
            debug!(call_id = %self.id, error = %e, "close frame not delivered");
        }
        self.calls.remove(&self.id);
        self.ctx.cancel();
        Ok(())
    }
}

impl Drop for FramedStream {
    fn drop(&mut self) {
        self.calls.remove(&self.id);
        self.ctx.cancel();
    }
}

/// In-process stream pair; what one half sends, the other receives.
///
/// Used by the HTTP bridge to run a unary exchange through the handler chain
/// without a socket, and by tests exercising middleware.
pub struct PairStream {
    ctx: CallContext,
    encoding: Encoding,
    tx: mpsc::Sender<StreamEvent>,
    rx: Mutex<mpsc::Receiver<StreamEvent>>,
    close_sent: AtomicBool,
    remote_done: AtomicBool,
}

impl PairStream {
    /// Create a cross-wired pair of stream halves sharing one context.
    #[must_use]
    pub fn pair(ctx: CallContext, encoding: Encoding) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(EVENT_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(EVENT_BUFFER);
        let a = Self {
            ctx: ctx.clone(),
            encoding,
            tx: a_tx,
            rx: Mutex::new(b_rx),
            close_sent: AtomicBool::new(false),
            remote_done: AtomicBool::new(false),
        };
        let b = Self {
            ctx,
            encoding,
            tx: b_tx,
            rx: Mutex::new(a_rx),
            close_sent: AtomicBool::new(false),
            remote_done: AtomicBool::new(false),
        };
        (a, b)
    }
}

#[async_trait]
impl MessageStream for PairStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    async fn send(&self, message: Bytes) -> Result<()> {
        if self.close_sent.load(Ordering::SeqCst) {
            return Err(ProtocolError::SendAfterClose.into());
        }
        self.tx
            .send(StreamEvent::Payload(message))
            .await
            .map_err(|_| ConnectionError::Closed.into())
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        if self.remote_done.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            () = self.ctx.cancelled() => Err(Error::Cancelled),
            event = rx.recv() => match event {
                Some(StreamEvent::Payload(bytes)) => Ok(Some(bytes)),
                Some(StreamEvent::End(None)) => {
                    self.remote_done.store(true, Ordering::SeqCst);
                    Ok(None)
                }
                Some(StreamEvent::End(Some(info))) => {
                    self.remote_done.store(true, Ordering::SeqCst);
                    Err(Error::Remote {
                        code: info.code,
                        message: info.message,
                    })
                }
                None => Err(ConnectionError::Closed.into()),
            },
        }
    }

    async fn close_send(&self) -> Result<()> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.tx.send(StreamEvent::End(None)).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_send().await?;
        self.ctx.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_messages_and_end_of_stream() {
        let (a, b) = PairStream::pair(CallContext::new(), Encoding::Json);

        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();
        a.close_send().await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(b.recv().await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(b.recv().await.unwrap(), None);
        // End of stream is sticky.
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_after_close_send_fails() {
        let (a, _b) = PairStream::pair(CallContext::new(), Encoding::Json);
        a.close_send().await.unwrap();
        let err = a.send(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::SendAfterClose)
        ));
    }

    #[tokio::test]
    async fn cancelled_context_unblocks_receive() {
        let ctx = CallContext::new();
        let (_a, b) = PairStream::pair(ctx.clone(), Encoding::Json);

        let recv = tokio::spawn(async move { b.recv().await });
        tokio::task::yield_now().await;
        ctx.cancel();

        let err = recv.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
