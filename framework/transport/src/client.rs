use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rpc_tester_codec::{
    decode_payload, encode_payload, Frame, FrameCodec, FrameKind, WireDecode, WireEncode,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::RpcError;

type FramedStream = Framed<TcpStream, FrameCodec>;
type PendingReply = oneshot::Sender<Result<Bytes, RpcError>>;

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub tcp_nodelay: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { tcp_nodelay: true }
    }
}

#[derive(Default)]
struct PendingCalls {
    closed: bool,
    calls: HashMap<u64, PendingReply>,
}

struct ClientInner {
    peer: SocketAddr,
    next_id: AtomicU64,
    pending: Mutex<PendingCalls>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    /// Fail every call that is still waiting and refuse new ones.
    fn close_pending(&self) {
        let calls = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.calls)
        };
        for (_, reply) in calls {
            let _ = reply.send(Err(RpcError::ConnectionClosed));
        }
    }
}

/// A connection to one peer. Calls from any number of tasks are multiplexed over it, each
/// matched to its reply by message id.
///
/// Cloning gives another handle to the same connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.inner.peer)
            .finish()
    }
}

impl RpcClient {
    pub async fn connect(addr: SocketAddr, options: ClientOptions) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(options.tcp_nodelay)?;
        log::debug!("Connected to {addr}");

        Ok(Self::from_stream(stream, addr))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        let (sink, frames) = Framed::new(stream, FrameCodec::default()).split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            peer,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingCalls::default()),
            outbound: Mutex::new(Some(outbound)),
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let writer = tokio::spawn(write_frames(inner.clone(), sink, outbound_rx));
        let reader = tokio::spawn(read_frames(inner.clone(), frames));
        inner.tasks.lock().extend([writer, reader]);

        Self { inner }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Send one request and wait for its reply.
    pub async fn call<A, R>(&self, verb: impl Into<i32>, arg: &A) -> Result<R, RpcError>
    where
        A: WireEncode + ?Sized,
        R: WireDecode,
    {
        let verb = verb.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(RpcError::ConnectionClosed);
            }
            pending.calls.insert(id, reply_tx);
        }

        let frame = Frame::request(verb, id, encode_payload(arg));
        let sent = self
            .inner
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|outbound| outbound.send(frame).is_ok());
        if !sent {
            self.inner.pending.lock().calls.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        let payload = reply_rx.await.map_err(|_| RpcError::ConnectionClosed)??;

        Ok(decode_payload(payload)?)
    }

    /// Flush queued requests and close the connection. Calls still waiting for a reply fail
    /// with [RpcError::ConnectionClosed].
    pub async fn stop(&self) {
        drop(self.inner.outbound.lock().take());

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let mut tasks = tasks.into_iter();
        if let Some(writer) = tasks.next() {
            let _ = writer.await;
        }
        for reader in tasks {
            reader.abort();
            let _ = reader.await;
        }

        self.inner.close_pending();
        log::debug!("Closed connection to {}", self.inner.peer);
    }
}

async fn write_frames(
    inner: Arc<ClientInner>,
    mut sink: SplitSink<FramedStream, Frame>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        // Batch whatever else is already queued into the same flush.
        let mut result = sink.feed(frame).await;
        while result.is_ok() {
            match outbound.try_recv() {
                Ok(next) => result = sink.feed(next).await,
                Err(_) => break,
            }
        }
        let result = match result {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("Failed to send to {}: {e}", inner.peer);
            inner.close_pending();
            return;
        }
    }

    if let Err(e) = sink.close().await {
        log::debug!("Failed to close connection to {}: {e}", inner.peer);
    }
}

async fn read_frames(inner: Arc<ClientInner>, mut frames: SplitStream<FramedStream>) {
    let outcome = loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(RpcError::from(e)),
            None => break Ok(()),
        };

        let reply = match frame.kind {
            FrameKind::Response => Ok(frame.payload),
            FrameKind::Error => Err(RpcError::Remote(
                decode_payload::<String>(frame.payload)
                    .unwrap_or_else(|e| format!("Undecodable error message: {e}")),
            )),
            FrameKind::Request => {
                break Err(RpcError::UnexpectedFrame {
                    kind: frame.kind,
                    verb: frame.verb,
                })
            }
        };

        let waiting = inner.pending.lock().calls.remove(&frame.id);
        match waiting {
            Some(reply_tx) => {
                let _ = reply_tx.send(reply);
            }
            None => log::debug!("Dropping reply to unknown or abandoned call {}", frame.id),
        }
    };

    match outcome {
        Ok(()) => log::debug!("Connection to {} closed by peer", inner.peer),
        Err(e) => log::warn!("Connection to {} failed: {e}", inner.peer),
    }
    inner.close_pending();
}
