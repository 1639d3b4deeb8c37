use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rpc_tester_codec::{Frame, FrameCodec, FrameKind};
use rpc_tester_core::prelude::{DelegatedShutdownListener, ShutdownHandle};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;

use crate::incoming::Incoming;
use crate::protocol::RpcProtocol;
use crate::RpcError;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub tcp_nodelay: bool,
    /// How long [RpcServer::stop] waits for peers to close their connections before dropping
    /// them.
    pub stop_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Serves the verbs of an [RpcProtocol] on every connection that arrives on an [Incoming].
#[derive(Debug)]
pub struct RpcServer {
    accept: JoinHandle<()>,
    stopping: ShutdownHandle,
    stop_timeout: Duration,
}

impl RpcServer {
    /// Start accepting connections. Must be called from within a Tokio runtime.
    pub fn start(protocol: Arc<RpcProtocol>, options: ServerOptions, incoming: Incoming) -> Self {
        let stopping = ShutdownHandle::new();
        let accept = tokio::spawn(accept_connections(
            protocol,
            options,
            incoming,
            stopping.new_listener(),
        ));
        Self {
            accept,
            stopping,
            stop_timeout: options.stop_timeout,
        }
    }

    /// Stop accepting and let open connections finish, dropping any that are still open after
    /// the stop timeout.
    ///
    /// Replies that handlers have already produced are still delivered, so a peer that triggered
    /// the stop gets its answer.
    pub async fn stop(mut self) {
        self.stopping.shutdown();
        if tokio::time::timeout(self.stop_timeout, &mut self.accept)
            .await
            .is_err()
        {
            log::debug!(
                "Connections still open after {:?}, dropping them",
                self.stop_timeout
            );
            self.accept.abort();
            let _ = self.accept.await;
        }
    }
}

async fn accept_connections(
    protocol: Arc<RpcProtocol>,
    options: ServerOptions,
    mut incoming: Incoming,
    mut stopping: DelegatedShutdownListener,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stopping.wait_for_shutdown() => break,
            accepted = incoming.accept() => match accepted {
                Ok(Some(stream)) => {
                    if let Err(e) = stream.set_nodelay(options.tcp_nodelay) {
                        log::warn!("Failed to configure accepted connection: {e}");
                    }
                    let protocol = protocol.clone();
                    connections.spawn(async move {
                        let peer = stream.peer_addr().ok();
                        log::debug!("Accepted connection from {peer:?}");
                        match serve_connection(protocol, stream).await {
                            Ok(()) => log::debug!("Connection from {peer:?} closed"),
                            Err(e) => log::warn!("Connection from {peer:?} failed: {e}"),
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => log::warn!("Failed to accept connection: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn serve_connection(protocol: Arc<RpcProtocol>, stream: TcpStream) -> Result<(), RpcError> {
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::default()).split();
    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<Frame>();

    // Finishes once the reader and every in-flight handler have dropped their sender.
    let writer = async move {
        while let Some(reply) = replies_rx.recv().await {
            sink.send(reply).await?;
        }
        sink.close().await?;
        Ok::<_, RpcError>(())
    };

    let reader = async move {
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if frame.kind != FrameKind::Request {
                return Err(RpcError::UnexpectedFrame {
                    kind: frame.kind,
                    verb: frame.verb,
                });
            }

            match protocol.handler(frame.verb) {
                Some(handler) => {
                    let replies = replies_tx.clone();
                    tokio::spawn(async move {
                        let reply = match handler(frame.payload).await {
                            Ok(payload) => Frame::response(frame.verb, frame.id, payload),
                            Err(e) => Frame::error(frame.verb, frame.id, &e.to_string()),
                        };
                        let _ = replies.send(reply);
                    });
                }
                None => {
                    let err = RpcError::UnknownVerb(frame.verb);
                    let _ = replies_tx.send(Frame::error(frame.verb, frame.id, &err.to_string()));
                }
            }
        }
        Ok::<_, RpcError>(())
    };

    tokio::try_join!(reader, writer)?;

    Ok(())
}
