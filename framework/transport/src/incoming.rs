use std::io;
use std::net::SocketAddr;

use rpc_tester_core::prelude::DelegatedShutdownListener;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A source of inbound connections for one shard's server.
#[derive(Debug)]
pub struct Incoming {
    inner: IncomingInner,
}

#[derive(Debug)]
enum IncomingInner {
    Listener(TcpListener),
    Distributed(mpsc::UnboundedReceiver<std::net::TcpStream>),
}

impl Incoming {
    /// Listen directly on an address, for a server that is the only one in its process.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            inner: IncomingInner::Listener(TcpListener::bind(addr).await?),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            IncomingInner::Listener(listener) => listener.local_addr().ok(),
            IncomingInner::Distributed(_) => None,
        }
    }

    /// The next connection, or `None` once no more connections will arrive.
    pub async fn accept(&mut self) -> io::Result<Option<TcpStream>> {
        match &mut self.inner {
            IncomingInner::Listener(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Some(stream))
            }
            IncomingInner::Distributed(receiver) => match receiver.recv().await {
                Some(stream) => TcpStream::from_std(stream).map(Some),
                None => Ok(None),
            },
        }
    }
}

/// Owns the listening socket of a process and hands accepted connections to shards in
/// round-robin order, so that as many client shards as there are server shards end up with one
/// connection per server shard.
#[derive(Debug)]
pub struct ConnectionDistributor {
    listener: std::net::TcpListener,
    shards: Vec<mpsc::UnboundedSender<std::net::TcpStream>>,
}

impl ConnectionDistributor {
    pub fn bind(addr: SocketAddr, shards: usize) -> io::Result<(Self, Vec<Incoming>)> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let (senders, incoming): (Vec<_>, Vec<_>) = (0..shards.max(1))
            .map(|_| {
                let (sender, receiver) = mpsc::unbounded_channel();
                (
                    sender,
                    Incoming {
                        inner: IncomingInner::Distributed(receiver),
                    },
                )
            })
            .unzip();

        Ok((
            Self {
                listener,
                shards: senders,
            },
            incoming,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown signal is received. Must be run inside a Tokio
    /// runtime, which does not have to be one of the shards' runtimes.
    pub async fn run(self, mut shutdown_listener: DelegatedShutdownListener) -> io::Result<()> {
        let listener = TcpListener::from_std(self.listener)?;
        let shards = self.shards;
        let mut next = 0;

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Failed to accept connection: {e}");
                        continue;
                    }
                },
                _ = shutdown_listener.wait_for_shutdown() => break,
            };

            let mut stream = stream.into_std()?;
            let mut assigned = None;
            for _ in 0..shards.len() {
                let shard = next;
                next = (next + 1) % shards.len();
                match shards[shard].send(stream) {
                    Ok(()) => {
                        assigned = Some(shard);
                        break;
                    }
                    // That shard has stopped serving, try the next one.
                    Err(mpsc::error::SendError(returned)) => stream = returned,
                }
            }

            match assigned {
                Some(shard) => log::debug!("Assigned connection from {peer} to shard {shard}"),
                None => log::warn!("No shard is serving, dropped connection from {peer}"),
            }
        }

        log::debug!("Stopped accepting connections");
        Ok(())
    }
}
