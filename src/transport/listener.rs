//! Transport listeners
//!
//! Each listener runs as its own task and pushes accepted transports into a
//! shared channel, so N listeners fan into one accept stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::{DatagramReader, DatagramWriter, Endpoint, Scheme, Transport, MAX_FRAME_LEN};
use crate::error::Result;

/// Datagrams queued per peer before new ones are dropped
const PEER_QUEUE: usize = 512;

/// A bound listener for one endpoint
pub enum Listener {
    Stream(TcpListener),
    Datagram(Arc<UdpSocket>),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let addr = endpoint.resolve().await?;
        match endpoint.scheme {
            Scheme::WebSocket => {
                let listener = TcpListener::bind(addr).await?;
                tracing::info!("Added stream listener at {}", listener.local_addr()?);
                Ok(Listener::Stream(listener))
            }
            Scheme::Udp => {
                let socket = UdpSocket::bind(addr).await?;
                tracing::info!("Added UDP listener at {}", socket.local_addr()?);
                Ok(Listener::Datagram(Arc::new(socket)))
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(match self {
            Listener::Stream(l) => l.local_addr()?,
            Listener::Datagram(s) => s.local_addr()?,
        })
    }

    /// Accept until shutdown or until the accept channel closes
    pub async fn run(self, accepted: mpsc::Sender<Transport>, shutdown: CancellationToken) {
        match self {
            Listener::Stream(listener) => run_stream(listener, accepted, shutdown).await,
            Listener::Datagram(socket) => run_datagram(socket, accepted, shutdown).await,
        }
    }
}

async fn run_stream(listener: TcpListener, accepted: mpsc::Sender<Transport>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!("set_nodelay failed for {}: {}", addr, e);
                        }
                        let transport = Transport::from_stream(socket, addr.to_string());
                        tracing::info!("Accepted {}", transport);
                        if accepted.send(transport).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    tracing::debug!("Stream listener stopped");
}

async fn run_datagram(socket: Arc<UdpSocket>, accepted: mpsc::Sender<Transport>, shutdown: CancellationToken) {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; MAX_FRAME_LEN];

    loop {
        let (len, src) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("UDP receive error: {}", e);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        let data = Bytes::copy_from_slice(&buf[..len]);

        // Known peer: hand the datagram to its transport
        let data = if let Some(tx) = peers.get(&src) {
            match tx.try_send(data) {
                Ok(()) => continue,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("Queue full for {}, dropping datagram", src);
                    continue;
                }
                // Transport was dropped; treat this datagram as a new peer
                Err(TrySendError::Closed(data)) => data,
            }
        } else {
            data
        };

        peers.retain(|_, tx| !tx.is_closed());

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        if tx.try_send(data).is_err() {
            continue;
        }
        peers.insert(src, tx);

        let transport = Transport::from_datagrams(
            DatagramReader::channel(rx),
            DatagramWriter::to_peer(socket.clone(), src),
            src.to_string(),
        );
        tracing::info!("Accepted {}", transport);
        if accepted.send(transport).await.is_err() {
            break;
        }
    }
    tracing::debug!("UDP listener stopped");
}
