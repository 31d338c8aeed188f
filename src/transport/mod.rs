//! Transport Module
//!
//! Byte transports that carry secure-link frames. `ws://` endpoints use a
//! TCP stream with length-delimited frames, `udp://` endpoints carry one
//! frame per datagram.

mod datagram;
mod endpoint;
mod listener;
mod stream;

pub use datagram::{DatagramReader, DatagramWriter};
pub use endpoint::{Endpoint, Scheme};
pub use listener::Listener;
pub use stream::{frame_codec, MAX_FRAME_LEN};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Receiving half of a transport
#[async_trait]
pub trait FrameReader: Send {
    /// Next frame, or `None` once the peer has gone away
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;
}

/// Sending half of a transport
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Flush and release the underlying connection
    async fn shutdown(&mut self) -> Result<()>;
}

/// How a transport moves frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Datagram => write!(f, "datagram"),
        }
    }
}

/// An accepted or connected byte transport, split into halves
pub struct Transport {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    pub remote: String,
    pub kind: TransportKind,
}

impl Transport {
    /// Wrap any byte stream with length-delimited framing
    pub fn from_stream<S>(io: S, remote: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = stream::framed(io);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote: remote.into(),
            kind: TransportKind::Stream,
        }
    }

    /// Wrap a datagram reader/writer pair
    pub fn from_datagrams(reader: DatagramReader, writer: DatagramWriter, remote: impl Into<String>) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote: remote.into(),
            kind: TransportKind::Datagram,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} transport to {}", self.kind, self.remote)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("remote", &self.remote)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Open a transport to an endpoint, picking stream or datagram by scheme
pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Transport> {
    let addr = endpoint.resolve().await?;

    match endpoint.scheme {
        Scheme::WebSocket => {
            tracing::info!("Connecting to {} over a stream transport", endpoint);
            let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(Error::ConnectionFailed {
                        address: addr.to_string(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => return Err(Error::ConnectionTimeout(addr.to_string())),
            };
            stream.set_nodelay(true)?;
            Ok(Transport::from_stream(stream, addr.to_string()))
        }
        Scheme::Udp => {
            tracing::info!("Connecting to {} over UDP", endpoint);
            let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await.map_err(|e| Error::ConnectionFailed {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
            let socket = std::sync::Arc::new(socket);
            Ok(Transport::from_datagrams(
                DatagramReader::connected(socket.clone()),
                DatagramWriter::connected(socket),
                addr.to_string(),
            ))
        }
    }
}

/// Two transports joined back to back in memory
#[cfg(test)]
pub(crate) fn duplex_pair() -> (Transport, Transport) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        Transport::from_stream(a, "memory-a"),
        Transport::from_stream(b, "memory-b"),
    )
}
