//! One frame per UDP datagram

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::{FrameReader, FrameWriter, MAX_FRAME_LEN};
use crate::error::{Error, Result};

enum Source {
    /// Client side: a connected socket owned by this transport
    Socket(Arc<UdpSocket>),
    /// Server side: datagrams demultiplexed by the listener
    Channel(mpsc::Receiver<Bytes>),
}

/// Receiving half of a datagram transport
pub struct DatagramReader {
    source: Source,
    buf: Vec<u8>,
}

impl DatagramReader {
    pub fn connected(socket: Arc<UdpSocket>) -> Self {
        Self {
            source: Source::Socket(socket),
            buf: vec![0u8; MAX_FRAME_LEN],
        }
    }

    pub fn channel(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            source: Source::Channel(rx),
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl FrameReader for DatagramReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        match &mut self.source {
            Source::Socket(socket) => {
                let n = socket.recv(&mut self.buf).await?;
                Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
            }
            Source::Channel(rx) => Ok(rx.recv().await),
        }
    }
}

/// Sending half of a datagram transport
pub struct DatagramWriter {
    socket: Arc<UdpSocket>,
    /// `None` for connected sockets
    peer: Option<SocketAddr>,
    closed: bool,
}

impl DatagramWriter {
    pub fn connected(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            peer: None,
            closed: false,
        }
    }

    pub fn to_peer(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer: Some(peer),
            closed: false,
        }
    }
}

#[async_trait]
impl FrameWriter for DatagramWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        if self.closed {
            return Err(Error::Transport("datagram transport is shut down".into()));
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::Transport(format!("frame of {} bytes exceeds datagram limit", frame.len())));
        }
        match self.peer {
            Some(peer) => self.socket.send_to(&frame, peer).await?,
            None => self.socket.send(&frame).await?,
        };
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
