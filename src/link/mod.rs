//! Secure Link Module
//!
//! An authenticated, optionally encrypted packet link on top of a transport.
//!
//! Frame format (one transport frame each):
//! - `HELLO`      [1: 0x01] [N: bincode hello]
//! - `DATA`       [1: 0x03] [8: counter LE] [N: payload or ciphertext]
//! - `KEEPALIVE`  [1: 0x04]
//! - `CLOSE`      [1: 0x05]

mod cipher;
mod credentials;
mod handshake;

pub use cipher::SessionCipher;
pub use credentials::{
    generate_key, load_private_key, load_public_key, public_key_base64, save_private_key,
    save_public_key, save_signature, sign_public_key, CredentialPaths, Credentials,
};
pub use handshake::{classify, handshake, AuthMode, HandshakeOptions, HandshakeResult};

#[cfg(test)]
pub(crate) use credentials::write_test_credentials;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::addr::PeerSignature;
use crate::error::{Error, Result};
use crate::transport::{FrameReader, FrameWriter, Transport};

pub(crate) const FRAME_HELLO: u8 = 0x01;
pub(crate) const FRAME_DATA: u8 = 0x03;
pub(crate) const FRAME_KEEPALIVE: u8 = 0x04;
pub(crate) const FRAME_CLOSE: u8 = 0x05;

const DATA_HEADER_LEN: usize = 9;

/// Inbound packets buffered before the reader applies backpressure
const INBOUND_QUEUE: usize = 1024;

/// Time allowed for the close frame and transport shutdown
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Byte counters of one link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Bytes written to the transport, framing and overhead included
    pub raw_bytes_sent: u64,
    pub raw_bytes_received: u64,
    /// Packet payload bytes only
    pub data_bytes_sent: u64,
    pub data_bytes_received: u64,
}

#[derive(Default)]
struct Counters {
    raw_sent: AtomicU64,
    raw_received: AtomicU64,
    data_sent: AtomicU64,
    data_received: AtomicU64,
}

struct WriterState {
    /// Taken when the link shuts down
    writer: Option<Box<dyn FrameWriter>>,
    cipher: Option<SessionCipher>,
    counter: u64,
}

struct LinkShared {
    remote: String,
    peer_signature: PeerSignature,
    attestation: Option<Vec<u8>>,
    writer: Mutex<WriterState>,
    counters: Counters,
    closed: CancellationToken,
}

impl LinkShared {
    async fn write_raw(&self, frame: Bytes) -> Result<()> {
        let mut state = self.writer.lock().await;
        let writer = state.writer.as_mut().ok_or(Error::LinkClosed)?;
        let len = frame.len() as u64;
        if let Err(e) = writer.write_frame(frame).await {
            drop(state);
            self.closed.cancel();
            return Err(e);
        }
        self.counters.raw_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

/// Cloneable handle to a running link
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<LinkShared>,
}

impl LinkHandle {
    /// Send one packet to the peer
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LinkClosed);
        }

        let mut guard = self.shared.writer.lock().await;
        let state = &mut *guard;

        let counter = state.counter;
        state.counter += 1;

        let mut frame = BytesMut::with_capacity(DATA_HEADER_LEN + data.len() + 16);
        frame.put_u8(FRAME_DATA);
        frame.put_u64_le(counter);
        match &state.cipher {
            Some(cipher) => frame.extend_from_slice(&cipher.seal(counter, &data)?),
            None => frame.extend_from_slice(&data),
        }
        let frame = frame.freeze();
        let raw_len = frame.len() as u64;

        let writer = state.writer.as_mut().ok_or(Error::LinkClosed)?;
        if let Err(e) = writer.write_frame(frame).await {
            drop(guard);
            tracing::debug!("Send to {} failed: {}", self.shared.remote, e);
            self.close();
            return Err(e);
        }

        let counters = &self.shared.counters;
        counters.raw_sent.fetch_add(raw_len, Ordering::Relaxed);
        counters.data_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn peer_signature(&self) -> &PeerSignature {
        &self.shared.peer_signature
    }

    /// Attestation token the peer sent during the handshake
    pub fn attestation(&self) -> Option<&[u8]> {
        self.shared.attestation.as_deref()
    }

    pub fn remote(&self) -> &str {
        &self.shared.remote
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the link has closed
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Close the link; the reader task sends `CLOSE` and releases the transport
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.shared.counters;
        LinkStats {
            raw_bytes_sent: c.raw_sent.load(Ordering::Relaxed),
            raw_bytes_received: c.raw_received.load(Ordering::Relaxed),
            data_bytes_sent: c.data_sent.load(Ordering::Relaxed),
            data_bytes_received: c.data_received.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("remote", &self.shared.remote)
            .field("peer", &self.shared.peer_signature)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An established link: the handle plus the stream of received packets
pub struct Link {
    pub handle: LinkHandle,
    pub inbound: mpsc::Receiver<Bytes>,
}

impl Link {
    /// Spawn the reader and keepalive tasks for a handshaken transport
    pub(crate) fn start(
        transport: Transport,
        peer_signature: PeerSignature,
        attestation: Option<Vec<u8>>,
        cipher: Option<SessionCipher>,
        options: &HandshakeOptions,
    ) -> Self {
        let Transport {
            reader,
            writer,
            remote,
            ..
        } = transport;

        let shared = Arc::new(LinkShared {
            remote,
            peer_signature,
            attestation,
            writer: Mutex::new(WriterState {
                writer: Some(writer),
                cipher: cipher.clone(),
                counter: 0,
            }),
            counters: Counters::default(),
            closed: CancellationToken::new(),
        });

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(read_loop(shared.clone(), reader, cipher, tx, options.idle_timeout));
        tokio::spawn(keepalive_loop(shared.clone(), options.keepalive));

        Link {
            handle: LinkHandle { shared },
            inbound: rx,
        }
    }
}

async fn read_loop(
    shared: Arc<LinkShared>,
    mut reader: Box<dyn FrameReader>,
    mut cipher: Option<SessionCipher>,
    inbound: mpsc::Sender<Bytes>,
    idle_timeout: Duration,
) {
    let mut peer_closed = false;

    let reason = loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break "closed locally".to_string(),
            result = timeout(idle_timeout, reader.read_frame()) => match result {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => break "transport closed".to_string(),
                Ok(Err(e)) => break format!("read failed: {}", e),
                Err(_) => break format!("nothing received for {:?}", idle_timeout),
            },
        };

        shared.counters.raw_received.fetch_add(frame.len() as u64, Ordering::Relaxed);

        match frame.first() {
            Some(&FRAME_DATA) if frame.len() >= DATA_HEADER_LEN => {
                let counter = (&frame[1..DATA_HEADER_LEN]).get_u64_le();
                let payload = match cipher.as_mut() {
                    Some(c) => match c.open(counter, &frame[DATA_HEADER_LEN..]) {
                        Ok(plain) => Bytes::from(plain),
                        Err(e) => {
                            tracing::debug!("Dropping frame from {}: {}", shared.remote, e);
                            continue;
                        }
                    },
                    None => frame.slice(DATA_HEADER_LEN..),
                };

                shared
                    .counters
                    .data_received
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);

                tokio::select! {
                    _ = shared.closed.cancelled() => break "closed locally".to_string(),
                    sent = inbound.send(payload) => {
                        if sent.is_err() {
                            break "receiver dropped".to_string();
                        }
                    }
                }
            }
            Some(&FRAME_KEEPALIVE) => tracing::trace!("Keepalive from {}", shared.remote),
            Some(&FRAME_CLOSE) => {
                peer_closed = true;
                break "peer closed the link".to_string();
            }
            // Retransmitted hello over a datagram transport
            Some(&FRAME_HELLO) => {}
            _ => tracing::debug!("Ignoring malformed {} byte frame from {}", frame.len(), shared.remote),
        }
    };

    tracing::info!("Link to {} closed: {}", shared.remote, reason);
    shared.closed.cancel();

    let shutdown = async {
        let mut state = shared.writer.lock().await;
        if let Some(mut writer) = state.writer.take() {
            if !peer_closed {
                let _ = writer.write_frame(Bytes::from_static(&[FRAME_CLOSE])).await;
            }
            let _ = writer.shutdown().await;
        }
    };
    if timeout(CLOSE_GRACE, shutdown).await.is_err() {
        tracing::debug!("Transport to {} did not shut down cleanly", shared.remote);
    }
}

async fn keepalive_loop(shared: Arc<LinkShared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            _ = ticker.tick() => {
                if shared.write_raw(Bytes::from_static(&[FRAME_KEEPALIVE])).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Two handshaken links back to back over an in-memory transport
#[cfg(test)]
pub(crate) async fn link_pair(options: &HandshakeOptions) -> (Link, Link) {
    let ca = generate_key();
    let a = Credentials::issue(&ca, generate_key());
    let b = Credentials::issue(&ca, generate_key());
    let (ta, tb) = crate::transport::duplex_pair();
    let (la, lb) = tokio::join!(handshake(ta, &a, options), handshake(tb, &b, options));
    (la.unwrap(), lb.unwrap())
}
