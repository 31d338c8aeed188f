//! Server-side session for one connected client

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::routing::Route;
use crate::addr::{Ipv4Cidr, PeerSignature, VirtualAddress};
use crate::error::{Error, Result};
use crate::link::{self, CredentialPaths, Credentials, HandshakeOptions, LinkHandle};
use crate::packet;
use crate::transport::Transport;
use crate::tun::TunInterface;

/// One client's secure link plus its relay into the virtual interface
pub struct ClientSession {
    remote: String,
    transport: Mutex<Option<Transport>>,
    credentials: CredentialPaths,
    options: HandshakeOptions,
    tun: Arc<TunInterface>,
    private_range: Ipv4Cidr,
    link: OnceLock<LinkHandle>,
    address: Arc<OnceLock<VirtualAddress>>,
    cancel: CancellationToken,
}

impl ClientSession {
    pub fn new(
        transport: Transport,
        credentials: CredentialPaths,
        tun: Arc<TunInterface>,
        private_range: Ipv4Cidr,
    ) -> Self {
        Self {
            remote: transport.remote.clone(),
            transport: Mutex::new(Some(transport)),
            credentials,
            options: HandshakeOptions::default(),
            tun,
            private_range,
            link: OnceLock::new(),
            address: Arc::new(OnceLock::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: HandshakeOptions) -> Self {
        self.options = options;
        self
    }

    /// Load credentials, run the handshake and start relaying
    pub async fn init(&self) -> Result<()> {
        let result = self.try_init().await;
        if let Err(e) = &result {
            tracing::warn!("Session from {} failed to start: {}", self.remote, e);
            self.end();
        }
        result
    }

    async fn try_init(&self) -> Result<()> {
        let transport = self
            .transport
            .lock()
            .map_err(|_| Error::Link("session state poisoned".into()))?
            .take()
            .ok_or_else(|| Error::Link("session already initialised".into()))?;

        let credentials = Credentials::load(&self.credentials)?;
        let link = link::handshake(transport, &credentials, &self.options).await?;

        if self.cancel.is_cancelled() {
            link.handle.close();
            return Err(Error::Cancelled);
        }

        match link.handle.attestation() {
            Some(token) => tracing::info!(
                "Client {} authenticated as {} (attestation {})",
                self.remote,
                link.handle.peer_signature(),
                hex::encode(token)
            ),
            None => tracing::info!(
                "Client {} authenticated as {}",
                self.remote,
                link.handle.peer_signature()
            ),
        }

        let handle = link.handle.clone();
        if self.link.set(link.handle).is_err() {
            handle.close();
            return Err(Error::Link("session already initialised".into()));
        }

        tokio::spawn(relay_to_device(
            handle,
            link.inbound,
            self.tun.clone(),
            self.address.clone(),
            self.private_range,
            self.cancel.clone(),
        ));
        Ok(())
    }

    /// Send a packet to the client
    pub async fn write_packet(&self, packet: Bytes) -> Result<()> {
        match self.link.get() {
            Some(link) => link.send(packet).await,
            None => Err(Error::LinkClosed),
        }
    }

    /// Close the link and stop the relay; safe before `init`
    pub fn end(&self) {
        self.cancel.cancel();
        if let Some(link) = self.link.get() {
            link.close();
        }
    }

    pub fn link(&self) -> Option<&LinkHandle> {
        self.link.get()
    }
}

async fn relay_to_device(
    link: LinkHandle,
    mut inbound: mpsc::Receiver<Bytes>,
    tun: Arc<TunInterface>,
    address: Arc<OnceLock<VirtualAddress>>,
    private_range: Ipv4Cidr,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = inbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        if address.get().is_none() {
            if let Some(source) = packet::source(&packet).filter(|s| private_range.contains(*s)) {
                if address.set(source).is_ok() {
                    tracing::info!("Client {} announced {}", link.remote(), source);
                }
            }
        }

        if let Err(e) = tun.write(&packet).await {
            tracing::debug!("Dropping packet from {}: {}", link.remote(), e);
        }
    }

    link.close();
    tracing::debug!("Relay for {} stopped", link.remote());
}

#[async_trait]
impl Route for ClientSession {
    fn address(&self) -> Option<VirtualAddress> {
        self.address.get().copied()
    }

    fn signature(&self) -> Option<&PeerSignature> {
        self.link.get().map(|link| link.peer_signature())
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.link.get().map_or(false, |link| link.is_closed())
    }

    fn close(&self) {
        self.end();
    }

    async fn write_packet(&self, packet: Bytes) -> Result<()> {
        ClientSession::write_packet(self, packet).await
    }

    fn describe(&self) -> String {
        match self.address.get() {
            Some(address) => format!("{} ({})", self.remote, address),
            None => self.remote.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{generate_key, handshake, write_test_credentials, Link};
    use crate::packet::tests::ipv4_packet;
    use crate::transport::duplex_pair;
    use crate::tun::{MemoryHost, MemoryOpener, TunParams};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        session: ClientSession,
        peer: Link,
        host: MemoryHost,
        _dir: tempfile::TempDir,
    }

    fn memory_tun() -> (Arc<TunInterface>, MemoryHost) {
        let (opener, host) = MemoryOpener::new();
        let params = TunParams {
            name: None,
            address: Ipv4Addr::new(10, 0, 0, 1),
            prefix: 24,
            mtu: 1400,
        };
        (Arc::new(TunInterface::open(opener, params).unwrap()), host)
    }

    fn range() -> Ipv4Cidr {
        "10.0.0.0/24".parse().unwrap()
    }

    async fn connected() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ca = generate_key();
        let paths = write_test_credentials(dir.path(), &ca, "server");
        let client = Credentials::issue(&ca, generate_key());
        let (tun, host) = memory_tun();

        let (server_side, client_side) = duplex_pair();
        let session = ClientSession::new(server_side, paths, tun, range());
        let options = HandshakeOptions::default();
        let (init, peer) = tokio::join!(session.init(), handshake(client_side, &client, &options));
        init.unwrap();

        Fixture {
            session,
            peer: peer.unwrap(),
            host,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_inbound_packets_reach_device_and_set_address() {
        let mut f = connected().await;
        assert_eq!(f.session.address(), None);

        // Outside the private range: relayed but not taken as the address
        let foreign = ipv4_packet(Ipv4Addr::new(192, 168, 1, 4), Ipv4Addr::new(10, 0, 0, 1), 6, 40);
        f.peer.handle.send(Bytes::from(foreign.clone())).await.unwrap();
        assert_eq!(f.host.next_written().await.unwrap(), foreign);
        assert_eq!(f.session.address(), None);

        let own = ipv4_packet(Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(10, 0, 0, 1), 6, 40);
        f.peer.handle.send(Bytes::from(own.clone())).await.unwrap();
        assert_eq!(f.host.next_written().await.unwrap(), own);
        assert_eq!(f.session.address(), Some(Ipv4Addr::new(10, 0, 0, 7)));

        // First address sticks
        let other = ipv4_packet(Ipv4Addr::new(10, 0, 0, 8), Ipv4Addr::new(10, 0, 0, 1), 6, 40);
        f.peer.handle.send(Bytes::from(other)).await.unwrap();
        f.host.next_written().await.unwrap();
        assert_eq!(f.session.address(), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(f.session.describe(), "memory-a (10.0.0.7)");
    }

    #[tokio::test]
    async fn test_write_packet_reaches_client() {
        let mut f = connected().await;
        let pkt = Bytes::from(ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 7), 17, 60));
        f.session.write_packet(pkt.clone()).await.unwrap();
        assert_eq!(f.peer.inbound.recv().await.unwrap(), pkt);
        assert!(f.session.signature().is_some());
    }

    #[tokio::test]
    async fn test_end_closes_link() {
        let f = connected().await;
        f.session.end();
        assert!(f.session.is_closed());
        timeout(Duration::from_secs(2), f.peer.handle.closed()).await.unwrap();
        assert!(matches!(
            f.session.write_packet(Bytes::from_static(b"x")).await,
            Err(Error::LinkClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_marks_session_closed() {
        let f = connected().await;
        f.peer.handle.close();
        timeout(Duration::from_secs(2), f.session.link().unwrap().closed()).await.unwrap();
        assert!(f.session.is_closed());
    }

    #[tokio::test]
    async fn test_end_before_init() {
        let (tun, _host) = memory_tun();
        let (transport, _other) = duplex_pair();
        let paths = CredentialPaths::new("/nonexistent/ca", "/nonexistent/k", "/nonexistent/s");
        let session = ClientSession::new(transport, paths, tun, range());

        session.end();
        assert!(session.is_closed());
        assert!(session.signature().is_none());
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_init() {
        let (tun, _host) = memory_tun();
        let (transport, _other) = duplex_pair();
        let paths = CredentialPaths::new("/nonexistent/ca", "/nonexistent/k", "/nonexistent/s");
        let session = ClientSession::new(transport, paths, tun, range());

        assert!(matches!(session.init().await, Err(Error::Credentials(_))));
        assert!(session.is_closed());
        // A second attempt has no transport left
        assert!(session.init().await.is_err());
    }
}
