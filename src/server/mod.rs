//! Server Module
//!
//! Accepts client links on every configured listener, promotes sessions into
//! the routing table as their addresses appear, and dispatches packets read
//! from the virtual interface to the session owning the destination.

mod routing;
mod session;

pub use routing::{ResolveReport, Route, RoutingTable};
pub use session::ClientSession;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::addr::Ipv4Cidr;
use crate::config::WarpdriveConfig;
use crate::error::{Error, Result};
use crate::link::{classify, AuthMode, CredentialPaths, HandshakeOptions, HandshakeResult};
use crate::transport::{Listener, Transport};
use crate::tun::TunInterface;

/// Pause before retrying the device after it failed to reopen
const DEVICE_RETRY: Duration = Duration::from_millis(500);

/// The hub of the private network
pub struct Server {
    config: Arc<WarpdriveConfig>,
    credentials: CredentialPaths,
    options: HandshakeOptions,
    private_range: Ipv4Cidr,
    tun: Arc<TunInterface>,
    table: Arc<RoutingTable<ClientSession>>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: Arc<WarpdriveConfig>, tun: Arc<TunInterface>, shutdown: CancellationToken) -> Result<Self> {
        let security = &config.security;
        let credentials = CredentialPaths::new(security.ca_path.clone(), config.key_path(), config.signature_path());
        let options = HandshakeOptions {
            encrypt: security.encrypt,
            auth: AuthMode::from_flags(security.auth, security.ignore_auth),
            timeout: config.handshake_timeout(),
            ..HandshakeOptions::default()
        };

        Ok(Self {
            private_range: config.private_range()?,
            config,
            credentials,
            options,
            tun,
            table: Arc::new(RoutingTable::new()),
            shutdown,
        })
    }

    pub fn table(&self) -> Arc<RoutingTable<ClientSession>> {
        self.table.clone()
    }

    /// Bind every configured listen endpoint
    pub async fn bind(&self) -> Result<Vec<Listener>> {
        let mut listeners = Vec::new();
        for endpoint in self.config.listen_endpoints()? {
            match Listener::bind(&endpoint).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => tracing::error!("Cannot listen on {}: {}", endpoint, e),
            }
        }
        if listeners.is_empty() {
            return Err(Error::Config("no listener could be started".into()));
        }
        Ok(listeners)
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Serve on already bound listeners until shutdown
    pub async fn serve(&self, listeners: Vec<Listener>) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.config.server.accept_backlog.max(1));
        for listener in listeners {
            tokio::spawn(listener.run(tx.clone(), self.shutdown.child_token()));
        }
        drop(tx);

        let accept = tokio::spawn(accept_loop(
            rx,
            SessionFactory {
                credentials: self.credentials.clone(),
                options: self.options.clone(),
                private_range: self.private_range,
                tun: self.tun.clone(),
            },
            self.table.clone(),
            self.config.handshake_timeout(),
            self.shutdown.clone(),
        ));
        let resolve = tokio::spawn(resolve_loop(
            self.table.clone(),
            self.config.resolve_interval(),
            self.shutdown.clone(),
        ));
        let dispatch = tokio::spawn(dispatch_loop(
            self.tun.clone(),
            self.table.clone(),
            self.shutdown.clone(),
        ));

        tracing::info!("Server running");
        self.shutdown.cancelled().await;

        tracing::info!("Server shutting down");
        self.table.close_all().await;
        let _ = tokio::join!(accept, resolve, dispatch);
        Ok(())
    }
}

#[derive(Clone)]
struct SessionFactory {
    credentials: CredentialPaths,
    options: HandshakeOptions,
    private_range: Ipv4Cidr,
    tun: Arc<TunInterface>,
}

impl SessionFactory {
    fn create(&self, transport: Transport) -> ClientSession {
        ClientSession::new(transport, self.credentials.clone(), self.tun.clone(), self.private_range)
            .with_options(self.options.clone())
    }
}

async fn accept_loop(
    mut accepted: mpsc::Receiver<Transport>,
    factory: SessionFactory,
    table: Arc<RoutingTable<ClientSession>>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let transport = tokio::select! {
            _ = shutdown.cancelled() => break,
            transport = accepted.recv() => match transport {
                Some(transport) => transport,
                None => break,
            },
        };

        let session = factory.create(transport);
        let table = table.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let init = tokio::select! {
                _ = shutdown.cancelled() => {
                    session.end();
                    return;
                }
                init = timeout(handshake_timeout, session.init()) => init,
            };
            match init.as_ref().map(classify) {
                Ok(HandshakeResult::Successful) => table.add_unenumerated(Arc::new(session)).await,
                Ok(HandshakeResult::Failed(reason)) => {
                    tracing::debug!("Dropping session {}: {}", session.describe(), reason)
                }
                Err(_) => {
                    tracing::warn!("Handshake with {} timed out", session.describe());
                    session.end();
                }
            }
        });
    }
    tracing::debug!("Accept loop stopped");
}

async fn resolve_loop(table: Arc<RoutingTable<ClientSession>>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = table.resolve().await;
                if report.promoted > 0 || report.evicted > 0 {
                    tracing::debug!(
                        "Resolve pass: {} promoted, {} evicted, {} routes",
                        report.promoted,
                        report.evicted,
                        table.len().await
                    );
                }
            }
        }
    }
    tracing::debug!("Resolve loop stopped");
}

async fn dispatch_loop(tun: Arc<TunInterface>, table: Arc<RoutingTable<ClientSession>>, shutdown: CancellationToken) {
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = tun.read() => read,
        };

        match read {
            Ok(packet) if packet.is_empty() => {}
            Ok(packet) => {
                if let Err(e) = table.dispatch(packet).await {
                    tracing::debug!("Dispatch failed: {}", e);
                }
            }
            Err(e) if e.is_device_gone() => {
                tracing::error!("{}; reopening", e);
                if let Err(e) = tun.reopen().await {
                    tracing::error!("Failed to reopen virtual interface: {}", e);
                    tokio::time::sleep(DEVICE_RETRY).await;
                }
            }
            Err(Error::DeviceClosed) => tokio::time::sleep(DEVICE_RETRY).await,
            Err(e) => tracing::warn!("Virtual interface read failed: {}", e),
        }
    }
    tracing::debug!("Dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{generate_key, handshake, write_test_credentials, Credentials};
    use crate::packet::tests::ipv4_packet;
    use crate::transport::{connect, Endpoint};
    use crate::tun::{MemoryHost, MemoryOpener, TunParams};
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    struct Running {
        shutdown: CancellationToken,
        table: Arc<RoutingTable<ClientSession>>,
        endpoint: Endpoint,
        host: MemoryHost,
        opener: Arc<MemoryOpener>,
        client_credentials: Credentials,
        _dir: tempfile::TempDir,
    }

    async fn start_server(scheme: &str) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let ca = generate_key();
        let paths = write_test_credentials(dir.path(), &ca, "server");

        let mut config = WarpdriveConfig::default();
        config.network.server = true;
        config.network.listen = vec![format!("{}://127.0.0.1:0", scheme)];
        config.security.ca_path = paths.ca.clone();
        config.security.key_path = Some(paths.key.clone());
        config.security.signature_path = Some(paths.signature.clone());
        config.server.resolve_interval_ms = 20;
        let config = Arc::new(config);

        let (opener, host) = MemoryOpener::new();
        let params = TunParams {
            name: None,
            address: Ipv4Addr::new(10, 0, 0, 1),
            prefix: 24,
            mtu: 1400,
        };
        let tun = Arc::new(TunInterface::open(opener.clone(), params).unwrap());

        let shutdown = CancellationToken::new();
        let server = Server::new(config, tun, shutdown.clone()).unwrap();
        let listeners = server.bind().await.unwrap();
        let local = listeners[0].local_addr().unwrap();
        let table = server.table();
        tokio::spawn(async move { server.serve(listeners).await });

        Running {
            shutdown,
            table,
            endpoint: Endpoint::parse(&format!("{}://{}", scheme, local)).unwrap(),
            host,
            opener,
            client_credentials: Credentials::issue(&ca, generate_key()),
            _dir: dir,
        }
    }

    async fn wait_for_route(table: &RoutingTable<ClientSession>, addr: Ipv4Addr) {
        for _ in 0..100 {
            if table.lookup(addr).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never became routable", addr);
    }

    async fn round_trip(scheme: &str) {
        let mut server = start_server(scheme).await;

        let transport = connect(&server.endpoint, Duration::from_secs(2)).await.unwrap();
        let mut link = handshake(transport, &server.client_credentials, &HandshakeOptions::default())
            .await
            .unwrap();

        // Client announces itself with its first packet
        let hello = ipv4_packet(Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(10, 0, 0, 1), 17, 60);
        link.handle.send(Bytes::from(hello.clone())).await.unwrap();
        assert_eq!(server.host.next_written().await.unwrap(), hello);
        wait_for_route(&server.table, Ipv4Addr::new(10, 0, 0, 7)).await;

        // Traffic for the client leaves through its link exactly once
        let reply = ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 7), 17, 60);
        server.host.inject(reply.clone());
        assert_eq!(link.inbound.recv().await.unwrap(), Bytes::from(reply));

        // Traffic for nobody goes nowhere
        server
            .host
            .inject(ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 99), 17, 60));
        assert!(timeout(Duration::from_millis(100), link.inbound.recv()).await.is_err());

        server.shutdown.cancel();
        timeout(Duration::from_secs(2), link.handle.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_client_round_trip() {
        round_trip("ws").await;
    }

    #[tokio::test]
    async fn test_datagram_client_round_trip() {
        round_trip("udp").await;
    }

    #[tokio::test]
    async fn test_reconnect_evicts_previous_session() {
        let server = start_server("ws").await;
        let addr = Ipv4Addr::new(10, 0, 0, 9);
        let announce = Bytes::from(ipv4_packet(addr, Ipv4Addr::new(10, 0, 0, 1), 17, 40));

        let first = handshake(
            connect(&server.endpoint, Duration::from_secs(2)).await.unwrap(),
            &server.client_credentials,
            &HandshakeOptions::default(),
        )
        .await
        .unwrap();
        first.handle.send(announce.clone()).await.unwrap();
        wait_for_route(&server.table, addr).await;

        let second = handshake(
            connect(&server.endpoint, Duration::from_secs(2)).await.unwrap(),
            &server.client_credentials,
            &HandshakeOptions::default(),
        )
        .await
        .unwrap();
        second.handle.send(announce).await.unwrap();

        timeout(Duration::from_secs(2), first.handle.closed()).await.unwrap();
        assert!(!second.handle.is_closed());
        assert_eq!(server.table.len().await, 1);

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_device_failure_reopens_and_keeps_dispatching() {
        let server = start_server("ws").await;
        let addr = Ipv4Addr::new(10, 0, 0, 12);

        let mut link = handshake(
            connect(&server.endpoint, Duration::from_secs(2)).await.unwrap(),
            &server.client_credentials,
            &HandshakeOptions::default(),
        )
        .await
        .unwrap();
        link.handle
            .send(Bytes::from(ipv4_packet(addr, Ipv4Addr::new(10, 0, 0, 1), 17, 40)))
            .await
            .unwrap();
        wait_for_route(&server.table, addr).await;

        server.host.inject_error(std::io::Error::from_raw_os_error(libc::EIO));
        let packet = ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), addr, 17, 60);
        server.host.inject(packet.clone());

        let delivered = timeout(Duration::from_secs(2), link.inbound.recv()).await.unwrap();
        assert_eq!(delivered.unwrap(), Bytes::from(packet));
        assert_eq!(server.opener.open_count(), 2);
        assert!(!link.handle.is_closed());

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_foreign_client_never_enters_pool() {
        let server = start_server("ws").await;
        let stranger = Credentials::issue(&generate_key(), generate_key());

        let transport = connect(&server.endpoint, Duration::from_secs(2)).await.unwrap();
        assert!(handshake(transport, &stranger, &HandshakeOptions::default()).await.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.table.unenumerated_len().await, 0);
        assert!(server.table.is_empty().await);

        server.shutdown.cancel();
    }
}
