//! Reconnect supervisor
//!
//! Keeps exactly one link to the server alive. Each cycle connects, runs the
//! handshake and then relays between the virtual interface and the link
//! until the link closes. Failed attempts back off linearly; a closed link
//! is followed by a fixed settle delay before the next cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::efficiency;
use crate::config::WarpdriveConfig;
use crate::error::{Error, Result};
use crate::link::{self, AuthMode, CredentialPaths, Credentials, HandshakeOptions, Link, LinkHandle};
use crate::packet;
use crate::transport::{self, Endpoint, Transport};
use crate::tun::TunInterface;

/// Pause before retrying a device that is closed or failed to reopen
const DEVICE_RETRY: Duration = Duration::from_millis(500);

/// Where the supervisor is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
    Suspended,
}

/// Power events from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Suspend,
    Resume,
}

/// Linear backoff: the k-th consecutive failure waits k steps
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    step: Duration,
}

impl Backoff {
    pub fn new(step: Duration) -> Self {
        Self { failures: 0, step }
    }

    /// Record a failure and return the wait before the next attempt
    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.step.saturating_mul(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Opens the transport for a connect attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Transport>;
}

/// Connects over the network: TCP stream for `ws`, UDP for `udp`
pub struct NetConnector {
    pub timeout: Duration,
}

#[async_trait]
impl Connector for NetConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Transport> {
        transport::connect(endpoint, self.timeout).await
    }
}

/// Everything a supervisor cycle needs
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub endpoint: Endpoint,
    pub credentials: CredentialPaths,
    pub handshake: HandshakeOptions,
    pub retry_step: Duration,
    pub settle_delay: Duration,
    pub efficiency_interval: Option<Duration>,
}

impl SupervisorSettings {
    pub fn from_config(config: &WarpdriveConfig, attestation: Option<Vec<u8>>) -> Result<Self> {
        let security = &config.security;
        Ok(Self {
            endpoint: config.connect_endpoint()?,
            credentials: CredentialPaths::new(security.ca_path.clone(), config.key_path(), config.signature_path()),
            handshake: HandshakeOptions {
                encrypt: security.encrypt,
                auth: AuthMode::from_flags(security.auth, security.ignore_auth),
                timeout: config.handshake_timeout(),
                attestation,
                ..HandshakeOptions::default()
            },
            retry_step: config.retry_step(),
            settle_delay: config.settle_delay(),
            efficiency_interval: config.efficiency_interval(),
        })
    }
}

/// How an active phase ended
enum ActiveEnd {
    Closed,
    Suspended,
    Shutdown,
}

/// What ended a wait between attempts
enum Wake {
    Elapsed,
    Suspend,
    Shutdown,
}

/// Client-side owner of the single link to the server
pub struct Supervisor {
    settings: SupervisorSettings,
    tun: Arc<TunInterface>,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SupervisorState>,
    current: Mutex<Option<LinkHandle>>,
    events_tx: mpsc::Sender<HostEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<HostEvent>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        tun: Arc<TunInterface>,
        connector: Arc<dyn Connector>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(16);
        Self {
            settings,
            tun,
            connector,
            state,
            current: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
        }
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Supervisor {:?} -> {:?}", previous, state);
        }
    }

    /// Deliver a host power event
    pub async fn host_event(&self, event: HostEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// Close the active link, if any; the supervisor reconnects afterwards
    pub async fn close_link(&self) {
        if let Some(link) = self.current.lock().await.as_ref() {
            link.close();
        }
    }

    /// Stop the supervisor and close the active link
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.close_link().await;
    }

    /// Run connect cycles until shutdown
    pub async fn run(&self) -> Result<()> {
        let mut events = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Config("supervisor is already running".into()))?;
        let mut backoff = Backoff::new(self.settings.retry_step);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(SupervisorState::Connecting);
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = suspend_requested(&mut events) => None,
                attempt = self.establish() => Some(attempt),
            };

            let wake = match attempt {
                None => Wake::Suspend,
                Some(Ok(link)) => {
                    backoff.reset();
                    self.set_state(SupervisorState::Active);
                    let end = self.run_active(link, &mut events).await;
                    self.set_state(SupervisorState::Disconnected);

                    match end {
                        ActiveEnd::Shutdown => break,
                        ActiveEnd::Suspended => Wake::Suspend,
                        ActiveEnd::Closed => {
                            tracing::info!("Link closed, reconnecting in {:?}", self.settings.settle_delay);
                            self.wait(self.settings.settle_delay, &mut events).await
                        }
                    }
                }
                Some(Err(e)) => {
                    self.set_state(SupervisorState::Disconnected);
                    let wait = backoff.on_failure();
                    if e.is_retryable() {
                        tracing::warn!("Failed to connect, retrying in {:?}: {}", wait, e);
                    } else {
                        tracing::error!("Cannot connect, retrying in {:?}: {}", wait, e);
                    }
                    self.wait(wait, &mut events).await
                }
            };

            match wake {
                Wake::Elapsed => {}
                Wake::Shutdown => break,
                Wake::Suspend => {
                    backoff.reset();
                    if !self.hold_suspended(&mut events).await {
                        break;
                    }
                }
            }
        }

        self.set_state(SupervisorState::Disconnected);
        tracing::info!("Supervisor stopped");
        Ok(())
    }

    async fn establish(&self) -> Result<Link> {
        let endpoint = &self.settings.endpoint;
        let transport = self.connector.connect(endpoint).await?;

        self.set_state(SupervisorState::Handshaking);
        let credentials = Credentials::load(&self.settings.credentials)?;
        let link = link::handshake(transport, &credentials, &self.settings.handshake).await?;

        tracing::info!("Connected to {} (server {})", endpoint, link.handle.peer_signature());
        Ok(link)
    }

    async fn run_active(&self, link: Link, events: &mut mpsc::Receiver<HostEvent>) -> ActiveEnd {
        let Link { handle, inbound } = link;
        *self.current.lock().await = Some(handle.clone());

        let session = self.shutdown.child_token();
        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(device_to_link(self.tun.clone(), handle.clone(), session.clone())),
            tokio::spawn(link_to_device(self.tun.clone(), inbound, handle.clone(), session.clone())),
        ];
        if let Some(period) = self.settings.efficiency_interval {
            tasks.push(tokio::spawn(efficiency::monitor(handle.clone(), period, session.clone())));
        }

        let end = loop {
            tokio::select! {
                _ = handle.closed() => break ActiveEnd::Closed,
                _ = self.shutdown.cancelled() => break ActiveEnd::Shutdown,
                Some(event) = events.recv() => match event {
                    HostEvent::Suspend => break ActiveEnd::Suspended,
                    HostEvent::Resume => tracing::debug!("Resume while active, ignoring"),
                },
            }
        };

        session.cancel();
        handle.close();
        for task in tasks {
            let _ = task.await;
        }
        *self.current.lock().await = None;
        end
    }

    /// Close the device and wait for resume; false on shutdown
    async fn hold_suspended(&self, events: &mut mpsc::Receiver<HostEvent>) -> bool {
        tracing::info!("Host suspending, closing link and device");
        self.tun.close().await;
        self.set_state(SupervisorState::Suspended);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                Some(event) = events.recv() => {
                    if event == HostEvent::Resume {
                        break;
                    }
                }
            }
        }

        tracing::info!("Host resumed, reopening device");
        if let Err(e) = self.tun.reopen().await {
            tracing::error!("Failed to reopen virtual interface: {}", e);
        }
        self.set_state(SupervisorState::Disconnected);
        true
    }

    /// Sleep, cut short by shutdown or a suspend
    async fn wait(&self, duration: Duration, events: &mut mpsc::Receiver<HostEvent>) -> Wake {
        tokio::select! {
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            _ = suspend_requested(events) => Wake::Suspend,
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
        }
    }
}

/// Resolves on the next suspend; a resume while not suspended is ignored
async fn suspend_requested(events: &mut mpsc::Receiver<HostEvent>) {
    loop {
        match events.recv().await {
            Some(HostEvent::Suspend) => return,
            Some(HostEvent::Resume) => tracing::debug!("Resume while not suspended, ignoring"),
            None => std::future::pending::<()>().await,
        }
    }
}

async fn device_to_link(tun: Arc<TunInterface>, link: LinkHandle, session: CancellationToken) {
    loop {
        let read = tokio::select! {
            _ = session.cancelled() => break,
            read = tun.read() => read,
        };

        match read {
            Ok(packet) if packet.is_empty() => {}
            Ok(packet) if packet::ip_version(&packet) == Some(6) => {
                tracing::trace!("Dropping IPv6 packet");
            }
            Ok(packet) => {
                tracing::trace!("Read {} bytes from device", packet.len());
                if let Err(e) = link.send(packet).await {
                    tracing::debug!("Link send failed: {}", e);
                    break;
                }
            }
            Err(e) if e.is_device_gone() => {
                tracing::error!("{}; reopening", e);
                tun.close().await;
                if let Err(e) = tun.reopen().await {
                    tracing::error!("Failed to reopen virtual interface: {}", e);
                    pause(&session).await;
                }
            }
            Err(Error::DeviceClosed) => pause(&session).await,
            Err(e) => tracing::error!("Error while reading from virtual interface: {}", e),
        }
    }
    link.close();
}

async fn link_to_device(
    tun: Arc<TunInterface>,
    mut inbound: mpsc::Receiver<Bytes>,
    link: LinkHandle,
    session: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = session.cancelled() => break,
            packet = inbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        match tun.write(&packet).await {
            Ok(n) => tracing::trace!("Wrote {} bytes", n),
            Err(e) => tracing::debug!("Failed to write packet to device: {}", e),
        }
    }
    link.close();
}

async fn pause(session: &CancellationToken) {
    tokio::select! {
        _ = session.cancelled() => {}
        _ = tokio::time::sleep(DEVICE_RETRY) => {}
    }
}
