//! Virtual Interface Module
//!
//! `TunInterface` owns the platform device behind a `TunDevice` trait object
//! and adds what the rest of the crate relies on: close/reopen with the same
//! parameters, serialized writes, byte counters and spoofed ping replies.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(any(test, feature = "test-util"))]
mod memory;

#[cfg(target_os = "linux")]
pub use linux::{LinuxOpener, LinuxTun};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryDevice, MemoryHost, MemoryOpener};

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::addr::Ipv4Cidr;
use crate::config::WarpdriveConfig;
use crate::error::{Error, Result};
use crate::packet;

/// A packet-oriented virtual network device
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one packet into `buf`
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> std::io::Result<usize>;

    fn name(&self) -> &str;
}

/// Creates devices for a `TunInterface`
pub trait DeviceOpener: Send + Sync {
    fn open(&self, params: &TunParams) -> Result<Arc<dyn TunDevice>>;
}

/// Called with the new device name after every successful reopen
pub type ReopenHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Parameters a device is (re)opened with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunParams {
    /// Requested interface name; the kernel picks one when `None`
    pub name: Option<String>,
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub mtu: u16,
}

impl TunParams {
    pub fn from_config(config: &WarpdriveConfig) -> Result<Self> {
        let cidr = config.tun_address()?;
        Ok(Self {
            name: config.tun.name.clone(),
            address: cidr.address,
            prefix: cidr.prefix,
            mtu: config.tun.mtu,
        })
    }

    pub fn cidr(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            address: self.address,
            prefix: self.prefix.min(32),
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.cidr().netmask()
    }
}

#[derive(Clone)]
struct Opened {
    device: Arc<dyn TunDevice>,
    /// Cancelled when this device is closed; interrupts pending reads
    closed: CancellationToken,
}

/// The virtual interface used by client and server
pub struct TunInterface {
    opener: Arc<dyn DeviceOpener>,
    params: TunParams,
    current: RwLock<Option<Opened>>,
    /// Device writes from all sessions go through this lock
    write_lock: Mutex<()>,
    spoof_pings: AtomicBool,
    on_reopen: StdMutex<Option<ReopenHook>>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl TunInterface {
    /// Open the device and wrap it
    pub fn open(opener: Arc<dyn DeviceOpener>, params: TunParams) -> Result<Self> {
        let device = opener.open(&params)?;
        tracing::info!(
            "Opened virtual interface {} ({}/{}, mtu {})",
            device.name(),
            params.address,
            params.prefix,
            params.mtu
        );

        Ok(Self {
            opener,
            params,
            current: RwLock::new(Some(Opened {
                device,
                closed: CancellationToken::new(),
            })),
            write_lock: Mutex::new(()),
            spoof_pings: AtomicBool::new(false),
            on_reopen: StdMutex::new(None),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    pub fn params(&self) -> &TunParams {
        &self.params
    }

    /// Name of the open device
    pub async fn name(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|o| o.device.name().to_string())
    }

    pub async fn is_open(&self) -> bool {
        self.current.read().await.is_some()
    }

    async fn opened(&self) -> Result<Opened> {
        self.current.read().await.clone().ok_or(Error::DeviceClosed)
    }

    /// Read the next packet
    ///
    /// Returns an empty buffer when the packet was an ICMP message answered
    /// locally in spoofed-ping mode.
    pub async fn read(&self) -> Result<Bytes> {
        let opened = self.opened().await?;
        let mut buf = vec![0u8; self.params.mtu as usize + 64];

        let n = tokio::select! {
            _ = opened.closed.cancelled() => return Err(Error::DeviceClosed),
            result = opened.device.recv(&mut buf) => {
                result.map_err(|e| Error::from_device_io(opened.device.name(), e))?
            }
        };
        buf.truncate(n);
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);

        if self.spoof_pings.load(Ordering::Relaxed) && packet::is_icmp(&buf) {
            packet::swap_source_destination(&mut buf);
            packet::make_icmp_response(&mut buf);
            tracing::trace!("Answering ping to {:?} locally", packet::source(&buf));
            self.write_to(&opened, &buf).await?;
            return Ok(Bytes::new());
        }

        Ok(Bytes::from(buf))
    }

    /// Write one packet to the device
    pub async fn write(&self, packet: &[u8]) -> Result<usize> {
        let opened = self.opened().await?;
        self.write_to(&opened, packet).await
    }

    async fn write_to(&self, opened: &Opened, packet: &[u8]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        if opened.closed.is_cancelled() {
            return Err(Error::DeviceClosed);
        }
        let n = opened
            .device
            .send(packet)
            .await
            .map_err(|e| Error::from_device_io(opened.device.name(), e))?;
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Close the device; pending reads return `DeviceClosed`
    pub async fn close(&self) {
        if let Some(opened) = self.current.write().await.take() {
            opened.closed.cancel();
            tracing::info!("Closed virtual interface {}", opened.device.name());
        }
    }

    /// Close and open again with the same parameters
    pub async fn reopen(&self) -> Result<()> {
        let mut current = self.current.write().await;
        if let Some(old) = current.take() {
            old.closed.cancel();
        }

        let device = self.opener.open(&self.params)?;
        let name = device.name().to_string();
        tracing::info!("Reopened virtual interface {}", name);
        *current = Some(Opened {
            device,
            closed: CancellationToken::new(),
        });
        drop(current);

        // A fresh kernel device comes up without the routes bound to the old one
        let hook = self.on_reopen.lock().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(&name);
        }
        Ok(())
    }

    /// Run `hook` after each successful reopen
    pub fn on_reopen(&self, hook: ReopenHook) {
        if let Ok(mut slot) = self.on_reopen.lock() {
            *slot = Some(hook);
        }
    }

    pub fn set_spoofed_pings(&self, enabled: bool) {
        self.spoof_pings.store(enabled, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::ipv4_packet;
    use std::time::Duration;

    fn params() -> TunParams {
        TunParams {
            name: Some("wd-test".into()),
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix: 24,
            mtu: 1400,
        }
    }

    #[test]
    fn test_params_netmask() {
        let p = params();
        assert_eq!(p.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(p.cidr().to_string(), "10.0.0.2/24");
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (opener, mut host) = MemoryOpener::new();
        let tun = TunInterface::open(opener, params()).unwrap();
        assert_eq!(tun.name().await.as_deref(), Some("wd-test"));

        let pkt = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 6, 40);
        host.inject(pkt.clone());
        assert_eq!(tun.read().await.unwrap(), Bytes::from(pkt.clone()));

        assert_eq!(tun.write(&pkt).await.unwrap(), 40);
        assert_eq!(host.next_written().await.unwrap(), pkt);
        assert_eq!(tun.bytes_received(), 40);
        assert_eq!(tun.bytes_sent(), 40);
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_read() {
        let (opener, _host) = MemoryOpener::new();
        let tun = Arc::new(TunInterface::open(opener, params()).unwrap());

        let reader = {
            let tun = tun.clone();
            tokio::spawn(async move { tun.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tun.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::DeviceClosed)));
        assert!(matches!(tun.write(&[0x45]).await, Err(Error::DeviceClosed)));
    }

    #[tokio::test]
    async fn test_reopen_uses_same_params() {
        let (opener, mut host) = MemoryOpener::new();
        let tun = TunInterface::open(opener.clone(), params()).unwrap();

        tun.close().await;
        assert!(!tun.is_open().await);
        tun.reopen().await.unwrap();
        assert!(tun.is_open().await);
        assert_eq!(opener.open_count(), 2);
        assert_eq!(opener.last_params(), Some(params()));

        let pkt = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 17, 28);
        tun.write(&pkt).await.unwrap();
        assert_eq!(host.next_written().await.unwrap(), pkt);
    }

    #[tokio::test]
    async fn test_device_gone_surfaces_as_error() {
        let (opener, host) = MemoryOpener::new();
        let tun = TunInterface::open(opener, params()).unwrap();

        host.inject_error(std::io::Error::from_raw_os_error(libc::EIO));
        let err = tun.read().await.unwrap_err();
        assert!(err.is_device_gone());
    }

    #[tokio::test]
    async fn test_spoofed_ping_answered_locally() {
        let (opener, mut host) = MemoryOpener::new();
        let tun = TunInterface::open(opener, params()).unwrap();
        tun.set_spoofed_pings(true);

        let mut ping = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 1, 28);
        ping[20] = 8;
        host.inject(ping);

        assert!(tun.read().await.unwrap().is_empty());

        let reply = host.next_written().await.unwrap();
        assert_eq!(packet::source(&reply), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(packet::destination(&reply), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(reply[20], 0);
        assert_eq!(&reply[22..24], &[0xFF, 0xFF]);

        // Other traffic passes through untouched
        let tcp = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 6, 40);
        host.inject(tcp.clone());
        assert_eq!(tun.read().await.unwrap(), Bytes::from(tcp));
    }

    #[tokio::test]
    async fn test_reopen_hook_sees_new_device() {
        let (opener, _host) = MemoryOpener::new();
        let mut p = params();
        p.name = None;
        let tun = TunInterface::open(opener.clone(), p).unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = seen.clone();
        tun.on_reopen(Arc::new(move |name: &str| record.lock().unwrap().push(name.to_string())));

        tun.close().await;
        assert!(seen.lock().unwrap().is_empty());

        tun.reopen().await.unwrap();
        tun.reopen().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["mem1".to_string(), "mem2".to_string()]);

        // Not called when the open fails
        opener.fail_opens(true);
        assert!(tun.reopen().await.is_err());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_reopen_leaves_device_closed() {
        let (opener, _host) = MemoryOpener::new();
        let tun = TunInterface::open(opener.clone(), params()).unwrap();

        opener.fail_opens(true);
        assert!(tun.reopen().await.is_err());
        assert!(!tun.is_open().await);

        opener.fail_opens(false);
        tun.reopen().await.unwrap();
        assert!(tun.is_open().await);
    }
}
