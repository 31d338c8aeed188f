//! Linux TUN device
//!
//! Created through `/dev/net/tun` and configured with the `ip` tool.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::{DeviceOpener, TunDevice, TunParams};
use crate::error::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write bit differently
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// A TUN device driven by the tokio reactor
pub struct LinuxTun {
    fd: AsyncFd<File>,
    name: String,
}

impl LinuxTun {
    /// Create the device and assign address, mask and MTU
    pub fn create(params: &TunParams) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(|e| Error::Device(format!("cannot open /dev/net/tun: {}", e)))?;

        let mut req = Ifreq {
            ifr_name: [0u8; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        // An empty name lets the kernel pick tunN
        if let Some(name) = &params.name {
            let bytes = name.as_bytes();
            let len = bytes.len().min(libc::IFNAMSIZ - 1);
            req.ifr_name[..len].copy_from_slice(&bytes[..len]);
        }

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut Ifreq) };
        if ret < 0 {
            return Err(Error::Device(format!(
                "ioctl TUNSETIFF failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let end = req.ifr_name.iter().position(|&b| b == 0).unwrap_or(req.ifr_name.len());
        let name = String::from_utf8_lossy(&req.ifr_name[..end]).into_owned();

        let tun = Self {
            fd: AsyncFd::with_interest(file, Interest::READABLE | Interest::WRITABLE)?,
            name,
        };
        tun.configure(params)?;
        Ok(tun)
    }

    fn configure(&self, params: &TunParams) -> Result<()> {
        let cidr = params.cidr().to_string();
        run_ip(&["addr", "add", &cidr, "dev", &self.name])?;

        if let Err(e) = run_ip(&["link", "set", "dev", &self.name, "mtu", &params.mtu.to_string()]) {
            tracing::warn!("Failed to set MTU on {}: {}", self.name, e);
        }

        run_ip(&["link", "set", "dev", &self.name, "up"])?;
        tracing::debug!("Configured {} with {} (mask {})", self.name, cidr, params.netmask());
        Ok(())
    }
}

#[async_trait]
impl TunDevice for LinuxTun {
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|inner| inner.get_ref().write(packet)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens `LinuxTun` devices
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxOpener;

impl DeviceOpener for LinuxOpener {
    fn open(&self, params: &TunParams) -> Result<Arc<dyn TunDevice>> {
        Ok(Arc::new(LinuxTun::create(params)?))
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| Error::Device(format!("failed to run ip: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Device(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
