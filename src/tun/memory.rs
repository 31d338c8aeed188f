//! In-memory virtual device
//!
//! Needs no privileges. Every device opened from one `MemoryOpener` shares
//! the same queues, so a `MemoryHost` keeps working across reopen.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{DeviceOpener, TunDevice, TunParams};
use crate::error::{Error, Result};

struct Wire {
    to_device: Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
    from_device: mpsc::UnboundedSender<Vec<u8>>,
}

/// Opens `MemoryDevice`s
pub struct MemoryOpener {
    wire: Arc<Wire>,
    opens: AtomicUsize,
    fail_opens: AtomicBool,
    last_params: StdMutex<Option<TunParams>>,
}

impl MemoryOpener {
    /// Opener plus the host side of its queues
    pub fn new() -> (Arc<Self>, MemoryHost) {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();

        let opener = Arc::new(Self {
            wire: Arc::new(Wire {
                to_device: Mutex::new(inject_rx),
                from_device: written_tx,
            }),
            opens: AtomicUsize::new(0),
            fail_opens: AtomicBool::new(false),
            last_params: StdMutex::new(None),
        });
        let host = MemoryHost {
            inject: inject_tx,
            written: written_rx,
        };
        (opener, host)
    }

    /// Make subsequent opens fail
    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Successful opens so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<TunParams> {
        self.last_params.lock().ok().and_then(|p| p.clone())
    }
}

impl DeviceOpener for MemoryOpener {
    fn open(&self, params: &TunParams) -> Result<Arc<dyn TunDevice>> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(Error::Device("memory device unavailable".into()));
        }

        let n = self.opens.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_params.lock() {
            *last = Some(params.clone());
        }

        let name = params.name.clone().unwrap_or_else(|| format!("mem{}", n));
        Ok(Arc::new(MemoryDevice {
            name,
            wire: self.wire.clone(),
        }))
    }
}

/// A device backed by in-memory queues
pub struct MemoryDevice {
    name: String,
    wire: Arc<Wire>,
}

#[async_trait]
impl TunDevice for MemoryDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.wire.to_device.lock().await;
        match rx.recv().await {
            Some(Ok(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            // Host gone: behave like an idle interface
            None => std::future::pending().await,
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.wire
            .from_device
            .send(packet.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The "operating system" side of the memory devices
pub struct MemoryHost {
    inject: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryHost {
    /// Queue a packet for the device to read
    pub fn inject(&self, packet: Vec<u8>) {
        let _ = self.inject.send(Ok(packet));
    }

    /// Make the next device read fail with `err`
    pub fn inject_error(&self, err: io::Error) {
        let _ = self.inject.send(Err(err));
    }

    /// Next packet written to the device
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }
}
