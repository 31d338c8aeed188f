//! Routing table
//!
//! Sessions enter an unenumerated pool after their handshake and are
//! promoted into the address-keyed table once their virtual address is
//! known. Collisions on address or peer signature are resolved by evicting
//! the older session: last write wins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::addr::{PeerSignature, VirtualAddress};
use crate::error::Result;
use crate::packet;

/// What the routing table needs from a session
#[async_trait]
pub trait Route: Send + Sync {
    /// Virtual address, once observed
    fn address(&self) -> Option<VirtualAddress>;

    fn signature(&self) -> Option<&PeerSignature>;

    fn is_closed(&self) -> bool;

    fn close(&self);

    async fn write_packet(&self, packet: Bytes) -> Result<()>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Outcome of one resolution pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveReport {
    pub promoted: usize,
    pub evicted: usize,
    pub purged: usize,
}

struct Tables<S> {
    enumerated: HashMap<VirtualAddress, Arc<S>>,
    unenumerated: Vec<Arc<S>>,
}

/// Address-keyed session table plus the pool of sessions awaiting an address
pub struct RoutingTable<S: Route> {
    tables: RwLock<Tables<S>>,
}

impl<S: Route> Default for RoutingTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Route> RoutingTable<S> {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                enumerated: HashMap::new(),
                unenumerated: Vec::new(),
            }),
        }
    }

    /// Add a freshly handshaken session to the pool
    pub async fn add_unenumerated(&self, session: Arc<S>) {
        tracing::debug!("Session {} awaiting its address", session.describe());
        self.tables.write().await.unenumerated.push(session);
    }

    /// Promote sessions with a known address, then purge closed ones
    pub async fn resolve(&self) -> ResolveReport {
        let mut report = ResolveReport::default();
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        let pool = std::mem::take(&mut tables.unenumerated);
        for session in pool {
            if session.is_closed() {
                report.purged += 1;
                continue;
            }
            let address = match session.address() {
                Some(address) => address,
                None => {
                    tables.unenumerated.push(session);
                    continue;
                }
            };

            if let Some(existing) = tables.enumerated.remove(&address) {
                tracing::warn!(
                    "Evicting {} from {}: address taken by {}",
                    existing.describe(),
                    address,
                    session.describe()
                );
                existing.close();
                report.evicted += 1;
            }

            if let Some(signature) = session.signature().filter(|s| !s.is_empty()) {
                let duplicates: Vec<VirtualAddress> = tables
                    .enumerated
                    .iter()
                    .filter(|(_, other)| other.signature() == Some(signature))
                    .map(|(addr, _)| *addr)
                    .collect();
                for addr in duplicates {
                    if let Some(duplicate) = tables.enumerated.remove(&addr) {
                        tracing::warn!(
                            "Evicting {} at {}: signature {} reconnected as {}",
                            duplicate.describe(),
                            addr,
                            signature,
                            address
                        );
                        duplicate.close();
                        report.evicted += 1;
                    }
                }
            }

            tracing::info!("Routing {} to {}", address, session.describe());
            tables.enumerated.insert(address, session);
            report.promoted += 1;
        }

        let before = tables.enumerated.len();
        tables.enumerated.retain(|_, session| !session.is_closed());
        report.purged += before - tables.enumerated.len();

        if report.purged > 0 {
            tracing::info!("Purged {} closed sessions", report.purged);
        }
        report
    }

    pub async fn lookup(&self, address: VirtualAddress) -> Option<Arc<S>> {
        self.tables.read().await.enumerated.get(&address).cloned()
    }

    /// Session for a packet's destination
    pub async fn route(&self, packet: &[u8]) -> Option<Arc<S>> {
        let destination = packet::destination(packet)?;
        self.lookup(destination).await
    }

    /// Forward a packet to its destination session
    ///
    /// Returns `Ok(false)` when there is no route. A failed write closes the
    /// session; the next purge removes it.
    pub async fn dispatch(&self, packet: Bytes) -> Result<bool> {
        let session = match self.route(&packet).await {
            Some(session) => session,
            None => {
                tracing::debug!(
                    "No route for {} byte packet to {:?}",
                    packet.len(),
                    packet::destination(&packet)
                );
                return Ok(false);
            }
        };

        tracing::trace!("Dispatching {} bytes to {}", packet.len(), session.describe());
        if let Err(e) = session.write_packet(packet).await {
            tracing::warn!("Write to {} failed: {}", session.describe(), e);
            session.close();
            return Err(e);
        }
        Ok(true)
    }

    /// Number of enumerated sessions
    pub async fn len(&self) -> usize {
        self.tables.read().await.enumerated.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn unenumerated_len(&self) -> usize {
        self.tables.read().await.unenumerated.len()
    }

    /// Close and drop every session
    pub async fn close_all(&self) {
        let mut tables = self.tables.write().await;
        for session in tables.unenumerated.drain(..) {
            session.close();
        }
        for (_, session) in tables.enumerated.drain() {
            session.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::packet::tests::ipv4_packet;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, OnceLock};

    #[derive(Default)]
    pub(crate) struct FakeRoute {
        pub name: &'static str,
        pub address: OnceLock<VirtualAddress>,
        pub signature: Option<PeerSignature>,
        pub closed: AtomicBool,
        pub fail_writes: AtomicBool,
        pub written: Mutex<Vec<Bytes>>,
    }

    impl FakeRoute {
        pub fn new(name: &'static str, signature: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                name,
                signature: Some(PeerSignature::new(signature.to_vec())),
                ..Default::default()
            })
        }

        pub fn at(name: &'static str, signature: &[u8], address: Ipv4Addr) -> Arc<Self> {
            let route = Self::new(name, signature);
            route.address.set(address).unwrap();
            route
        }

        pub fn writes(&self) -> Vec<Bytes> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Route for FakeRoute {
        fn address(&self) -> Option<VirtualAddress> {
            self.address.get().copied()
        }

        fn signature(&self) -> Option<&PeerSignature> {
            self.signature.as_ref()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn write_packet(&self, packet: Bytes) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::LinkClosed);
            }
            self.written.lock().unwrap().push(packet);
            Ok(())
        }

        fn describe(&self) -> String {
            self.name.to_string()
        }
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[tokio::test]
    async fn test_unroutable_packet_has_no_effect() {
        let table = RoutingTable::new();
        let a = FakeRoute::at("a", b"sig-a", ip(5));
        table.add_unenumerated(a.clone()).await;
        table.resolve().await;

        let pkt = Bytes::from(ipv4_packet(ip(2), ip(77), 6, 60));
        assert!(!table.dispatch(pkt).await.unwrap());
        assert!(a.writes().is_empty());
        assert!(!a.is_closed());

        // Too short to carry a destination
        assert!(!table.dispatch(Bytes::from_static(&[0x45, 0, 0])).await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_reaches_destination_once() {
        let table = RoutingTable::new();
        let a = FakeRoute::at("a", b"sig-a", ip(5));
        let b = FakeRoute::at("b", b"sig-b", ip(6));
        table.add_unenumerated(a.clone()).await;
        table.add_unenumerated(b.clone()).await;
        assert_eq!(table.resolve().await.promoted, 2);

        let pkt = Bytes::from(ipv4_packet(ip(2), ip(5), 17, 60));
        assert!(table.dispatch(pkt.clone()).await.unwrap());

        assert_eq!(a.writes(), vec![pkt]);
        assert!(b.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_session_stays_in_pool() {
        let table = RoutingTable::new();
        let pending = FakeRoute::new("pending", b"sig-p");
        table.add_unenumerated(pending.clone()).await;

        let report = table.resolve().await;
        assert_eq!(report, ResolveReport::default());
        assert_eq!(table.unenumerated_len().await, 1);
        assert!(table.is_empty().await);

        pending.address.set(ip(8)).unwrap();
        assert_eq!(table.resolve().await.promoted, 1);
        assert_eq!(table.unenumerated_len().await, 0);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_address_collision_newest_wins() {
        let table = RoutingTable::new();
        let b = FakeRoute::new("b", b"sig-b");
        let c = FakeRoute::new("c", b"sig-c");
        table.add_unenumerated(b.clone()).await;
        table.add_unenumerated(c.clone()).await;

        b.address.set(ip(9)).unwrap();
        table.resolve().await;
        c.address.set(ip(9)).unwrap();
        let report = table.resolve().await;

        assert_eq!(report.promoted, 1);
        assert_eq!(report.evicted, 1);
        assert!(b.is_closed());
        assert!(!c.is_closed());
        assert_eq!(table.len().await, 1);
        assert_eq!(table.lookup(ip(9)).await.unwrap().name, "c");
    }

    #[tokio::test]
    async fn test_collision_within_one_pass() {
        let table = RoutingTable::new();
        let b = FakeRoute::at("b", b"sig-b", ip(9));
        let c = FakeRoute::at("c", b"sig-c", ip(9));
        table.add_unenumerated(b.clone()).await;
        table.add_unenumerated(c.clone()).await;

        table.resolve().await;
        assert!(b.is_closed());
        assert_eq!(table.lookup(ip(9)).await.unwrap().name, "c");
    }

    #[tokio::test]
    async fn test_signature_collision_across_addresses() {
        let table = RoutingTable::new();
        let old = FakeRoute::at("old", b"same-peer", ip(10));
        table.add_unenumerated(old.clone()).await;
        table.resolve().await;

        let new = FakeRoute::at("new", b"same-peer", ip(11));
        table.add_unenumerated(new.clone()).await;
        let report = table.resolve().await;

        assert_eq!(report.evicted, 1);
        assert!(old.is_closed());
        assert_eq!(table.len().await, 1);
        assert!(table.lookup(ip(10)).await.is_none());
        assert_eq!(table.lookup(ip(11)).await.unwrap().name, "new");
    }

    #[tokio::test]
    async fn test_purge_removes_closed_sessions() {
        let table = RoutingTable::new();
        let a = FakeRoute::at("a", b"sig-a", ip(5));
        let dead_pending = FakeRoute::new("dead", b"sig-d");
        table.add_unenumerated(a.clone()).await;
        table.add_unenumerated(dead_pending.clone()).await;
        table.resolve().await;

        a.close();
        dead_pending.close();
        let report = table.resolve().await;
        assert_eq!(report.purged, 2);
        assert!(table.is_empty().await);
        assert_eq!(table.unenumerated_len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_write_closes_session() {
        let table = RoutingTable::new();
        let a = FakeRoute::at("a", b"sig-a", ip(5));
        a.fail_writes.store(true, Ordering::SeqCst);
        table.add_unenumerated(a.clone()).await;
        table.resolve().await;

        let pkt = Bytes::from(ipv4_packet(ip(2), ip(5), 6, 40));
        assert!(table.dispatch(pkt).await.is_err());
        assert!(a.is_closed());
        assert_eq!(table.resolve().await.purged, 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let table = RoutingTable::new();
        let a = FakeRoute::at("a", b"sig-a", ip(5));
        let p = FakeRoute::new("p", b"sig-p");
        table.add_unenumerated(a.clone()).await;
        table.resolve().await;
        table.add_unenumerated(p.clone()).await;

        table.close_all().await;
        assert!(a.is_closed());
        assert!(p.is_closed());
        assert!(table.is_empty().await);
    }
}
