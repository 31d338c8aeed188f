//! Value types used as routing keys

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Address of a peer on the virtual network; the routing key
pub type VirtualAddress = Ipv4Addr;

/// Opaque identity of an authenticated peer, compared by value
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PeerSignature(Vec<u8>);

impl PeerSignature {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerSignature {
    /// Short form for logs: first 8 bytes in hex
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.len().min(8);
        write!(f, "{}", hex::encode(&self.0[..shown]))?;
        if self.0.len() > shown {
            write!(f, "…")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerSignature({})", hex::encode(&self.0))
    }
}

/// An IPv4 address with a CIDR prefix, e.g. `10.0.0.2/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::Config(format!("prefix /{} is out of range", prefix)));
        }
        Ok(Self { address, prefix })
    }

    /// Subnet mask for the prefix (e.g. /24 -> 255.255.255.0)
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix))
    }

    /// Network address (host bits cleared)
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & prefix_mask(self.prefix))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix);
        (u32::from(addr) & mask) == (u32::from(self.address) & mask)
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix.min(32) as u32)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("'{}' is not in address/prefix form", s)))?;
        let address: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::Config(format!("'{}' is not an IPv4 address", addr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::Config(format!("'{}' is not a prefix length", prefix)))?;
        Self::new(address, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}
