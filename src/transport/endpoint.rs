//! Endpoint URIs (`ws://host:port`, `udp://host:port`)

use std::fmt;
use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Transport scheme of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Stream-oriented transport
    WebSocket,
    /// Datagram-oriented transport
    Udp,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::WebSocket => "ws",
            Scheme::Udp => "udp",
        }
    }
}

/// A parsed listen or connect endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Endpoint {
            endpoint: raw.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = raw
            .trim()
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "ws" => Scheme::WebSocket,
            "udp" => Scheme::Udp,
            other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
        };

        let authority = rest.trim_end_matches('/');
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, tail) = v6.split_once(']').ok_or_else(|| invalid("unterminated IPv6 host"))?;
            let port = tail.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            authority.rsplit_once(':').ok_or_else(|| invalid("missing port"))?
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve to a socket address, preferring IPv4
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(self.authority())
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: self.authority(),
                reason: format!("cannot resolve: {}", e),
            })?
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| Error::ConnectionFailed {
                address: self.authority(),
                reason: "no addresses".into(),
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}
