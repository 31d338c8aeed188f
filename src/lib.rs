//! Warpdrive - Point-to-Point Virtual Private Network
//!
//! Joins client machines into a private IPv4 network through a central
//! server. Each side runs a virtual network interface; IP packets read from
//! it travel over an authenticated, optionally encrypted link and are written
//! to the interface on the other end.
//!
//! # Architecture
//!
//! The server accepts links on any number of listeners (framed TCP or UDP),
//! learns each client's private address from the first packet it sends and
//! routes packets read from its interface to the owning client. A client
//! keeps one supervised link to the server, reconnecting with linear backoff
//! whenever it drops.
//!
//! # Features
//!
//! - Ed25519 credentials signed by a shared certificate authority
//! - X25519 key agreement and ChaCha20-Poly1305 payload encryption
//! - Newest-session-wins address and identity eviction
//! - Virtual interface reopen on device failure and host suspend/resume
//! - Locally answered pings and client route autoconfiguration

pub mod addr;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod link;
pub mod packet;
pub mod routes;
pub mod server;
pub mod transport;
pub mod tun;

pub use config::WarpdriveConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::addr::{Ipv4Cidr, PeerSignature, VirtualAddress};
    pub use crate::client::{Supervisor, SupervisorState};
    pub use crate::config::WarpdriveConfig;
    pub use crate::error::{Error, Result};
    pub use crate::link::{Link, LinkHandle};
    pub use crate::server::Server;
    pub use crate::tun::TunInterface;
}
