//! Warpdrive Configuration
//!
//! This module provides the configuration structures shared by the client
//! and server roles. The config is built once at startup (file, then
//! command-line overrides) and handed to every component by `Arc`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::addr::Ipv4Cidr;
use crate::error::{Error, Result};
use crate::transport::Endpoint;

/// Main Warpdrive configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarpdriveConfig {
    /// Role and endpoints
    #[serde(default)]
    pub network: NetworkConfig,

    /// Virtual interface
    #[serde(default)]
    pub tun: TunConfig,

    /// Credentials and link options
    #[serde(default)]
    pub security: SecurityConfig,

    /// Client reconnect tuning
    #[serde(default)]
    pub client: ClientConfig,

    /// Server routing tuning
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Run as a server (otherwise client)
    #[serde(default)]
    pub server: bool,

    /// Server listen endpoints, e.g. `ws://0.0.0.0:5000`, `udp://0.0.0.0:5001`
    #[serde(default)]
    pub listen: Vec<String>,

    /// Client connect endpoint
    #[serde(default)]
    pub connect: Option<String>,

    /// Configure host routes through the tunnel (client only)
    #[serde(default)]
    pub autoconf: bool,

    /// Range a peer's self-reported source address must fall in to be enumerated
    #[serde(default = "default_private_range")]
    pub private_range: String,
}

/// Virtual interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    /// Device name; the kernel picks one when empty
    #[serde(default)]
    pub name: Option<String>,

    /// Local address and prefix, e.g. `10.0.0.1/24`
    #[serde(default = "default_tun_address")]
    pub address: String,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Answer ICMP echo requests locally instead of routing them
    #[serde(default)]
    pub spoof_pings: bool,
}

/// Credentials and secure link options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Certificate authority public key
    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,

    /// Node private key (defaults to ./server.sk or ./client.sk)
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// CA signature over the node key (defaults to ./server.sign or ./client.sign)
    #[serde(default)]
    pub signature_path: Option<PathBuf>,

    /// Encrypt link payloads
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Verify peer credentials
    #[serde(default = "default_true")]
    pub auth: bool,

    /// Log authentication failures instead of rejecting the peer
    #[serde(default)]
    pub ignore_auth: bool,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

/// Client reconnect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Added to the retry wait after each consecutive failure
    #[serde(default = "default_retry_step_secs")]
    pub retry_step_secs: u64,

    /// Pause after a link closes before reconnecting
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Efficiency log period (0 disables)
    #[serde(default = "default_efficiency_interval_secs")]
    pub efficiency_interval_secs: u64,
}

/// Server routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address resolution / purge period
    #[serde(default = "default_resolve_interval_ms")]
    pub resolve_interval_ms: u64,

    /// Accepted transports waiting for a handshake slot
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub verbosity: String,
}

// Default value functions
fn default_private_range() -> String {
    "10.0.0.0/24".to_string()
}

fn default_tun_address() -> String {
    "10.0.0.2/24".to_string()
}

fn default_mtu() -> u16 {
    1400
}

fn default_ca_path() -> PathBuf {
    PathBuf::from("./ca")
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_retry_step_secs() -> u64 {
    3
}

fn default_settle_delay_ms() -> u64 {
    5000
}

fn default_efficiency_interval_secs() -> u64 {
    3
}

fn default_resolve_interval_ms() -> u64 {
    100
}

fn default_accept_backlog() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server: false,
            listen: Vec::new(),
            connect: None,
            autoconf: false,
            private_range: default_private_range(),
        }
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            address: default_tun_address(),
            mtu: default_mtu(),
            spoof_pings: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            ca_path: default_ca_path(),
            key_path: None,
            signature_path: None,
            encrypt: true,
            auth: true,
            ignore_auth: false,
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_step_secs: default_retry_step_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            efficiency_interval_secs: default_efficiency_interval_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            resolve_interval_ms: default_resolve_interval_ms(),
            accept_backlog: default_accept_backlog(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            verbosity: default_log_level(),
        }
    }
}

impl WarpdriveConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: WarpdriveConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration for the selected role
    pub fn validate(&self) -> Result<()> {
        self.tun_address()?;
        self.private_range()?;

        if self.network.server {
            if self.network.listen.is_empty() {
                return Err(Error::Config("server mode needs at least one listen endpoint".into()));
            }
            for ep in &self.network.listen {
                Endpoint::parse(ep)?;
            }
        } else {
            self.connect_endpoint()?;
        }

        if self.server.resolve_interval_ms == 0 {
            return Err(Error::Config("server.resolve_interval_ms cannot be 0".into()));
        }

        Ok(())
    }

    /// Parsed tun address/prefix
    pub fn tun_address(&self) -> Result<Ipv4Cidr> {
        self.tun.address.parse()
    }

    /// Parsed private range used for address enumeration
    pub fn private_range(&self) -> Result<Ipv4Cidr> {
        self.network.private_range.parse()
    }

    /// Parsed client connect endpoint
    pub fn connect_endpoint(&self) -> Result<Endpoint> {
        let raw = self
            .network
            .connect
            .as_deref()
            .ok_or_else(|| Error::Config("client mode needs a connect endpoint".into()))?;
        Endpoint::parse(raw)
    }

    /// Parsed server listen endpoints
    pub fn listen_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.network.listen.iter().map(|s| Endpoint::parse(s)).collect()
    }

    /// Private key path, defaulting by role
    pub fn key_path(&self) -> PathBuf {
        self.security.key_path.clone().unwrap_or_else(|| {
            PathBuf::from(if self.network.server { "./server.sk" } else { "./client.sk" })
        })
    }

    /// Signature path, defaulting by role
    pub fn signature_path(&self) -> PathBuf {
        self.security.signature_path.clone().unwrap_or_else(|| {
            PathBuf::from(if self.network.server { "./server.sign" } else { "./client.sign" })
        })
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.security.handshake_timeout_secs)
    }

    pub fn retry_step(&self) -> Duration {
        Duration::from_secs(self.client.retry_step_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.client.settle_delay_ms)
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.server.resolve_interval_ms)
    }

    /// Efficiency log period, `None` when disabled
    pub fn efficiency_interval(&self) -> Option<Duration> {
        match self.client.efficiency_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
