//! Warpdrive Error Types

use thiserror::Error;

/// Result type alias for Warpdrive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Warpdrive error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid endpoint {endpoint}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    // Secure link errors
    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake message could not be decoded: {0}")]
    HandshakeEncoding(#[from] bincode::Error),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Link closed")]
    LinkClosed,

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Virtual interface errors
    #[error("Device {name} is no longer functioning: {source}")]
    DeviceGone {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Route configuration failed: {0}")]
    Route(String),

    #[error("Device closed")]
    DeviceClosed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Classify a device I/O error: detached/broken devices become `DeviceGone`
    pub fn from_device_io(name: &str, err: std::io::Error) -> Self {
        if is_device_gone_code(&err) {
            Error::DeviceGone {
                name: name.to_string(),
                source: err,
            }
        } else {
            Error::Io(err)
        }
    }

    /// Check if the virtual interface should be closed and reopened
    pub fn is_device_gone(&self) -> bool {
        matches!(self, Error::DeviceGone { .. })
    }

    /// Check if this error should be retried by the reconnect supervisor
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Handshake(_)
                | Error::HandshakeEncoding(_)
                | Error::Credentials(_)
                | Error::Transport(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::LinkClosed
                | Error::Io(_)
        )
    }
}

#[cfg(target_os = "linux")]
fn is_device_gone_code(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EIO) | Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EBADFD)
    )
}

#[cfg(not(target_os = "linux"))]
fn is_device_gone_code(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EIO) | Some(libc::ENODEV) | Some(libc::ENXIO)
    )
}
