//! Error types for doh-tun

use std::io;
use thiserror::Error;

/// Result type alias for doh-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during TUN device operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Packet could not be encoded
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Device has been closed
    #[error("TUN device is closed")]
    Closed,
}

impl Error {
    /// Check if the device was closed under the caller
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}
