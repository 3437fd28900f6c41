//! Packet I/O abstraction over the tunnel interface
//!
//! The tunnel only ever talks to a [`TunTransport`]. The real implementation
//! is [`crate::TunDevice`]; tests use [`crate::mock::MockTunDevice`].

use async_trait::async_trait;

use crate::error::Result;

/// Information about a TUN interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunInfo {
    /// Interface name (e.g., "tun0", "utun3")
    pub name: String,
    /// Maximum transmission unit size
    pub mtu: u16,
}

/// Async packet stream carrying raw IP datagrams (no link-layer framing)
///
/// Implementations must allow `recv` and `send` to run concurrently from
/// different tasks.
#[async_trait]
pub trait TunTransport: Send + Sync {
    /// Receive one IP packet, waiting until one is available.
    ///
    /// # Cancel Safety
    ///
    /// Must be cancel-safe: dropping the future loses no packet.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one IP packet back to the host network stack
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Release the underlying handle. Later reads and writes fail with
    /// [`crate::Error::Closed`]; closing twice is harmless.
    async fn close(&self);

    /// Get information about the TUN interface
    fn info(&self) -> &TunInfo;

    /// Get the MTU of the interface
    fn mtu(&self) -> u16 {
        self.info().mtu
    }

    /// Get the interface name
    fn name(&self) -> &str {
        &self.info().name
    }
}
