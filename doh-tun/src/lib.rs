//! TUN device access and IP/UDP packet handling for the DoH tunnel
//!
//! This crate is the tunnel's view of the host network stack:
//!
//! - [`TunTransport`]: async packet I/O the tunnel engine is written against
//! - [`TunDevice`]: real interface via `tun-rs`, created from a
//!   [`TunConfig`] or adopted from a file descriptor
//! - [`packet`]: parsing UDP datagrams out of IPv4/IPv6 packets and building
//!   replies with valid checksums
//! - [`mock`]: an in-memory device for tests
//!
//! # Platform Requirements
//!
//! Creating an interface needs root or `CAP_NET_ADMIN` on Linux and root on
//! macOS. Adopting a file descriptor handed over by a VPN service needs no
//! extra privileges.
//!
//! # Example
//!
//! ```ignore
//! use doh_tun::{packet::UdpPacket, TunConfig, TunDevice, TunTransport};
//!
//! let config = TunConfig::builder()
//!     .name("dohguard")
//!     .ipv4_cidr("10.111.222.1/24")?
//!     .build()?;
//! let device = TunDevice::create(config).await?;
//!
//! let mut buf = vec![0u8; doh_tun::MAX_PACKET_SIZE];
//! let n = device.recv(&mut buf).await?;
//! if let Some(query) = UdpPacket::parse(&buf[..n]) {
//!     device.send(&query.reply(b"...")?).await?;
//! }
//! ```

pub mod config;
mod device;
pub mod error;
pub mod mock;
pub mod packet;
mod transport;

pub use config::{Ipv4Config, Ipv6Config, TunConfig, TunConfigBuilder};
pub use device::TunDevice;
pub use error::{Error, Result};
pub use packet::UdpPacket;
pub use transport::{TunInfo, TunTransport};

/// Default MTU for TUN devices
pub const DEFAULT_MTU: u16 = 1500;

/// Largest IP packet read from or written to the device
pub const MAX_PACKET_SIZE: usize = 65535;
