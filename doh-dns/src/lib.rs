//! doh-dns - DNS-over-HTTPS building blocks
//!
//! This crate provides the pieces a DNS tunnel needs to forward queries over
//! encrypted HTTPS:
//! - [`DohTransport`]: POSTs raw DNS messages to one resolver URL with fixed
//!   connect, write and response-header timeouts
//! - [`apply_padding`]: EDNS(0) padding so query lengths land on a block size
//! - [`IpMap`]: per-hostname resolver addresses with a confirmed favourite
//! - [`SocketProtector`]: hook to keep upstream sockets out of the tunnel
//!
//! # Example
//!
//! ```no_run
//! use doh_dns::{apply_padding, DohResolver, DohTransport, IpMap, TransportOptions};
//!
//! # async fn example(query: &[u8]) -> doh_dns::Result<()> {
//! let transport = DohTransport::new(
//!     "https://cloudflare-dns.com/dns-query",
//!     TransportOptions::default(),
//! )?;
//! let ip_map = IpMap::new();
//! let set = ip_map.get(transport.hostname());
//!
//! let padded = apply_padding(query, doh_dns::DEFAULT_BLOCK_SIZE)?;
//! for addr in set.candidates() {
//!     match transport.query(addr, &padded).await {
//!         Ok(response) => {
//!             set.confirm(addr);
//!             println!("{} bytes from {}", response.body.len(), response.server);
//!             break;
//!         }
//!         Err(_) => set.disconfirm(addr),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
pub mod error;
pub mod ipmap;
pub mod padding;
pub mod protect;
pub mod transport;

pub use config::{parse_bootstrap, parse_resolver, preset, ResolverPreset, ResolverSpec, PRESETS};
pub use error::{Error, Result};
pub use ipmap::{HostResolver, IpMap, IpSet, SystemResolver};
pub use padding::{apply_padding, size_needed, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
pub use protect::{NoopProtector, SocketProtector};
#[cfg(unix)]
pub use protect::UnixSocketProtector;
#[cfg(target_os = "linux")]
pub use protect::MarkProtector;
pub use transport::{DohResolver, DohResponse, DohTransport, Timeouts, TransportOptions};
