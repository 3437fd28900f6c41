//! dohguard engine
//!
//! Drives a DNS-over-HTTPS tunnel: DNS queries the host sends to a sentinel
//! address on a TUN interface are padded, POSTed to a DoH resolver and
//! answered in place.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dohguard_engine::{Config, DnsTunnel, LoggingListener, TunnelOptions};
//! use doh_dns::{DohTransport, IpMap};
//! use doh_tun::TunDevice;
//!
//! #[tokio::main]
//! async fn main() -> dohguard_engine::Result<()> {
//!     let config = Config::load("dohguard.toml")?;
//!     let tun = TunDevice::create(config.tunnel.tun_config()?).await?;
//!     let resolver = DohTransport::new(&config.doh.resolver()?.url, config.transport_options()?)?;
//!
//!     let tunnel = DnsTunnel::new(
//!         TunnelOptions::from(&config),
//!         Arc::new(tun),
//!         Arc::new(resolver),
//!         Arc::new(LoggingListener),
//!         Arc::new(IpMap::new()),
//!     );
//!     tunnel.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     tunnel.close().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod ping;
pub mod tunnel;

pub use config::{Config, DohConfig, ProtectConfig, ProtectMode, TunnelConfig};
pub use error::{Error, Result};
pub use event::{
    ChannelListener, LoggingListener, QueryListener, QueryStatus, QuerySummary, TunnelEvent,
    TunnelState, TunnelStats,
};
pub use ping::{ping_all, PingResult};
pub use tunnel::{forward_query, DnsTunnel, TunnelOptions};
