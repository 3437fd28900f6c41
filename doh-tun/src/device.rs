//! TUN device backed by `tun-rs`
//!
//! A device is either created here, which needs root or `CAP_NET_ADMIN`:
//!
//! ```rust,ignore
//! let config = TunConfig::builder()
//!     .name("dohguard")
//!     .ipv4_cidr("10.111.222.1/24")?
//!     .build()?;
//!
//! let device = TunDevice::create(config).await?;
//! ```
//!
//! or adopted from a descriptor. A host VPN service (Android `VpnService`,
//! a privileged helper) usually opens the interface itself and hands over
//! its fd:
//!
//! ```rust,ignore
//! let device = unsafe { TunDevice::from_fd(fd, "tun0", 1500) }?;
//! ```

use tokio::sync::RwLock;

use crate::config::TunConfig;
use crate::error::{Error, Result};
use crate::transport::{TunInfo, TunTransport};

#[cfg(unix)]
use std::os::unix::io::RawFd;

/// TUN device owned by the tunnel
///
/// The inner device sits behind an async lock so that [`TunTransport::close`]
/// can drop it, and with it the file descriptor, while reads and writes only
/// ever take shared access.
pub struct TunDevice {
    inner: RwLock<Option<tun_rs::AsyncDevice>>,
    info: TunInfo,
}

impl TunDevice {
    /// Bring up a new interface
    pub async fn create(config: TunConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = tun_rs::DeviceBuilder::new().mtu(config.mtu);
        if let Some(name) = &config.name {
            builder = builder.name(name);
        }
        if let Some(v4) = &config.ipv4 {
            builder = builder.ipv4(v4.address, v4.prefix_len, None);
        }
        if let Some(v6) = &config.ipv6 {
            builder = builder.ipv6(v6.address, v6.prefix_len);
        }

        let device = builder.build_async().map_err(creation_failed)?;
        let name = device.name().map_err(creation_failed)?;

        log::info!("Tunnel interface {} up, mtu {}", name, config.mtu);

        Ok(Self {
            inner: RwLock::new(Some(device)),
            info: TunInfo {
                name,
                mtu: config.mtu,
            },
        })
    }

    /// Wrap a TUN file descriptor opened by someone else
    ///
    /// # Safety
    ///
    /// `fd` must be an open TUN descriptor that nobody else closes; the
    /// returned device takes ownership of it.
    #[cfg(unix)]
    pub unsafe fn from_fd(fd: RawFd, name: impl Into<String>, mtu: u16) -> Result<Self> {
        let device = tun_rs::AsyncDevice::from_fd(fd)
            .map_err(|e| Error::DeviceCreation(format!("adopting fd {}: {}", fd, e)))?;

        let name = name.into();
        log::info!("Adopted tunnel fd {} as {}, mtu {}", fd, name, mtu);

        Ok(Self {
            inner: RwLock::new(Some(device)),
            info: TunInfo { name, mtu },
        })
    }

    /// Check whether the device has been released
    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.is_none()
    }
}

fn creation_failed(e: impl std::fmt::Display) -> Error {
    Error::DeviceCreation(e.to_string())
}

#[async_trait::async_trait]
impl TunTransport for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let guard = self.inner.read().await;
        let device = guard.as_ref().ok_or(Error::Closed)?;
        device.recv(buf).await.map_err(Error::Io)
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let guard = self.inner.read().await;
        let device = guard.as_ref().ok_or(Error::Closed)?;
        device.send(buf).await.map_err(Error::Io)
    }

    async fn close(&self) {
        if self.inner.write().await.take().is_some() {
            log::info!("Closed TUN device {}", self.info.name);
        }
    }

    fn info(&self) -> &TunInfo {
        &self.info
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("info", &self.info)
            .finish()
    }
}
