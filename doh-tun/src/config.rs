//! Addressing and MTU for the tunnel interface

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};
use crate::DEFAULT_MTU;

/// IPv4 address of the tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Config {
    pub address: Ipv4Addr,
    /// Network prefix length (e.g., 24 for /24)
    pub prefix_len: u8,
}

impl Ipv4Config {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }
}

/// IPv6 address of the tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Config {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
}

impl Ipv6Config {
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }
}

/// Configuration for creating a TUN device
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name; the OS picks one when unset
    pub name: Option<String>,
    pub ipv4: Option<Ipv4Config>,
    pub ipv6: Option<Ipv6Config>,
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            ipv4: None,
            ipv6: None,
            mtu: DEFAULT_MTU,
        }
    }
}

impl TunConfig {
    pub fn builder() -> TunConfigBuilder {
        TunConfigBuilder::new()
    }

    /// Reject configurations the device builder would choke on
    pub fn validate(&self) -> Result<()> {
        if self.ipv4.is_none() && self.ipv6.is_none() {
            return Err(Error::Config("tunnel interface needs an address".into()));
        }
        if let Some(v4) = &self.ipv4 {
            check_prefix(v4.prefix_len, 32)?;
        }
        if let Some(v6) = &self.ipv6 {
            check_prefix(v6.prefix_len, 128)?;
        }
        if self.mtu < MIN_MTU {
            return Err(Error::Config(format!("mtu {} below {}", self.mtu, MIN_MTU)));
        }

        Ok(())
    }
}

/// Smallest MTU accepted for the tunnel interface
pub const MIN_MTU: u16 = 576;

fn check_prefix(prefix_len: u8, bits: u8) -> Result<()> {
    if prefix_len > bits {
        return Err(Error::InvalidPrefix(format!("/{} exceeds /{}", prefix_len, bits)));
    }
    Ok(())
}

/// Fluent construction of a [`TunConfig`]
#[derive(Debug, Default)]
pub struct TunConfigBuilder {
    config: TunConfig,
}

impl TunConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn ipv4(mut self, address: impl Into<Ipv4Addr>, prefix_len: u8) -> Self {
        self.config.ipv4 = Some(Ipv4Config::new(address.into(), prefix_len));
        self
    }

    /// Set the IPv4 address from CIDR notation (e.g., "10.111.222.1/24")
    pub fn ipv4_cidr(self, cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| Error::InvalidAddress(cidr.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidAddress(cidr.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidPrefix(cidr.to_string()))?;
        Ok(self.ipv4(addr, prefix))
    }

    pub fn ipv6(mut self, address: impl Into<Ipv6Addr>, prefix_len: u8) -> Self {
        self.config.ipv6 = Some(Ipv6Config::new(address.into(), prefix_len));
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Finish, rejecting anything [`TunConfig::validate`] would
    pub fn build(self) -> Result<TunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
