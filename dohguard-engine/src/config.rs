//! Configuration types for the tunnel engine

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use doh_dns::{
    parse_bootstrap, parse_resolver, ResolverSpec, SocketProtector, Timeouts, TransportOptions,
};
use doh_tun::TunConfig;

use crate::error::{Error, Result};

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [tunnel]
/// tun_address = "10.111.222.1/24"
/// fake_dns = "10.111.222.3"
///
/// [doh]
/// url = "cloudflare"
/// padding = true
///
/// [protect]
/// mode = "mark"
/// mark = 255
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub doh: DohConfig,

    #[serde(default)]
    pub protect: ProtectConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()?;
        self.doh.validate()?;
        self.protect.validate()?;
        Ok(())
    }

    /// Transport options for the configured resolver
    pub fn transport_options(&self) -> Result<TransportOptions> {
        Ok(TransportOptions::default()
            .with_timeouts(self.doh.timeouts())
            .with_bootstrap(self.doh.resolver()?.bootstrap)
            .with_protector(self.protect.protector()?))
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# dohguard configuration

[tunnel]
# TUN device to create when no file descriptor is handed over
tun_name = "dohguard"

# Address of the TUN interface, in CIDR notation
tun_address = "10.111.222.1/24"

# Sentinel DNS server: point the system resolver here. Only UDP packets
# sent to this address and port are forwarded; everything else is dropped.
fake_dns = "10.111.222.3"
fake_dns_port = 53

# MTU for the tunnel interface (default: 1500)
mtu = 1500

# How long close waits for the capture loop before aborting it
close_grace_ms = 1000

# Queries forwarded at once; further queries are answered SERVFAIL
max_in_flight = 256

# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

[doh]
# DoH endpoint: an https:// URL or one of "cloudflare", "google", "quad9"
url = "https://cloudflare-dns.com/dns-query"

# Resolver addresses tried before system DNS answers (optional).
# Presets carry their own list; setting this replaces it.
bootstrap = ["1.1.1.1", "1.0.0.1"]

# Pad queries to a multiple of padding_block_size (RFC 7830 / RFC 8467)
padding = true
padding_block_size = 128

# Timeouts in milliseconds
connect_timeout_ms = 3000
write_timeout_ms = 10000
response_header_timeout_ms = 20000

[protect]
# Keep upstream sockets out of the tunnel:
#   "none" - nothing to do (routes already exclude the resolver)
#   "unix" - hand each socket fd to a helper listening on `path`
#   "mark" - set SO_MARK to `mark` for policy routing (Linux)
mode = "none"
# path = "/run/dohguard/protect"
# mark = 255
"#
        .to_string()
    }
}

/// TUN and capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_tun_name")]
    pub tun_name: String,

    /// Interface address in CIDR notation
    #[serde(default = "default_tun_address")]
    pub tun_address: String,

    /// Sentinel DNS address
    #[serde(default = "default_fake_dns")]
    pub fake_dns: IpAddr,

    #[serde(default = "default_dns_port")]
    pub fake_dns_port: u16,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// Upper bound on concurrently forwarded queries
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tun_name: default_tun_name(),
            tun_address: default_tun_address(),
            fake_dns: default_fake_dns(),
            fake_dns_port: default_dns_port(),
            mtu: default_mtu(),
            close_grace_ms: default_close_grace_ms(),
            max_in_flight: default_max_in_flight(),
            log_level: default_log_level(),
        }
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<()> {
        let net = self.tun_net()?;

        if net.addr().is_ipv4() != self.fake_dns.is_ipv4() {
            return Err(Error::Config(format!(
                "fake_dns {} and tun_address {} are different address families",
                self.fake_dns, self.tun_address
            )));
        }

        if self.fake_dns_port == 0 {
            return Err(Error::Config("fake_dns_port must not be 0".into()));
        }

        if self.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be greater than 0".into()));
        }

        if self.mtu < doh_tun::config::MIN_MTU {
            return Err(Error::Config(format!(
                "mtu {} is below the minimum of {}",
                self.mtu,
                doh_tun::config::MIN_MTU
            )));
        }

        Ok(())
    }

    /// Parse the interface address
    pub fn tun_net(&self) -> Result<ipnet::IpNet> {
        self.tun_address.parse().map_err(|_| {
            Error::Config(format!("invalid tun_address '{}'", self.tun_address))
        })
    }

    /// Where captured DNS queries must be addressed
    pub fn fake_dns_addr(&self) -> SocketAddr {
        SocketAddr::new(self.fake_dns, self.fake_dns_port)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Device configuration for creating the TUN interface
    pub fn tun_config(&self) -> Result<TunConfig> {
        let builder = TunConfig::builder().name(&self.tun_name).mtu(self.mtu);
        let builder = match self.tun_net()? {
            ipnet::IpNet::V4(net) => builder.ipv4(net.addr(), net.prefix_len()),
            ipnet::IpNet::V6(net) => builder.ipv6(net.addr(), net.prefix_len()),
        };
        Ok(builder.build()?)
    }
}

/// Upstream resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DohConfig {
    /// `https://` URL or preset name
    #[serde(default = "default_doh_url")]
    pub url: String,

    #[serde(default)]
    pub bootstrap: Vec<String>,

    #[serde(default = "default_true")]
    pub padding: bool,

    #[serde(default = "default_padding_block_size")]
    pub padding_block_size: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_response_header_timeout_ms")]
    pub response_header_timeout_ms: u64,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            url: default_doh_url(),
            bootstrap: Vec::new(),
            padding: true,
            padding_block_size: default_padding_block_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            response_header_timeout_ms: default_response_header_timeout_ms(),
        }
    }
}

impl DohConfig {
    pub fn validate(&self) -> Result<()> {
        self.resolver()?;

        if self.padding_block_size == 0 || self.padding_block_size > doh_dns::MAX_BLOCK_SIZE {
            return Err(Error::Config(format!(
                "padding_block_size {} out of range (1..={})",
                self.padding_block_size,
                doh_dns::MAX_BLOCK_SIZE
            )));
        }

        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("response_header_timeout_ms", self.response_header_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        Ok(())
    }

    /// Resolve presets and apply the explicit bootstrap list, if any
    pub fn resolver(&self) -> Result<ResolverSpec> {
        let mut spec = parse_resolver(&self.url)?;
        if !self.bootstrap.is_empty() {
            spec.bootstrap = parse_bootstrap(self.bootstrap.as_slice())?;
        }
        Ok(spec)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
            response_header: Duration::from_millis(self.response_header_timeout_ms),
        }
    }

    /// Block size to pad to, or `None` with padding disabled
    pub fn block_size(&self) -> Option<usize> {
        self.padding.then_some(self.padding_block_size)
    }
}

/// How upstream sockets are kept out of the tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectMode {
    #[default]
    None,
    Unix,
    Mark,
}

/// Socket protection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectConfig {
    #[serde(default)]
    pub mode: ProtectMode,

    /// Helper socket for `mode = "unix"`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Firewall mark for `mode = "mark"`
    #[serde(default)]
    pub mark: Option<u32>,
}

impl ProtectConfig {
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            ProtectMode::None => Ok(()),
            ProtectMode::Unix if self.path.is_none() => {
                Err(Error::Config("protect mode 'unix' requires a path".into()))
            }
            ProtectMode::Mark if self.mark.is_none() => {
                Err(Error::Config("protect mode 'mark' requires a mark".into()))
            }
            _ => Ok(()),
        }
    }

    /// Build the protector for the configured mode
    pub fn protector(&self) -> Result<Arc<dyn SocketProtector>> {
        match self.mode {
            ProtectMode::None => Ok(Arc::new(doh_dns::NoopProtector)),
            ProtectMode::Unix => self.unix_protector(),
            ProtectMode::Mark => self.mark_protector(),
        }
    }

    #[cfg(unix)]
    fn unix_protector(&self) -> Result<Arc<dyn SocketProtector>> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Config("protect mode 'unix' requires a path".into()))?;
        Ok(Arc::new(doh_dns::UnixSocketProtector::new(path)))
    }

    #[cfg(not(unix))]
    fn unix_protector(&self) -> Result<Arc<dyn SocketProtector>> {
        Err(Error::Config("protect mode 'unix' is not supported on this platform".into()))
    }

    #[cfg(target_os = "linux")]
    fn mark_protector(&self) -> Result<Arc<dyn SocketProtector>> {
        let mark = self
            .mark
            .ok_or_else(|| Error::Config("protect mode 'mark' requires a mark".into()))?;
        Ok(Arc::new(doh_dns::MarkProtector::new(mark)))
    }

    #[cfg(not(target_os = "linux"))]
    fn mark_protector(&self) -> Result<Arc<dyn SocketProtector>> {
        Err(Error::Config("protect mode 'mark' is only supported on Linux".into()))
    }
}

fn default_tun_name() -> String {
    "dohguard".to_string()
}

fn default_tun_address() -> String {
    "10.111.222.1/24".to_string()
}

fn default_fake_dns() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 111, 222, 3))
}

fn default_dns_port() -> u16 {
    53
}

fn default_mtu() -> u16 {
    doh_tun::DEFAULT_MTU
}

fn default_close_grace_ms() -> u64 {
    1000
}

fn default_max_in_flight() -> usize {
    crate::tunnel::DEFAULT_MAX_IN_FLIGHT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_doh_url() -> String {
    "https://cloudflare-dns.com/dns-query".to_string()
}

fn default_true() -> bool {
    true
}

fn default_padding_block_size() -> usize {
    doh_dns::DEFAULT_BLOCK_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_write_timeout_ms() -> u64 {
    10000
}

fn default_response_header_timeout_ms() -> u64 {
    20000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config.tunnel.fake_dns_addr(), "10.111.222.3:53".parse().unwrap());
        assert_eq!(config.tunnel.close_grace(), Duration::from_secs(1));
        assert_eq!(config.doh.block_size(), Some(128));
        assert_eq!(config.doh.timeouts(), Timeouts::default());
        assert_eq!(config.protect.mode, ProtectMode::None);
    }

    #[test]
    fn test_rejects_zero_in_flight_limit() {
        let result = Config::from_toml(
            r#"
[tunnel]
max_in_flight = 0
"#,
        );
        assert!(result.unwrap_err().is_config_error());
    }

    #[test]
    fn test_default_resolver_has_bootstrap() {
        let resolver = Config::default().doh.resolver().unwrap();
        assert!(!resolver.bootstrap.is_empty());
    }

    #[test]
    fn test_sample_config_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        let resolver = config.doh.resolver().unwrap();

        assert_eq!(resolver.url, "https://cloudflare-dns.com/dns-query");
        assert_eq!(resolver.bootstrap.len(), 2);
        assert_eq!(config.tunnel.tun_name, "dohguard");
    }

    #[test]
    fn test_preset_url_expands() {
        let config = Config::from_toml(
            r#"
[doh]
url = "quad9"
padding = false
"#,
        )
        .unwrap();

        let resolver = config.doh.resolver().unwrap();
        assert_eq!(resolver.url, "https://dns.quad9.net/dns-query");
        assert!(!resolver.bootstrap.is_empty());
        assert_eq!(config.doh.block_size(), None);
    }

    #[test]
    fn test_rejects_plain_http_resolver() {
        let result = Config::from_toml(
            r#"
[doh]
url = "http://dns.example/dns-query"
"#,
        );
        assert!(result.unwrap_err().is_config_error());
    }

    #[test]
    fn test_rejects_bad_block_size() {
        for size in [0, 65532] {
            let toml = format!("[doh]\npadding_block_size = {}\n", size);
            assert!(Config::from_toml(&toml).is_err(), "size {}", size);
        }
        assert!(Config::from_toml("[doh]\npadding_block_size = 65531\n").is_ok());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        assert!(Config::from_toml("[doh]\nwrite_timeout_ms = 0\n").is_err());
    }

    #[test]
    fn test_rejects_bad_tun_address() {
        assert!(Config::from_toml("[tunnel]\ntun_address = \"10.111.222.1\"\n").is_err());
        assert!(Config::from_toml("[tunnel]\ntun_address = \"fd00::1/64\"\n").is_err());
    }

    #[test]
    fn test_ipv6_tunnel() {
        let config = Config::from_toml(
            r#"
[tunnel]
tun_address = "fd66::1/120"
fake_dns = "fd66::3"
"#,
        )
        .unwrap();

        let tun = config.tunnel.tun_config().unwrap();
        assert!(tun.ipv4.is_none());
        assert_eq!(tun.ipv6.unwrap().prefix_len, 120);
    }

    #[test]
    fn test_protect_modes() {
        assert!(Config::from_toml("[protect]\nmode = \"unix\"\n").is_err());
        assert!(Config::from_toml("[protect]\nmode = \"mark\"\n").is_err());
        assert!(Config::from_toml("[protect]\nmode = \"bogus\"\n").is_err());

        let config = Config::from_toml("[protect]\nmode = \"unix\"\npath = \"/tmp/p\"\n").unwrap();
        assert_eq!(config.protect.mode, ProtectMode::Unix);
        #[cfg(unix)]
        assert!(config.transport_options().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dohguard.toml");
        std::fs::write(&path, "[tunnel]\nmtu = 1400\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.tunnel.mtu, 1400);
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
