//! Resolver specification parsing
//!
//! A resolver is given either as a full DoH URL or as the name of a built-in
//! preset:
//! - `https://dns.example/dns-query` - any DoH endpoint
//! - `cloudflare`, `google`, `quad9` - well-known public resolvers, which
//!   also carry bootstrap addresses (so does a preset's own URL)

use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A well-known public DoH resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverPreset {
    pub name: &'static str,
    pub url: &'static str,
    pub bootstrap: &'static [&'static str],
}

/// Built-in resolver presets
pub const PRESETS: &[ResolverPreset] = &[
    ResolverPreset {
        name: "cloudflare",
        url: "https://cloudflare-dns.com/dns-query",
        bootstrap: &["1.1.1.1", "1.0.0.1", "2606:4700:4700::1111"],
    },
    ResolverPreset {
        name: "google",
        url: "https://dns.google/dns-query",
        bootstrap: &["8.8.8.8", "8.8.4.4", "2001:4860:4860::8888"],
    },
    ResolverPreset {
        name: "quad9",
        url: "https://dns.quad9.net/dns-query",
        bootstrap: &["9.9.9.9", "149.112.112.112", "2620:fe::fe"],
    },
];

/// Look up a preset by name (case-insensitive)
pub fn preset(name: &str) -> Option<&'static ResolverPreset> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// A resolver URL plus the addresses to try before system DNS answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverSpec {
    pub url: String,
    pub bootstrap: Vec<IpAddr>,
}

impl ResolverSpec {
    /// Host and port of the resolver, as `host:port`, for reachability checks
    pub fn host_port(&self) -> Result<String> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid resolver URL '{}': {}", self.url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Config(format!("resolver URL '{}' has no host", self.url)))?;
        Ok(format!("{}:{}", host, parsed.port_or_known_default().unwrap_or(443)))
    }
}

impl std::fmt::Display for ResolverSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl FromStr for ResolverSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_resolver(s)
    }
}

/// Parse a resolver given as a preset name or an `https://` URL
pub fn parse_resolver(s: &str) -> Result<ResolverSpec> {
    let s = s.trim();

    if let Some(preset) = preset(s) {
        return Ok(ResolverSpec {
            url: preset.url.to_string(),
            bootstrap: parse_bootstrap(preset.bootstrap)?,
        });
    }

    if s.starts_with("https://") {
        // A preset's own URL keeps that preset's bootstrap addresses
        let bootstrap = match PRESETS.iter().find(|p| p.url == s) {
            Some(preset) => parse_bootstrap(preset.bootstrap)?,
            None => Vec::new(),
        };
        return Ok(ResolverSpec {
            url: s.to_string(),
            bootstrap,
        });
    }

    Err(Error::Config(format!(
        "unknown resolver '{}', expected an https:// URL or one of: {}",
        s,
        PRESETS.iter().map(|p| p.name).collect::<Vec<_>>().join(", ")
    )))
}

/// Parse bootstrap IP literals
pub fn parse_bootstrap<S: AsRef<str>>(addrs: &[S]) -> Result<Vec<IpAddr>> {
    addrs
        .iter()
        .map(|a| {
            let a = a.as_ref().trim();
            a.trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map_err(|_| Error::Config(format!("invalid bootstrap address '{}'", a)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preset() {
        let spec = parse_resolver("cloudflare").unwrap();
        assert_eq!(spec.url, "https://cloudflare-dns.com/dns-query");
        assert_eq!(spec.bootstrap.len(), 3);

        let spec = parse_resolver(" Quad9 ").unwrap();
        assert_eq!(spec.url, "https://dns.quad9.net/dns-query");
    }

    #[test]
    fn test_parse_url() {
        let spec: ResolverSpec = "https://doh.example/dns-query".parse().unwrap();
        assert_eq!(spec.url, "https://doh.example/dns-query");
        assert!(spec.bootstrap.is_empty());
        assert_eq!(spec.to_string(), "https://doh.example/dns-query");
    }

    #[test]
    fn test_preset_url_carries_bootstrap() {
        let spec = parse_resolver("https://cloudflare-dns.com/dns-query").unwrap();
        assert_eq!(spec, parse_resolver("cloudflare").unwrap());
        assert!(spec.bootstrap.contains(&"1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_rejects_plain_dns() {
        assert!(parse_resolver("8.8.8.8").is_err());
        assert!(parse_resolver("http://dns.google/dns-query").is_err());
        assert!(parse_resolver("tls://dns.google").is_err());
    }

    #[test]
    fn test_host_port() {
        let spec = parse_resolver("google").unwrap();
        assert_eq!(spec.host_port().unwrap(), "dns.google:443");

        let spec = parse_resolver("https://doh.example:8443/q").unwrap();
        assert_eq!(spec.host_port().unwrap(), "doh.example:8443");
    }

    #[test]
    fn test_parse_bootstrap() {
        let addrs = parse_bootstrap(&["1.1.1.1", "[2606:4700::1111]"]).unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[1].is_ipv6());
        assert!(parse_bootstrap(&["one.one.one.one"]).is_err());
    }

    #[test]
    fn test_presets_are_https() {
        for preset in PRESETS {
            assert!(preset.url.starts_with("https://"));
            assert!(parse_bootstrap(preset.bootstrap).is_ok());
        }
    }
}
