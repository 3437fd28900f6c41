//! Error types for the tunnel engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or driving the tunnel
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// DoH transport or padding error
    #[error("DNS error: {0}")]
    Dns(#[from] doh_dns::Error),

    /// TUN device error
    #[error("TUN error: {0}")]
    Tun(#[from] doh_tun::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not allowed in the current state
    #[error("invalid lifecycle transition: {0}")]
    Lifecycle(String),
}

impl Error {
    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::Dns(doh_dns::Error::Config(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_classification() {
        assert!(Error::Config("x".into()).is_config_error());
        assert!(Error::Dns(doh_dns::Error::Config("bad url".into())).is_config_error());
        assert!(!Error::Dns(doh_dns::Error::EmptyResponse).is_config_error());
        assert!(!Error::Lifecycle("closed".into()).is_config_error());
    }
}
