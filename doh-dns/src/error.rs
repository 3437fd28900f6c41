//! Error types for DoH operations

use thiserror::Error;

/// Result type alias for DoH operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving over DNS-over-HTTPS
#[derive(Debug, Error)]
pub enum Error {
    /// Bad resolver URL, scheme or option
    #[error("DoH configuration error: {0}")]
    Config(String),

    /// Network or TLS failure during a round trip
    #[error("DoH transport error: {0}")]
    Transport(String),

    /// A connect, write or response deadline elapsed
    #[error("DoH request timed out: {0}")]
    Timeout(String),

    /// Resolver answered with a non-success HTTP status
    #[error("DoH server returned HTTP {status}")]
    Http { status: u16 },

    /// Resolver answered 2xx with no body
    #[error("DoH server returned an empty response")]
    EmptyResponse,

    /// The socket protect callback refused the socket
    #[error("failed to protect socket (fd {0})")]
    Protect(i32),

    /// System hostname lookup failed
    #[error("failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    /// DNS message could not be walked or padded
    #[error("padding error: {0}")]
    Padding(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if the caller should move on to the next candidate address
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Timeout(_)
                | Error::Http { .. }
                | Error::EmptyResponse
                | Error::Protect(_)
                | Error::Io(_)
        )
    }

    /// HTTP status carried by this error, if the resolver answered at all
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Http { status } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("connect".into()).is_retryable());
        assert!(Error::Http { status: 502 }.is_retryable());
        assert!(Error::EmptyResponse.is_retryable());
        assert!(Error::Protect(7).is_retryable());
        assert!(!Error::Config("http://".into()).is_retryable());
        assert!(!Error::Padding("truncated".into()).is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(Error::Http { status: 404 }.http_status(), Some(404));
        assert_eq!(Error::EmptyResponse.http_status(), None);
    }
}
