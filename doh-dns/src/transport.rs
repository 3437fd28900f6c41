//! DNS-over-HTTPS round trips
//!
//! A [`DohTransport`] is bound to one resolver URL and is immutable once
//! built. Each query goes to a caller-chosen address of the resolver host, so
//! the caller decides the fallback order and learns which address worked.
//!
//! Sockets are created with `socket2` so the protect callback can see the fd
//! before the connection leaves the host. TLS comes from `tokio-rustls` with
//! the webpki root store, and HTTP/1.1 from `hyper`.
//!
//! ## Timeouts
//!
//! - **connect** (default 3 s): TCP connection establishment
//! - **write** (default 10 s): TLS and HTTP handshakes, waiting for the
//!   connection to accept a request
//! - **response header** (default 20 s): sending the request until the
//!   response headers arrive, and again for reading the body
//!
//! Every timeout surfaces as a retryable [`Error::Timeout`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use rustls_pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::protect::{NoopProtector, SocketProtector};

/// Media type of DoH request and response bodies (RFC 8484)
pub const DNS_MESSAGE_MEDIA_TYPE: &str = "application/dns-message";

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default wait for response headers
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(20);

/// Default TLS/HTTP handshake and write timeout
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest DNS message a response body may hold
const MAX_RESPONSE_SIZE: usize = 65535;

const USER_AGENT_VALUE: &str = concat!("dohguard/", env!("CARGO_PKG_VERSION"));

/// Per-operation deadlines for a DoH round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub write: Duration,
    pub response_header: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            write: DEFAULT_WRITE_TIMEOUT,
            response_header: DEFAULT_RESPONSE_HEADER_TIMEOUT,
        }
    }
}

/// Construction options for [`DohTransport`]
#[derive(Clone)]
pub struct TransportOptions {
    /// Connection deadlines
    pub timeouts: Timeouts,
    /// Resolver addresses known up front, tried alongside system DNS results
    pub bootstrap: Vec<IpAddr>,
    /// Called with every new upstream socket before it connects
    pub protector: Arc<dyn SocketProtector>,
    /// Trust anchors accepted in addition to the webpki roots
    pub root_certificates: Vec<CertificateDer<'static>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            bootstrap: Vec::new(),
            protector: Arc::new(NoopProtector),
            root_certificates: Vec::new(),
        }
    }
}

impl TransportOptions {
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: Vec<IpAddr>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = protector;
        self
    }

    /// Also trust `certificates`, e.g. a private resolver's CA
    pub fn with_root_certificates(mut self, certificates: Vec<CertificateDer<'static>>) -> Self {
        self.root_certificates = certificates;
        self
    }
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("timeouts", &self.timeouts)
            .field("bootstrap", &self.bootstrap)
            .field("root_certificates", &self.root_certificates.len())
            .finish_non_exhaustive()
    }
}

/// Successful DoH answer
#[derive(Debug, Clone)]
pub struct DohResponse {
    /// Raw DNS response message
    pub body: Vec<u8>,
    /// HTTP status of the response
    pub http_status: u16,
    /// Address that served the query
    pub server: SocketAddr,
}

/// A resolver endpoint that can answer raw DNS queries
///
/// The tunnel holds one of these behind an `Arc` and swaps the whole value
/// when the upstream changes.
#[async_trait]
pub trait DohResolver: Send + Sync {
    /// Resolver URL, for telemetry
    fn url(&self) -> &str;

    /// Host part of the URL, used as the address cache key
    fn hostname(&self) -> &str;

    /// TCP port of the resolver
    fn port(&self) -> u16;

    /// Addresses configured for the resolver host
    fn bootstrap_addrs(&self) -> &[IpAddr];

    /// Send `message` to the resolver at `addr` and return its answer
    async fn query(&self, addr: IpAddr, message: &[u8]) -> Result<DohResponse>;
}

type Sender = SendRequest<Full<Bytes>>;

/// HTTPS transport for a single resolver URL
pub struct DohTransport {
    url: String,
    hostname: String,
    port: u16,
    /// Value of the Host header
    authority: String,
    path_and_query: String,
    server_name: ServerName<'static>,
    options: TransportOptions,
    tls: TlsConnector,
    /// At most one idle HTTP/1.1 connection per resolver address
    idle: Mutex<HashMap<IpAddr, Sender>>,
}

impl DohTransport {
    /// Build a transport for `url`, which must be an `https://` URL with a host
    pub fn new(url: &str, options: TransportOptions) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid resolver URL '{}': {}", url, e)))?;

        if parsed.scheme() != "https" {
            return Err(Error::Config(format!(
                "resolver URL must use https, got '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Config(format!("resolver URL '{}' has no host", url)))?;
        let hostname = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = parsed.port_or_known_default().unwrap_or(443);
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let path_and_query = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };

        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|e| Error::Config(format!("invalid TLS server name '{}': {}", hostname, e)))?;

        let mut root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for certificate in &options.root_certificates {
            root_store
                .add(certificate.clone())
                .map_err(|e| Error::Config(format!("invalid root certificate: {}", e)))?;
        }
        let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("failed to create TLS config: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        log::debug!(
            "Created DoH transport for {} (host {}, port {}, {} bootstrap address(es))",
            url,
            hostname,
            port,
            options.bootstrap.len()
        );

        Ok(Self {
            url: url.to_string(),
            hostname,
            port,
            authority,
            path_and_query,
            server_name,
            options,
            tls: TlsConnector::from(Arc::new(tls_config)),
            idle: Mutex::new(HashMap::new()),
        })
    }

    /// Configured deadlines
    pub fn timeouts(&self) -> Timeouts {
        self.options.timeouts
    }

    /// Number of pooled idle connections
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn take_idle(&self, addr: IpAddr) -> Option<Sender> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr)
            .filter(|sender| !sender.is_closed())
    }

    fn put_idle(&self, addr: IpAddr, sender: Sender) {
        if !sender.is_closed() {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(addr, sender);
        }
    }

    /// Open a protected TCP connection to `server`
    async fn open_socket(&self, server: SocketAddr) -> Result<TcpStream> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(server),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = socket.as_raw_fd();
            if !self.options.protector.protect(fd) {
                return Err(Error::Protect(fd));
            }
        }

        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(&server.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => {
                return Err(Error::Transport(format!("connect to {} failed: {}", server, e)))
            }
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;

        stream.ready(tokio::io::Interest::WRITABLE).await?;
        if let Some(e) = stream.take_error()? {
            return Err(Error::Transport(format!("connect to {} failed: {}", server, e)));
        }

        Ok(stream)
    }

    /// Establish TCP, TLS and HTTP/1.1 to `server`
    async fn connect(&self, server: SocketAddr) -> Result<Sender> {
        let timeouts = self.options.timeouts;

        let tcp = tokio::time::timeout(timeouts.connect, self.open_socket(server))
            .await
            .map_err(|_| Error::Timeout(format!("TCP connect to {}", server)))??;

        let tls = tokio::time::timeout(
            timeouts.write,
            self.tls.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| Error::Timeout(format!("TLS handshake with {}", server)))?
        .map_err(|e| Error::Transport(format!("TLS handshake with {} failed: {}", server, e)))?;

        let (sender, connection) = tokio::time::timeout(
            timeouts.write,
            hyper::client::conn::http1::handshake(TokioIo::new(tls)),
        )
        .await
        .map_err(|_| Error::Timeout(format!("HTTP handshake with {}", server)))?
        .map_err(|e| Error::Transport(format!("HTTP handshake with {} failed: {}", server, e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("DoH connection to {} closed: {}", server, e);
            }
        });

        log::debug!("Connected to DoH server {}", server);
        Ok(sender)
    }

    /// POST one query over an established connection
    async fn round_trip(
        &self,
        sender: &mut Sender,
        server: SocketAddr,
        message: &[u8],
    ) -> Result<DohResponse> {
        let timeouts = self.options.timeouts;

        tokio::time::timeout(timeouts.write, sender.ready())
            .await
            .map_err(|_| Error::Timeout(format!("connection to {} not ready", server)))?
            .map_err(|e| Error::Transport(format!("connection to {} lost: {}", server, e)))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.path_and_query.as_str())
            .header(HOST, self.authority.as_str())
            .header(CONTENT_TYPE, DNS_MESSAGE_MEDIA_TYPE)
            .header(ACCEPT, DNS_MESSAGE_MEDIA_TYPE)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .body(Full::new(Bytes::copy_from_slice(message)))
            .map_err(|e| Error::Transport(format!("failed to build request: {}", e)))?;

        let response = tokio::time::timeout(timeouts.response_header, sender.send_request(request))
            .await
            .map_err(|_| Error::Timeout(format!("response headers from {}", server)))?
            .map_err(|e| Error::Transport(format!("request to {} failed: {}", server, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
            });
        }

        let body = tokio::time::timeout(
            timeouts.response_header,
            Limited::new(response.into_body(), MAX_RESPONSE_SIZE).collect(),
        )
        .await
        .map_err(|_| Error::Timeout(format!("response body from {}", server)))?
        .map_err(|e| Error::Transport(format!("failed to read response from {}: {}", server, e)))?
        .to_bytes();

        if body.is_empty() {
            return Err(Error::EmptyResponse);
        }

        Ok(DohResponse {
            body: body.to_vec(),
            http_status: status.as_u16(),
            server,
        })
    }
}

#[async_trait]
impl DohResolver for DohTransport {
    fn url(&self) -> &str {
        &self.url
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn bootstrap_addrs(&self) -> &[IpAddr] {
        &self.options.bootstrap
    }

    async fn query(&self, addr: IpAddr, message: &[u8]) -> Result<DohResponse> {
        let server = SocketAddr::new(addr, self.port);

        if let Some(mut sender) = self.take_idle(addr) {
            match self.round_trip(&mut sender, server, message).await {
                Ok(response) => {
                    self.put_idle(addr, sender);
                    return Ok(response);
                }
                // The server may have dropped an idle connection; retry fresh
                Err(Error::Transport(e)) => {
                    log::debug!("Pooled connection to {} failed ({}), reconnecting", server, e);
                }
                Err(e) => return Err(e),
            }
        }

        let mut sender = self.connect(server).await?;
        let response = self.round_trip(&mut sender, server, message).await?;
        self.put_idle(addr, sender);
        Ok(response)
    }
}

impl std::fmt::Debug for DohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohTransport")
            .field("url", &self.url)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(unix)]
fn connect_in_progress(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == std::io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}
