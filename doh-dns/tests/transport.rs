//! HTTPS round trips against a local resolver
//!
//! The server is a tokio-rustls acceptor in front of hyper with a throwaway
//! certificate for `localhost`. The path picks its behaviour: `/busy`
//! answers 503, `/empty` answers 200 with no body, anything else echoes the
//! query back.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, ACCEPT, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use doh_dns::transport::DNS_MESSAGE_MEDIA_TYPE;
use doh_dns::{DohResolver, DohTransport, Error, TransportOptions};

const QUERY: &[u8] = &[
    0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, b'a', 0x04,
    b't', b'e', b's', b't', 0x00, 0x00, 0x01, 0x00, 0x01,
];

/// What the server saw of one request
#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    path: String,
    content_type: Option<String>,
    accept: Option<String>,
    body: Bytes,
}

struct LocalResolver {
    port: u16,
    certificate: CertificateDer<'static>,
    accepted: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl LocalResolver {
    async fn start() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let certificate = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![certificate.clone()], key)
        .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let server_accepted = accepted.clone();
        let server_seen = seen.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server_accepted.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let seen = server_seen.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    let service = service_fn(move |request| answer(request, seen.clone()));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service)
                        .await;
                });
            }
        });

        Self {
            port,
            certificate,
            accepted,
            seen,
        }
    }

    fn transport(&self, path: &str, options: TransportOptions) -> DohTransport {
        let url = format!("https://localhost:{}{}", self.port, path);
        let options = options.with_root_certificates(vec![self.certificate.clone()]);
        DohTransport::new(&url, options).unwrap()
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

async fn answer(
    request: Request<Incoming>,
    seen: Arc<Mutex<Vec<Seen>>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let header = |name: HeaderName| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let content_type = header(CONTENT_TYPE);
    let accept = header(ACCEPT);
    let body = request.into_body().collect().await?.to_bytes();

    seen.lock().unwrap().push(Seen {
        method,
        path: path.clone(),
        content_type,
        accept,
        body: body.clone(),
    });

    let (status, body) = match path.as_str() {
        "/busy" => (StatusCode::SERVICE_UNAVAILABLE, Bytes::new()),
        "/empty" => (StatusCode::OK, Bytes::new()),
        _ => (StatusCode::OK, body),
    };
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, DNS_MESSAGE_MEDIA_TYPE)
        .body(Full::new(body))
        .unwrap())
}

fn loopback() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

#[tokio::test]
async fn test_query_posts_dns_message() {
    let server = LocalResolver::start().await;
    let transport = server.transport("/dns-query", TransportOptions::default());

    let response = transport.query(loopback(), QUERY).await.unwrap();
    assert_eq!(response.http_status, 200);
    assert_eq!(response.body, QUERY);
    assert_eq!(response.server, SocketAddr::new(loopback(), server.port));

    let seen = server.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, Method::POST);
    assert_eq!(seen[0].path, "/dns-query");
    assert_eq!(seen[0].content_type.as_deref(), Some(DNS_MESSAGE_MEDIA_TYPE));
    assert_eq!(seen[0].accept.as_deref(), Some(DNS_MESSAGE_MEDIA_TYPE));
    assert_eq!(seen[0].body.as_ref(), QUERY);
}

#[tokio::test]
async fn test_unavailable_status_is_http_error() {
    let server = LocalResolver::start().await;
    let transport = server.transport("/busy", TransportOptions::default());

    let err = transport.query(loopback(), QUERY).await.unwrap_err();
    assert!(matches!(err, Error::Http { status: 503 }), "unexpected error: {}", err);
    assert_eq!(err.http_status(), Some(503));
    assert!(err.is_retryable());
    assert_eq!(transport.idle_connections(), 0);
}

#[tokio::test]
async fn test_empty_success_is_rejected() {
    let server = LocalResolver::start().await;
    let transport = server.transport("/empty", TransportOptions::default());

    let err = transport.query(loopback(), QUERY).await.unwrap_err();
    assert!(matches!(err, Error::EmptyResponse), "unexpected error: {}", err);
    assert_eq!(server.seen().len(), 1);
}

#[tokio::test]
async fn test_second_query_reuses_connection() {
    let server = LocalResolver::start().await;
    let protected = Arc::new(AtomicUsize::new(0));
    let counter = protected.clone();
    let options = TransportOptions::default().with_protector(Arc::new(move |_fd: i32| {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    }));
    let transport = server.transport("/dns-query", options);

    let first = transport.query(loopback(), QUERY).await.unwrap();
    assert_eq!(transport.idle_connections(), 1);
    let second = transport.query(loopback(), &QUERY[..20]).await.unwrap();

    assert_eq!(first.body, QUERY);
    assert_eq!(second.body, &QUERY[..20]);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(protected.load(Ordering::SeqCst), 1);
    assert_eq!(server.seen().len(), 2);
    assert_eq!(transport.idle_connections(), 1);
}

#[tokio::test]
async fn test_untrusted_certificate_is_transport_error() {
    let server = LocalResolver::start().await;
    let url = format!("https://localhost:{}/dns-query", server.port);
    let transport = DohTransport::new(&url, TransportOptions::default()).unwrap();

    let err = transport.query(loopback(), QUERY).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "unexpected error: {}", err);
    assert!(server.seen().is_empty());
}

#[test]
fn test_garbage_root_certificate_is_config_error() {
    let garbage = CertificateDer::from(vec![1, 2, 3]);
    let options = TransportOptions::default().with_root_certificates(vec![garbage]);
    let result = DohTransport::new("https://localhost/dns-query", options);
    assert!(matches!(result, Err(Error::Config(_))));
}
