//! DNS tunnel: capture queries from a TUN device and answer them over DoH
//!
//! The tunnel reads raw IP packets from a [`TunTransport`]. UDP datagrams
//! addressed to the sentinel DNS address are forwarded to the current
//! [`DohResolver`]; everything else is dropped. Each query is handled on its
//! own task, so a slow resolver address never holds up other lookups.
//!
//! ```text
//!   TUN ──recv──► parse ──► dispatch task ──► pad ──► DoH POST (candidates)
//!    ▲                                                     │
//!    └────────────send◄── reply packet ◄───────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use doh_dns::{apply_padding, DohResolver, DohResponse, IpMap, IpSet};
use doh_tun::{TunTransport, UdpPacket, MAX_PACKET_SIZE};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{QueryListener, QueryStatus, QuerySummary, TunnelState, TunnelStats};

/// Default sentinel DNS server the host is pointed at
pub const DEFAULT_FAKE_DNS: &str = "10.111.222.3:53";

/// Default time `close` waits for the capture loop to wind down
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Default cap on queries forwarded at the same time
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Smallest message that can be a DNS response (the fixed header)
const DNS_HEADER_LEN: usize = 12;

/// Tunnel behaviour that does not change over its lifetime
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Only UDP datagrams sent to this address are treated as DNS
    pub fake_dns: SocketAddr,
    /// Pad queries to this block size; `None` sends them unpadded
    pub block_size: Option<usize>,
    pub close_grace: Duration,
    /// Queries beyond this many in flight are answered SERVFAIL at once
    pub max_in_flight: usize,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            fake_dns: SocketAddr::from(([10, 111, 222, 3], 53)),
            block_size: Some(doh_dns::DEFAULT_BLOCK_SIZE),
            close_grace: DEFAULT_CLOSE_GRACE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl From<&Config> for TunnelOptions {
    fn from(config: &Config) -> Self {
        Self {
            fake_dns: config.tunnel.fake_dns_addr(),
            block_size: config.doh.block_size(),
            close_grace: config.tunnel.close_grace(),
            max_in_flight: config.tunnel.max_in_flight,
        }
    }
}

#[derive(Default)]
struct Counters {
    packets_rx: AtomicU64,
    packets_dropped: AtomicU64,
    queries: AtomicU64,
    answered: AtomicU64,
    failed: AtomicU64,
    shed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the tunnel handle, the capture loop and dispatches
struct Shared {
    options: TunnelOptions,
    tun: Arc<dyn TunTransport>,
    resolver: RwLock<Arc<dyn DohResolver>>,
    listener: Arc<dyn QueryListener>,
    ip_map: Arc<IpMap>,
    counters: Counters,
    dispatch_slots: Arc<Semaphore>,
}

/// Result of trying the candidate addresses for one query
struct Exchange {
    response: std::result::Result<DohResponse, QueryStatus>,
    http_status: u16,
}

/// A DNS-over-HTTPS tunnel session
///
/// Lifecycle: `Stopped` → [`start`](Self::start) → `Running` →
/// [`close`](Self::close) → `Closed`. A closed tunnel cannot be restarted.
pub struct DnsTunnel {
    shared: Arc<Shared>,
    state: Mutex<TunnelState>,
    task: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

impl DnsTunnel {
    pub fn new(
        options: TunnelOptions,
        tun: Arc<dyn TunTransport>,
        resolver: Arc<dyn DohResolver>,
        listener: Arc<dyn QueryListener>,
        ip_map: Arc<IpMap>,
    ) -> Self {
        let dispatch_slots = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
        Self {
            shared: Arc::new(Shared {
                options,
                tun,
                resolver: RwLock::new(resolver),
                listener,
                ip_map,
                counters: Counters::default(),
                dispatch_slots,
            }),
            state: Mutex::new(TunnelState::Stopped),
            task: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    /// Start the capture loop on the current tokio runtime.
    ///
    /// Returns immediately; a second call while running does nothing.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            TunnelState::Running => return Ok(()),
            TunnelState::Closed => {
                return Err(Error::Lifecycle("cannot start a closed tunnel".into()));
            }
            TunnelState::Stopped => {}
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Lifecycle(format!("no tokio runtime: {}", e)))?;

        let shared = self.shared.clone();
        let token = self.token.clone();
        let handle = runtime.spawn(capture_loop(shared, token));

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *state = TunnelState::Running;

        log::info!(
            "DNS tunnel started on {} (sentinel {}, resolver {})",
            self.shared.tun.name(),
            self.shared.options.fake_dns,
            self.resolver().url()
        );
        Ok(())
    }

    /// Stop the tunnel and release the TUN device.
    ///
    /// Safe to call more than once and from any state; the device is closed
    /// exactly once.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == TunnelState::Closed {
                return Ok(());
            }
            *state = TunnelState::Closed;
        }

        self.token.cancel();

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.shared.options.close_grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Capture loop ended abnormally: {}", e),
                Err(_) => {
                    log::warn!(
                        "Capture loop did not stop within {:?}, aborting",
                        self.shared.options.close_grace
                    );
                    task.abort();
                }
            }
        }

        self.shared.tun.close().await;
        log::info!("DNS tunnel closed");
        Ok(())
    }

    /// Switch to a different resolver. Queries already in flight finish
    /// against the resolver they started with.
    pub fn set_dns(&self, resolver: Arc<dyn DohResolver>) {
        log::info!("Switching resolver to {}", resolver.url());
        *self
            .shared
            .resolver
            .write()
            .unwrap_or_else(PoisonError::into_inner) = resolver;
    }

    /// The resolver new queries will use
    pub fn resolver(&self) -> Arc<dyn DohResolver> {
        self.shared.resolver()
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> TunnelStats {
        self.shared.counters.snapshot()
    }

    /// Address cache shared by every query of this tunnel
    pub fn ip_map(&self) -> &Arc<IpMap> {
        &self.shared.ip_map
    }
}

impl Drop for DnsTunnel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for DnsTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsTunnel")
            .field("state", &self.state())
            .field("options", &self.shared.options)
            .field("tun", self.shared.tun.info())
            .finish_non_exhaustive()
    }
}

async fn capture_loop(shared: Arc<Shared>, token: CancellationToken) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = shared.tun.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) if e.is_closed() => {
                    log::debug!("TUN device closed, stopping capture loop");
                    break;
                }
                Err(e) => {
                    log::error!("TUN read failed, stopping capture loop: {}", e);
                    break;
                }
            },
        };

        shared.counters.packets_rx.fetch_add(1, Ordering::Relaxed);

        let packet = match UdpPacket::parse(&buf[..n]) {
            Some(packet) if packet.dst == shared.options.fake_dns => packet,
            _ => {
                shared.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Dropped {} byte non-DNS packet", n);
                continue;
            }
        };

        let permit = match shared.dispatch_slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                shared.shed(&packet).await;
                continue;
            }
        };

        let shared = shared.clone();
        let token = token.child_token();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = shared.dispatch(packet, permit) => {}
            }
        });
    }

    log::debug!("Capture loop finished");
}

impl Shared {
    fn resolver(&self) -> Arc<dyn DohResolver> {
        self.resolver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forward one captured query and write the answer back
    ///
    /// The dispatch slot is given back as soon as the reply is written.
    async fn dispatch(&self, packet: UdpPacket, slot: OwnedSemaphorePermit) {
        let started = Instant::now();
        let resolver = self.resolver();
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        self.listener.on_query(resolver.url());

        let mut summary = forward_query(
            resolver.as_ref(),
            &self.ip_map,
            self.options.block_size,
            &packet.payload,
        )
        .await;

        let answer = if summary.status.is_success() {
            Some(summary.response.clone())
        } else {
            servfail(&packet.payload)
        };

        if let Some(answer) = answer {
            if let Err(e) = self.write_reply(&packet, &answer).await {
                log::warn!("Failed to answer {}: {}", packet.src, e);
                summary.status = QueryStatus::InternalError;
            }
        }
        drop(slot);

        summary.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let counter = if summary.status.is_success() {
            &self.counters.answered
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.listener.on_response(&summary);
    }

    /// Answer SERVFAIL without forwarding; every dispatch slot is taken
    async fn shed(&self, packet: &UdpPacket) {
        self.counters.shed.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "{} queries in flight, refusing query from {}",
            self.options.max_in_flight,
            packet.src
        );
        if let Some(answer) = servfail(&packet.payload) {
            if let Err(e) = self.write_reply(packet, &answer).await {
                log::warn!("Failed to answer {}: {}", packet.src, e);
            }
        }
    }

    async fn write_reply(&self, request: &UdpPacket, answer: &[u8]) -> doh_tun::Result<()> {
        let reply = request.reply(answer)?;
        self.tun.send(&reply).await?;
        Ok(())
    }
}

/// Send one raw DNS query to `resolver`, padded to `block_size` if given.
///
/// Addresses come from `ip_map` (plus the resolver's bootstrap list) and are
/// tried confirmed-first until one answers. That address becomes the
/// confirmed one; each address that failed is disconfirmed. Failures are
/// reported through the summary's status, never as an error.
pub async fn forward_query(
    resolver: &dyn DohResolver,
    ip_map: &Arc<IpMap>,
    block_size: Option<usize>,
    query: &[u8],
) -> QuerySummary {
    let started = Instant::now();
    let mut summary = QuerySummary {
        latency_ms: 0.0,
        query: query.to_vec(),
        response: Vec::new(),
        server: String::new(),
        resolver_url: resolver.url().to_string(),
        status: QueryStatus::InternalError,
        http_status: 0,
    };

    if let Some(block_size) = block_size {
        match apply_padding(query, block_size) {
            Ok(padded) => summary.query = padded.into_owned(),
            Err(e) => {
                log::debug!("Cannot pad query: {}", e);
                summary.status = QueryStatus::BadQuery;
                summary.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                return summary;
            }
        }
    }

    let exchange = exchange(resolver, ip_map, &summary.query).await;
    summary.http_status = exchange.http_status;
    match exchange.response {
        Ok(response) => {
            summary.server = response.server.ip().to_string();
            summary.response = response.body;
            summary.status = QueryStatus::Complete;
        }
        Err(status) => summary.status = status,
    }

    summary.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    summary
}

/// Try the resolver's addresses, confirmed first, until one answers
async fn exchange(resolver: &dyn DohResolver, ip_map: &Arc<IpMap>, query: &[u8]) -> Exchange {
    let set = match address_set(resolver, ip_map).await {
        Some(set) => set,
        None => {
            return Exchange {
                response: Err(QueryStatus::InternalError),
                http_status: 0,
            }
        }
    };

    let mut last_error = None;
    let mut http_status = 0;

    for addr in set.candidates() {
        match resolver.query(addr, query).await {
            Ok(response) if response.body.len() < DNS_HEADER_LEN => {
                log::debug!("Short response ({} bytes) from {}", response.body.len(), addr);
                set.disconfirm(addr);
                return Exchange {
                    response: Err(QueryStatus::BadResponse),
                    http_status: response.http_status,
                };
            }
            Ok(response) => {
                set.confirm(addr);
                return Exchange {
                    http_status: response.http_status,
                    response: Ok(response),
                };
            }
            Err(e) => {
                log::debug!("Query to {} via {} failed: {}", resolver.hostname(), addr, e);
                set.disconfirm(addr);
                if let Some(status) = e.http_status() {
                    http_status = status;
                }
                last_error = Some(e);
            }
        }
    }

    let status = match last_error {
        Some(ref e) => QueryStatus::from_error(e),
        None => {
            log::warn!("No addresses known for {}", resolver.hostname());
            QueryStatus::SendFailed
        }
    };
    Exchange {
        response: Err(status),
        http_status,
    }
}

/// Look up (or create) the address set for the resolver host
///
/// Bootstrap addresses seed the set up front, so a host whose system
/// resolver points back at this tunnel never waits on itself.
async fn address_set(resolver: &dyn DohResolver, ip_map: &Arc<IpMap>) -> Option<Arc<IpSet>> {
    let bootstrap = resolver.bootstrap_addrs();
    if !bootstrap.is_empty() {
        return Some(ip_map.get_with_seed(resolver.hostname(), bootstrap));
    }

    let ip_map = ip_map.clone();
    let hostname = resolver.hostname().to_string();

    // Seeding a new set blocks on system DNS
    match tokio::task::spawn_blocking(move || ip_map.get(&hostname)).await {
        Ok(set) => Some(set),
        Err(e) => {
            log::error!("Address lookup for {} failed: {}", resolver.hostname(), e);
            None
        }
    }
}

/// Build a SERVFAIL answer to `query`, echoing its ID and question
fn servfail(query: &[u8]) -> Option<Vec<u8>> {
    let request = Message::from_vec(query).ok()?;

    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::ServFail);
    response.add_queries(request.queries().to_vec());
    response.to_vec().ok()
}
