//! Tunnel state, per-query summaries and listeners

use hickory_proto::op::Message;
use tokio::sync::mpsc;

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Created but not started
    Stopped,
    /// Capture loop is running
    Running,
    /// Closed for good; cannot be restarted
    Closed,
}

impl TunnelState {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            TunnelState::Stopped => "Stopped",
            TunnelState::Running => "Running",
            TunnelState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Counters kept by a running tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Packets read from the TUN device
    pub packets_rx: u64,
    /// Packets that were not DNS for the sentinel address
    pub packets_dropped: u64,
    /// Queries dispatched upstream
    pub queries: u64,
    /// Queries answered with [`QueryStatus::Complete`]
    pub answered: u64,
    /// Queries that ended in any other status
    pub failed: u64,
    /// Queries answered SERVFAIL unforwarded because too many were in flight
    pub shed: u64,
}

impl TunnelStats {
    /// Queries that have not finished yet (or were cancelled)
    pub fn in_flight(&self) -> u64 {
        self.queries.saturating_sub(self.answered + self.failed)
    }
}

/// Outcome of one forwarded query
///
/// The numeric codes are stable and shared with embedding applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QueryStatus {
    /// Answer written back to the TUN device
    Complete = 0,
    /// No resolver address produced an HTTP response
    SendFailed = 1,
    /// Resolver answered with a non-2xx status
    HttpError = 2,
    /// Query could not be parsed or padded
    BadQuery = 3,
    /// Response body empty or malformed
    BadResponse = 4,
    /// Anything else, e.g. the TUN write failed
    InternalError = 5,
}

impl QueryStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => QueryStatus::Complete,
            1 => QueryStatus::SendFailed,
            2 => QueryStatus::HttpError,
            3 => QueryStatus::BadQuery,
            4 => QueryStatus::BadResponse,
            5 => QueryStatus::InternalError,
            _ => return None,
        })
    }

    pub fn is_success(self) -> bool {
        self == QueryStatus::Complete
    }

    /// Classify a transport error from the last attempted address
    pub fn from_error(err: &doh_dns::Error) -> Self {
        match err {
            doh_dns::Error::Http { .. } => QueryStatus::HttpError,
            doh_dns::Error::EmptyResponse => QueryStatus::BadResponse,
            doh_dns::Error::Padding(_) => QueryStatus::BadQuery,
            doh_dns::Error::Config(_) => QueryStatus::InternalError,
            _ => QueryStatus::SendFailed,
        }
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryStatus::Complete => "complete",
            QueryStatus::SendFailed => "send failed",
            QueryStatus::HttpError => "HTTP error",
            QueryStatus::BadQuery => "bad query",
            QueryStatus::BadResponse => "bad response",
            QueryStatus::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// Everything known about one query once it has finished
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySummary {
    /// Wall time from dispatch to reply, in milliseconds
    pub latency_ms: f64,
    /// Query as sent upstream (after padding)
    pub query: Vec<u8>,
    /// Response body, empty on failure
    pub response: Vec<u8>,
    /// Resolver address that answered, empty if none did
    pub server: String,
    pub resolver_url: String,
    pub status: QueryStatus,
    /// HTTP status of the last response seen, 0 if none
    pub http_status: u16,
}

/// Receives notifications about forwarded queries
///
/// Called synchronously from the dispatch task; implementations must not
/// block.
pub trait QueryListener: Send + Sync {
    /// A query is about to be sent to `url`
    fn on_query(&self, url: &str);

    /// A query has finished, successfully or not
    fn on_response(&self, summary: &QuerySummary);
}

/// Listener that logs every query
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl QueryListener for LoggingListener {
    fn on_query(&self, url: &str) {
        log::trace!("Forwarding query to {}", url);
    }

    fn on_response(&self, summary: &QuerySummary) {
        let question = describe_question(&summary.query);
        if summary.status.is_success() {
            log::info!(
                "{} via {} ({:.1} ms, {} bytes)",
                question,
                summary.server,
                summary.latency_ms,
                summary.response.len()
            );
        } else {
            log::warn!(
                "{} failed: {} (HTTP {}, {:.1} ms, {})",
                question,
                summary.status,
                summary.http_status,
                summary.latency_ms,
                summary.resolver_url
            );
        }
    }
}

/// Render the first question of a DNS message as `name TYPE`
pub fn describe_question(message: &[u8]) -> String {
    match Message::from_vec(message) {
        Ok(msg) => match msg.queries().first() {
            Some(q) => format!("{} {}", q.name(), q.query_type()),
            None => "<no question>".to_string(),
        },
        Err(_) => format!("<{} undecodable bytes>", message.len()),
    }
}

/// Events published by [`ChannelListener`]
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A query is being sent to this resolver URL
    Query { url: String },
    /// A query has finished
    Response(QuerySummary),
}

/// Listener that forwards events onto a bounded channel
///
/// Never blocks: when the receiver falls behind, events are dropped.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::Sender<TunnelEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::Sender<TunnelEvent>) -> Self {
        Self { tx }
    }

    /// Create a listener together with the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TunnelEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn publish(&self, event: TunnelEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::trace!("Event channel closed");
            }
        }
    }
}

impl QueryListener for ChannelListener {
    fn on_query(&self, url: &str) {
        self.publish(TunnelEvent::Query {
            url: url.to_string(),
        });
    }

    fn on_response(&self, summary: &QuerySummary) {
        self.publish(TunnelEvent::Response(summary.clone()));
    }
}
