//! TCP handshake latency checks for resolver hosts

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::TcpStream;

/// Default per-host timeout
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(3000);

/// Outcome of pinging one `host:port`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingResult {
    pub host: String,
    /// Handshake time in milliseconds, 0 on failure
    pub ping_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Measure the TCP connect time to one `host:port`
pub async fn ping(host: &str, timeout: Duration) -> PingResult {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, TcpStream::connect(host)).await;

    let error = match outcome {
        Ok(Ok(_stream)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("timed out after {} ms", timeout.as_millis())),
    };

    match error {
        None => PingResult {
            host: host.to_string(),
            ping_ms: started.elapsed().as_millis() as u64,
            success: true,
            error: None,
        },
        Some(error) => {
            log::debug!("Ping {} failed: {}", host, error);
            PingResult {
                host: host.to_string(),
                ping_ms: 0,
                success: false,
                error: Some(error),
            }
        }
    }
}

/// Ping every host concurrently; results come back in input order
pub async fn ping_all<S: AsRef<str>>(hosts: &[S], timeout: Duration) -> Vec<PingResult> {
    futures::future::join_all(hosts.iter().map(|h| ping(h.as_ref(), timeout))).await
}

/// Serialize results as a JSON array
pub fn to_json(results: &[PingResult]) -> String {
    serde_json::to_string(results).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ping_listening_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let result = ping(&addr, Duration::from_secs(1)).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.host, addr);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_ping_all_keeps_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();

        // Bind then drop to get a port with nothing listening
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };

        let hosts = vec![closed.clone(), open.clone(), "not a host".to_string()];
        let results = ping_all(&hosts, Duration::from_secs(1)).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].host, closed);
        assert!(!results[0].success);
        assert_eq!(results[0].ping_ms, 0);
        assert_eq!(results[1].host, open);
        assert!(results[1].success);
        assert!(!results[2].success);
    }

    #[test]
    fn test_json_omits_empty_error() {
        let results = vec![
            PingResult {
                host: "1.1.1.1:443".into(),
                ping_ms: 12,
                success: true,
                error: None,
            },
            PingResult {
                host: "192.0.2.1:443".into(),
                ping_ms: 0,
                success: false,
                error: Some("timed out after 3000 ms".into()),
            },
        ];

        assert_eq!(
            to_json(&results),
            r#"[{"host":"1.1.1.1:443","ping_ms":12,"success":true},{"host":"192.0.2.1:443","ping_ms":0,"success":false,"error":"timed out after 3000 ms"}]"#
        );
    }
}
