//! In-memory TUN device for tests
//!
//! [`MockTunDevice`] lets a test play the host network stack: inject packets
//! that the tunnel will read, then inspect what the tunnel wrote back.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::packet::{UdpPacket, IPPROTO_UDP};
use crate::transport::{TunInfo, TunTransport};

/// Fake TUN device backed by channels
pub struct MockTunDevice {
    info: TunInfo,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    sent_notify: Notify,
    close_calls: AtomicUsize,
    releases: AtomicUsize,
}

impl MockTunDevice {
    pub fn new() -> Self {
        Self::with_info("mock0", crate::DEFAULT_MTU)
    }

    pub fn with_info(name: impl Into<String>, mtu: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            info: TunInfo {
                name: name.into(),
                mtu,
            },
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
            close_calls: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    /// Queue a packet for the next `recv`. Returns false once closed.
    pub fn inject(&self, packet: impl Into<Vec<u8>>) -> bool {
        self.inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(packet.into()).is_ok())
    }

    /// Packets written by the tunnel so far
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `count` packets have been written, or `timeout`
    /// passes. Returns everything written so far either way.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.sent_notify.notified();
            let sent = self.sent_packets();
            if sent.len() >= count {
                return sent;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.sent_packets();
            }
        }
    }

    /// Number of times `close` was called
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Number of times the device was actually released (0 or 1)
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Default for MockTunDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunTransport for MockTunDevice {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let packet = self
            .inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::Closed)?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if self.release_count() > 0 {
            return Err(Error::Closed);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf.to_vec());
        self.sent_notify.notify_waiters();
        Ok(buf.len())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let tx = self
            .inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if tx.is_some() {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn info(&self) -> &TunInfo {
        &self.info
    }
}

impl std::fmt::Debug for MockTunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTunDevice")
            .field("info", &self.info)
            .field("close_calls", &self.close_count())
            .finish()
    }
}

/// Builder for raw IP packets carrying UDP
#[derive(Debug, Clone)]
pub struct IpPacketBuilder {
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
    protocol: u8,
}

impl IpPacketBuilder {
    pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self::new(src.into(), dst.into())
    }

    pub fn ipv6(src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        Self::new(src.into(), dst.into())
    }

    fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self {
            src,
            dst,
            src_port: 0,
            dst_port: 0,
            payload: Vec::new(),
            protocol: IPPROTO_UDP,
        }
    }

    pub fn udp(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Overwrite the IP protocol / next-header field after encoding
    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn build(self) -> Result<Vec<u8>> {
        let mut packet = UdpPacket::new(
            SocketAddr::new(self.src, self.src_port),
            SocketAddr::new(self.dst, self.dst_port),
            self.payload,
        )
        .encode()?;

        if self.protocol != IPPROTO_UDP {
            let offset = if self.src.is_ipv4() { 9 } else { 6 };
            packet[offset] = self.protocol;
        }
        Ok(packet)
    }
}
