//! Integration tests for doh-tun
//!
//! # Permission Requirements
//!
//! Tests that create a real TUN interface need elevated privileges and are
//! marked with `#[ignore]`.
//!
//! ```bash
//! # Option 1: Run as root
//! sudo cargo test -p doh-tun --test integration -- --ignored
//!
//! # Option 2: Add CAP_NET_ADMIN capability to the test binary
//! cargo test -p doh-tun --test integration --no-run
//! sudo setcap cap_net_admin+ep target/debug/deps/integration-*
//! cargo test -p doh-tun --test integration -- --ignored
//! ```
//!
//! ## Test Categories
//!
//! - `test_*` - no privileges required
//! - `test_privileged_*` - require root (marked with `#[ignore]`)

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use doh_tun::mock::{IpPacketBuilder, MockTunDevice};
use doh_tun::packet::checksums_valid;
use doh_tun::{TunConfig, TunDevice, TunTransport, UdpPacket};

#[test]
fn test_config_with_ipv4_and_ipv6() {
    let config = TunConfig::builder()
        .name("test0")
        .ipv4(Ipv4Addr::new(10, 111, 222, 1), 24)
        .ipv6(Ipv6Addr::new(0xfd66, 0, 0, 0, 0, 0, 0, 1), 120)
        .mtu(1400)
        .build()
        .unwrap();

    assert_eq!(config.mtu, 1400);
    assert_eq!(config.ipv4.unwrap().prefix_len, 24);
    assert_eq!(config.ipv6.unwrap().prefix_len, 120);
}

#[test]
fn test_default_mtu() {
    let config = TunConfig::builder()
        .ipv4(Ipv4Addr::new(10, 111, 222, 1), 24)
        .build()
        .unwrap();
    assert_eq!(config.mtu, doh_tun::DEFAULT_MTU);
}

/// A query read from the device is answered with a packet the host stack
/// would accept.
#[tokio::test]
async fn test_mock_query_reply_cycle() {
    let tun = MockTunDevice::new();
    let client = Ipv4Addr::new(10, 111, 222, 1);
    let query = IpPacketBuilder::ipv4(client, Ipv4Addr::new(10, 111, 222, 3))
        .udp(41000, 53)
        .payload(vec![0x12, 0x34, 0x01, 0x00])
        .build()
        .unwrap();
    tun.inject(query);

    let mut buf = vec![0u8; doh_tun::MAX_PACKET_SIZE];
    let n = tun.recv(&mut buf).await.unwrap();
    let parsed = UdpPacket::parse(&buf[..n]).unwrap();
    assert_eq!(parsed.dst, "10.111.222.3:53".parse::<SocketAddr>().unwrap());

    let reply = parsed.reply(&[0x12, 0x34, 0x81, 0x80]).unwrap();
    tun.send(&reply).await.unwrap();

    let sent = tun.wait_for_sent(1, Duration::from_secs(1)).await;
    assert!(checksums_valid(&sent[0]));
    let answer = UdpPacket::parse(&sent[0]).unwrap();
    assert_eq!(answer.src, parsed.dst);
    assert_eq!(answer.dst, parsed.src);
    assert_eq!(answer.payload, vec![0x12, 0x34, 0x81, 0x80]);
}

#[tokio::test]
#[ignore = "requires root or CAP_NET_ADMIN"]
async fn test_privileged_create_and_close() {
    let config = TunConfig::builder()
        .name("dohtest0")
        .ipv4_cidr("10.111.222.1/24")
        .unwrap()
        .build()
        .unwrap();

    let device = TunDevice::create(config).await.unwrap();
    assert_eq!(device.name(), "dohtest0");
    assert_eq!(device.mtu(), doh_tun::DEFAULT_MTU);

    device.close().await;
    device.close().await;
    assert!(device.is_closed().await);

    let mut buf = [0u8; 64];
    assert!(device.recv(&mut buf).await.unwrap_err().is_closed());
}
