//! Integration tests for doh-dns
//!
//! Queries here are built with `hickory-proto` the way a stub resolver would
//! send them, then padded and parsed back. Nothing touches the network.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::{Edns, Message, Query};
use hickory_proto::rr::{Name, RecordType};

use doh_dns::{apply_padding, size_needed, IpMap, DEFAULT_BLOCK_SIZE};

/// Size of an OPT record with an empty RDATA and the root owner name
const EMPTY_OPT_LEN: usize = 11;

fn stub_query(name: &str, record_type: RecordType, edns: bool) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(0x2b1d)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
    if edns {
        let mut opt = Edns::new();
        opt.set_max_payload(1232);
        message.set_edns(opt);
    }
    message.to_vec().unwrap()
}

/// Check that `padded` ends with exactly one padding option of `pad` zeros
fn assert_trailing_padding(padded: &[u8], pad: usize) {
    let header = padded.len() - pad - 4;
    assert_eq!(&padded[header..header + 2], &[0, 12]);
    assert_eq!(
        u16::from_be_bytes([padded[header + 2], padded[header + 3]]) as usize,
        pad
    );
    assert!(padded[header + 4..].iter().all(|b| *b == 0));
}

#[test]
fn test_padded_queries_parse_and_align() {
    let names = [
        "a.io.",
        "example.com.",
        "www.example.org.",
        "a-rather-long-label-for-testing.subdomain.example.net.",
    ];

    for block_size in [16usize, 64, DEFAULT_BLOCK_SIZE, 468] {
        for name in names {
            for edns in [false, true] {
                let query = stub_query(name, RecordType::AAAA, edns);
                let prepared = if edns {
                    query.len()
                } else {
                    query.len() + EMPTY_OPT_LEN
                };
                let pad = size_needed(prepared, block_size);

                let padded = apply_padding(&query, block_size).unwrap();
                assert_eq!(padded.len(), prepared + 4 + pad);
                assert_eq!(padded.len() % block_size, 0, "{} / {}", name, block_size);
                assert_trailing_padding(&padded, pad);

                let parsed = Message::from_vec(&padded).unwrap();
                assert_eq!(parsed.id(), 0x2b1d);
                assert!(parsed.recursion_desired());
                assert_eq!(parsed.queries().len(), 1);
                assert_eq!(parsed.queries()[0].name().to_ascii(), name);
                assert_eq!(parsed.queries()[0].query_type(), RecordType::AAAA);
                assert!(parsed.extensions().is_some());
            }
        }
    }
}

#[test]
fn test_existing_edns_payload_size_survives() {
    let query = stub_query("example.com.", RecordType::A, true);
    let padded = apply_padding(&query, DEFAULT_BLOCK_SIZE).unwrap();

    let parsed = Message::from_vec(&padded).unwrap();
    let edns = parsed.extensions().as_ref().unwrap();
    assert_eq!(edns.max_payload(), 1232);
    assert_eq!(parsed.additionals().len(), 0);
}

#[test]
fn test_repadding_to_another_block_size() {
    let query = stub_query("example.com.", RecordType::A, false);
    let small = apply_padding(&query, 32).unwrap().into_owned();
    let large = apply_padding(&small, 256).unwrap();

    assert_eq!(large.len(), 256);
    let prepared = query.len() + EMPTY_OPT_LEN;
    assert_trailing_padding(&large, size_needed(prepared, 256));
    assert!(Message::from_vec(&large).is_ok());
}

#[test]
fn test_address_cache_round_across_threads() {
    let map = Arc::new(IpMap::new());
    let set = map.get("9.9.9.9");
    set.add("149.112.112.112");
    set.add("2620:fe::fe");
    assert_eq!(set.len(), 3);

    let second: IpAddr = "149.112.112.112".parse().unwrap();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let map = map.clone();
            std::thread::spawn(move || {
                let set = map.get("9.9.9.9");
                set.confirm(second);
                set.candidates()
            })
        })
        .collect();

    for handle in handles {
        let candidates = handle.join().unwrap();
        assert_eq!(candidates[0], second);
        assert_eq!(candidates.len(), 3);
    }
    assert!(Arc::ptr_eq(&set, &map.get("9.9.9.9")));

    set.disconfirm("9.9.9.9".parse().unwrap());
    assert_eq!(set.confirmed(), Some(second));
    set.disconfirm(second);
    assert_eq!(set.confirmed(), None);
}
