//! Fuzz testing for client address resolution.
//!
//! Forwarding headers and the peer address are attacker controlled, so
//! resolution must never panic and must only ever yield the peer address or
//! a public unicast address taken from a header.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_client_ip
//! cargo +nightly fuzz run fuzz_client_ip -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use axum::body::Body;
use axum::http::{HeaderValue, Request};
use libfuzzer_sys::fuzz_target;
use request_gate::middleware::ip::is_public_unicast;
use request_gate::middleware::{
    RemoteAddr, X_FORWARDED_FOR, X_REAL_IP, parse_peer_addr, resolve_client_ip,
};

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    forwarded_for: Option<&'a [u8]>,
    real_ip: Option<&'a [u8]>,
    peer: Option<&'a str>,
}

fuzz_target!(|input: Input<'_>| {
    let mut req = Request::new(Body::empty());

    if let Some(raw) = input.forwarded_for {
        if let Ok(value) = HeaderValue::from_bytes(raw) {
            req.headers_mut().insert(X_FORWARDED_FOR, value);
        }
    }
    if let Some(raw) = input.real_ip {
        if let Ok(value) = HeaderValue::from_bytes(raw) {
            req.headers_mut().insert(X_REAL_IP, value);
        }
    }
    if let Some(peer) = input.peer {
        req.extensions_mut().insert(RemoteAddr(peer.to_string()));
    }

    let peer_ip = input.peer.and_then(|p| parse_peer_addr(p).ok());

    match resolve_client_ip(&req) {
        Ok(ip) => assert!(
            Some(ip) == peer_ip || is_public_unicast(&ip),
            "resolved {ip} is neither the peer nor a public address"
        ),
        Err(_) => assert!(peer_ip.is_none(), "peer was parseable but resolution failed"),
    }
});
