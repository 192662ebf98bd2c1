//! Client identity resolution shared by the rate limiter and CIDR protection.
//!
//! # Precedence
//!
//! 1. `X-Forwarded-For`: entries are scanned **right to left** (the entry
//!    appended by the proxy closest to us first) and the first one that is a
//!    global unicast, non-private address wins. Blank and unparsable entries
//!    are skipped.
//! 2. `X-Real-IP`: same scan and filter.
//! 3. The transport peer address, from axum's `ConnectInfo<SocketAddr>` or a
//!    textual [`RemoteAddr`] extension.
//!
//! If no header yields an acceptable candidate (for example a chain made only
//! of private hops), the peer address is used. When the peer address itself
//! cannot be determined the request fails with [`AddressResolutionError`];
//! there is no shared "unknown" identity, since that would let a client hide
//! among or impersonate others.
//!
//! # Security Warning
//!
//! Forwarding headers are client controlled unless a reverse proxy in front
//! of this service overwrites them. Deploy behind a trusted proxy and block
//! direct access, otherwise clients can rotate spoofed addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use thiserror::Error;
use tracing::trace;

/// Proxy chain header, `client, proxy1, proxy2`.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Single-address header set by some proxies.
pub const X_REAL_IP: &str = "x-real-ip";

/// Textual transport peer address (`host:port`, `[v6]:port`).
///
/// Attach this extension when the host runtime does not provide
/// `ConnectInfo<SocketAddr>`. `ConnectInfo` takes precedence when both exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Failure to determine the client address of a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressResolutionError {
    /// Neither `ConnectInfo` nor `RemoteAddr` is present.
    #[error("no peer address available for request")]
    MissingPeer,

    /// The peer address is not in `host:port` form.
    #[error("cannot parse host:port from '{addr}': {reason}")]
    MalformedHostPort { addr: String, reason: &'static str },

    /// The host part is not an IP literal.
    #[error("IP address format of '{0}' is invalid")]
    InvalidIp(String),
}

/// Opaque per-client identity used to partition limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey(IpAddr);

impl ClientKey {
    /// Address this key was derived from.
    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        // IPv4-mapped IPv6 and plain IPv4 are the same client.
        Self(ip.to_canonical())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a resolved address came from, for trace logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    ForwardedFor,
    RealIp,
    Peer,
}

/// Resolve the client address of a request.
///
/// # Errors
///
/// Returns [`AddressResolutionError`] when no header yields an acceptable
/// address and the peer address is missing or malformed.
pub fn resolve_client_ip<B>(req: &Request<B>) -> Result<IpAddr, AddressResolutionError> {
    let (ip, source) = match forwarded_ip(req.headers()) {
        Some(found) => found,
        None => (peer_ip(req)?, Source::Peer),
    };
    trace!(client_ip = %ip, source = ?source, "Resolved client address");
    Ok(ip)
}

/// Resolve the [`ClientKey`] of a request.
///
/// # Errors
///
/// Same as [`resolve_client_ip`].
pub fn resolve_client_key<B>(req: &Request<B>) -> Result<ClientKey, AddressResolutionError> {
    resolve_client_ip(req).map(ClientKey::from)
}

/// Parse the host part of a `host:port` peer address as an IP.
///
/// # Errors
///
/// [`AddressResolutionError::MalformedHostPort`] when the port separator or
/// IPv6 brackets are missing, [`AddressResolutionError::InvalidIp`] when the
/// host is not an IP literal.
pub fn parse_peer_addr(raw: &str) -> Result<IpAddr, AddressResolutionError> {
    let host = split_host(raw)?;
    host.parse()
        .map_err(|_| AddressResolutionError::InvalidIp(host.to_string()))
}

/// Whether `ip` is acceptable as a forwarded client address: global unicast
/// and not in a private range.
pub fn is_public_unicast(ip: &IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_link_local()
                || v4.is_private())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unicast_link_local()
                || v6.is_unique_local())
        }
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<(IpAddr, Source)> {
    rightmost_public(headers, X_FORWARDED_FOR)
        .map(|ip| (ip, Source::ForwardedFor))
        .or_else(|| rightmost_public(headers, X_REAL_IP).map(|ip| (ip, Source::RealIp)))
}

/// Scan every value of `name`, last header line first, each right to left.
fn rightmost_public(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    values
        .iter()
        .rev()
        .flat_map(|value| value.rsplit(','))
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .find(is_public_unicast)
}

fn peer_ip<B>(req: &Request<B>) -> Result<IpAddr, AddressResolutionError> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Ok(addr.ip());
    }
    match req.extensions().get::<RemoteAddr>() {
        Some(RemoteAddr(raw)) => parse_peer_addr(raw),
        None => Err(AddressResolutionError::MissingPeer),
    }
}

fn split_host(raw: &str) -> Result<&str, AddressResolutionError> {
    let malformed = |reason| AddressResolutionError::MalformedHostPort {
        addr: raw.to_string(),
        reason,
    };

    if let Some(rest) = raw.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| malformed("missing ']' in address"))?;
        if !after.starts_with(':') {
            return Err(malformed("missing port in address"));
        }
        return Ok(host);
    }

    let (host, _port) = raw
        .rsplit_once(':')
        .ok_or_else(|| malformed("missing port in address"))?;
    if host.contains(':') {
        return Err(malformed("too many colons in address"));
    }
    Ok(host)
}
