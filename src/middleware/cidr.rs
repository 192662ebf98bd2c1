//! CIDR allow-list middleware.
//!
//! Only clients whose resolved address (see [`super::ip`]) is a loopback
//! address or falls inside one of the configured networks reach the inner
//! service. Everyone else gets `401 endpoint is protected`.
//!
//! # Usage
//!
//! ```rust,ignore
//! // Tailscale CGNAT range plus loopback
//! let layer = CidrProtectLayer::new(["100.64.0.0/10"])?;
//! ```
//!
//! An empty list restricts the endpoint to loopback clients.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use super::ip::resolve_client_ip;
use super::pipeline::plain_response;

/// A network that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse network CIDR '{0}'")]
pub struct InvalidCidr(pub String);

/// Parsed CIDR network range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    /// Network address
    network: IpAddr,
    /// Prefix length (e.g., 24 for /24)
    prefix_len: u8,
}

impl CidrRange {
    /// Check if an IP address is contained within this CIDR range.
    ///
    /// IPv4-mapped IPv6 addresses are matched against IPv4 networks.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, &ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // IPv4 and IPv6 don't match
            _ => false,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl FromStr for CidrRange {
    type Err = InvalidCidr;

    /// Parse `10.0.0.0/8`, `::1/128`, or a bare address (implicit /32 or /128).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidCidr(s.to_string());
        let trimmed = s.trim();

        let (addr, prefix) = match trimmed.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (trimmed, None),
        };

        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max_prefix,
        };
        if prefix_len > max_prefix {
            return Err(invalid());
        }

        Ok(Self {
            network,
            prefix_len,
        })
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Layer restricting access to loopback plus a list of networks.
#[derive(Debug, Clone)]
pub struct CidrProtectLayer {
    allowed: Arc<Vec<CidrRange>>,
}

impl CidrProtectLayer {
    /// Parse every network up front.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCidr`] for the first entry that does not parse.
    pub fn new<I, S>(networks: I) -> Result<Self, InvalidCidr>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = networks
            .into_iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<CidrRange>, _>>()?;

        info!(
            networks = ?allowed.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "CIDR protection enabled (loopback always allowed)"
        );

        Ok(Self {
            allowed: Arc::new(allowed),
        })
    }

    /// Whether `ip` may reach the protected handler.
    pub fn allows(&self, ip: &IpAddr) -> bool {
        ip.to_canonical().is_loopback() || self.allowed.iter().any(|net| net.contains(ip))
    }
}

impl<S> Layer<S> for CidrProtectLayer {
    type Service = CidrProtectService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CidrProtectService {
            inner,
            policy: self.clone(),
        }
    }
}

/// CIDR allow-list service wrapper.
#[derive(Clone)]
pub struct CidrProtectService<S> {
    inner: S,
    policy: CidrProtectLayer,
}

impl<S> Service<Request<Body>> for CidrProtectService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let ip = match resolve_client_ip(&req) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, path = %req.uri().path(), "Cannot resolve client address for CIDR check");
                return Box::pin(async move {
                    Ok(plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
                });
            }
        };

        if !self.policy.allows(&ip) {
            debug!(client_ip = %ip, path = %req.uri().path(), "Client outside allowed networks");
            return Box::pin(async {
                Ok(plain_response(StatusCode::UNAUTHORIZED, "endpoint is protected"))
            });
        }

        Box::pin(async move { inner.call(req).await })
    }
}
