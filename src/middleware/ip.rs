//! Client address resolution.
//!
//! The resolved address is recorded in the request context and used as the
//! default rate limiter key.
//!
//! # Resolution Order
//!
//! 1. First hop of `X-Forwarded-For`
//! 2. `X-Real-IP`
//! 3. The socket peer address
//! 4. [`UNKNOWN_CLIENT`]
//!
//! Forwarding headers (1 and 2) are honoured only when the socket peer is a
//! trusted proxy. With no trusted proxies configured every peer is trusted,
//! which is convenient in development and unsafe on a public listener:
//! clients could then rotate spoofed addresses to dodge rate limiting.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Address recorded when nothing identifies the client.
///
/// All such requests share one rate-limit bucket.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A parsed CIDR block such as `10.0.0.0/8` or `::1/128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    network: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    /// Parse CIDR notation. A bare address is a single-host block.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (addr, prefix) = match text.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (text, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let width = host_bits(&network);
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= width)?,
            None => width,
        };

        Some(Self { network, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(*addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(*addr) & mask
            }
            _ => false,
        }
    }
}

fn host_bits(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Proxies whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    blocks: Vec<CidrBlock>,
}

impl TrustedProxies {
    /// Build from CIDR strings; unparsable entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let blocks = cidrs
            .iter()
            .filter_map(|cidr| {
                let block = CidrBlock::parse(cidr);
                if block.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                block
            })
            .collect();

        Self { blocks }
    }

    pub fn is_enabled(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Whether forwarding headers from `peer` may be believed.
    pub fn trusts(&self, peer: Option<IpAddr>) -> bool {
        if self.blocks.is_empty() {
            return true;
        }
        peer.is_some_and(|ip| self.blocks.iter().any(|block| block.contains(&ip)))
    }
}

/// Resolve the client address for a request.
pub fn resolve_client_address(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    proxies: &TrustedProxies,
) -> String {
    let peer_ip = peer.map(|addr| addr.ip());

    if let Some(forwarded) = forwarded_address(headers) {
        if proxies.trusts(peer_ip) {
            return forwarded.to_string();
        }
        debug!(
            peer = ?peer_ip,
            forwarded,
            "Ignoring forwarding header from untrusted peer"
        );
    }

    peer_ip.map_or_else(|| UNKNOWN_CLIENT.to_string(), |ip| ip.to_string())
}

fn forwarded_address(headers: &HeaderMap) -> Option<&str> {
    let xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    xff.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn peer(ip: &str) -> Option<SocketAddr> {
        Some(SocketAddr::new(ip.parse().unwrap(), 40000))
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrBlock::parse("10.0.0.0/8").unwrap().prefix, 8);
        assert_eq!(CidrBlock::parse("::1/128").unwrap().prefix, 128);
        assert_eq!(CidrBlock::parse("192.168.1.1").unwrap().prefix, 32);
        assert!(CidrBlock::parse("not-an-ip").is_none());
        assert!(CidrBlock::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let block = CidrBlock::parse("192.168.1.0/24").unwrap();
        assert!(block.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!block.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!block.contains(&"::1".parse().unwrap()));

        let everything = CidrBlock::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_for_first_hop_wins() {
        let h = headers(&[("x-forwarded-for", "203.0.113.50, 70.41.3.18")]);
        let addr = resolve_client_address(&h, None, &TrustedProxies::default());
        assert_eq!(addr, "203.0.113.50");
    }

    #[test]
    fn test_real_ip_fallback() {
        let h = headers(&[("x-real-ip", "198.51.100.7")]);
        let addr = resolve_client_address(&h, peer("10.0.0.1"), &TrustedProxies::default());
        assert_eq!(addr, "198.51.100.7");
    }

    #[test]
    fn test_peer_address_without_headers() {
        let addr = resolve_client_address(&HeaderMap::new(), peer("10.1.2.3"), &TrustedProxies::default());
        assert_eq!(addr, "10.1.2.3");
    }

    #[test]
    fn test_unknown_without_anything() {
        let addr = resolve_client_address(&HeaderMap::new(), None, &TrustedProxies::default());
        assert_eq!(addr, UNKNOWN_CLIENT);
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let proxies = TrustedProxies::new(&["10.0.0.0/8".to_string()]);
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);

        assert_eq!(resolve_client_address(&h, peer("10.0.0.5"), &proxies), "1.2.3.4");
        assert_eq!(resolve_client_address(&h, peer("8.8.8.8"), &proxies), "8.8.8.8");
        assert_eq!(resolve_client_address(&h, None, &proxies), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_invalid_cidrs_skipped() {
        let proxies = TrustedProxies::new(&["garbage".to_string()]);
        assert!(!proxies.is_enabled());
    }
}
