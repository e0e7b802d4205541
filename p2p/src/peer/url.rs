//! # Service URL ↔ Multiaddr
//!
//! Peers advertise a `host:port` service URL; the transport dials
//! multiaddrs. This module converts between the two.
//!
//! Hostnames are resolved exactly once, when the multiaddr is built, and
//! the chosen IP is frozen into the result. When DNS returns several
//! addresses one is picked at random so that a fleet of nodes spreads over
//! the records instead of piling onto the first one.

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::warn;

/// Errors produced while converting service URLs and multiaddrs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrlError {
    /// The URL carries a scheme (`http://…`); service URLs are bare `host:port`.
    #[error("service url {0:?} must not contain a scheme")]
    SchemeNotAllowed(String),

    /// No port component.
    #[error("service url {0:?} is missing a port")]
    MissingPort(String),

    /// Port is not a decimal in 1..=65535.
    #[error("service url {0:?} has an invalid port")]
    InvalidPort(String),

    /// Host part is empty or malformed.
    #[error("service url {0:?} has an invalid host")]
    InvalidHost(String),

    /// DNS returned no usable address.
    #[error("could not resolve host {0:?}")]
    ResolveFailed(String),

    /// Multiaddr is not `ip4|ip6` + `tcp`.
    #[error("multiaddr {0} does not use an ip4/ip6 + tcp transport")]
    UnsupportedTransport(Multiaddr),
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// Hostname resolution, injectable so tests never touch real DNS.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Returns every IP address `host` resolves to.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, UrlError>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, UrlError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| UrlError::ResolveFailed(host.to_string()))?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Fixed host table.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    /// Empty table: every lookup fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the addresses for `host`.
    pub fn with_host(mut self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.entries.insert(host.to_string(), addrs);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, UrlError> {
        Ok(self.entries.get(host).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Converts a `host:port` service URL into `/ip4|ip6/<ip>/tcp/<port>`.
///
/// IP literals keep the family they were written in. A resolved IPv4-mapped
/// IPv6 address is unwrapped to `/ip4`.
pub async fn url_to_multiaddr(url: &str, resolver: &dyn Resolver) -> Result<Multiaddr, UrlError> {
    let (host, port) = split_host_port(url)?;

    let ip = match host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            let candidates = resolver.lookup(host).await?;
            unmap_ipv4(pick_address(host, candidates)?)
        }
    };

    Ok(ip_tcp_multiaddr(ip, port))
}

/// Converts `/ip4|ip6/<ip>/tcp/<port>[/p2p/<id>]` back into a service URL.
///
/// IPv6 hosts are bracketed. Any other transport fails.
pub fn multiaddr_to_url(multiaddr: &Multiaddr) -> Result<String, UrlError> {
    let unsupported = || UrlError::UnsupportedTransport(multiaddr.clone());
    let mut protocols = multiaddr.iter();

    let host = match protocols.next() {
        Some(Protocol::Ip4(ip)) => ip.to_string(),
        Some(Protocol::Ip6(ip)) => format!("[{ip}]"),
        _ => return Err(unsupported()),
    };
    let port = match protocols.next() {
        Some(Protocol::Tcp(port)) => port,
        _ => return Err(unsupported()),
    };
    match protocols.next() {
        None | Some(Protocol::P2p(_)) => {}
        Some(_) => return Err(unsupported()),
    }
    if protocols.next().is_some() {
        return Err(unsupported());
    }

    Ok(format!("{host}:{port}"))
}

/// Splits `host:port`, `[v6]:port`; validates scheme, port, and host shape.
fn split_host_port(url: &str) -> Result<(&str, u16), UrlError> {
    if url.contains("://") {
        return Err(UrlError::SchemeNotAllowed(url.to_string()));
    }

    let (host, port) = if let Some(rest) = url.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| UrlError::InvalidHost(url.to_string()))?;
        if tail.is_empty() {
            return Err(UrlError::MissingPort(url.to_string()));
        }
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| UrlError::InvalidHost(url.to_string()))?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(UrlError::InvalidHost(url.to_string()));
        }
        (host, port)
    } else {
        let (host, port) = url
            .rsplit_once(':')
            .ok_or_else(|| UrlError::MissingPort(url.to_string()))?;
        // An unbracketed IPv6 literal is ambiguous about where the port starts.
        if host.contains(':') {
            return Err(UrlError::InvalidHost(url.to_string()));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(UrlError::InvalidHost(url.to_string()));
    }
    if port.is_empty() {
        return Err(UrlError::MissingPort(url.to_string()));
    }
    if !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(UrlError::InvalidPort(url.to_string()));
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok((host, port)),
        _ => Err(UrlError::InvalidPort(url.to_string())),
    }
}

/// Picks one resolved address, logging the ones discarded.
fn pick_address(host: &str, candidates: Vec<IpAddr>) -> Result<IpAddr, UrlError> {
    match candidates.len() {
        0 => Err(UrlError::ResolveFailed(host.to_string())),
        1 => Ok(candidates[0]),
        n => {
            let mut buf = [0u8; 8];
            let index = match OsRng.try_fill_bytes(&mut buf) {
                Ok(()) => (u64::from_le_bytes(buf) % n as u64) as usize,
                Err(_) => 0,
            };
            let chosen = candidates[index];
            let discarded: Vec<String> = candidates
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, ip)| ip.to_string())
                .collect();
            warn!(
                host,
                chosen = %chosen,
                discarded = ?discarded,
                "hostname resolved to multiple addresses; using one"
            );
            Ok(chosen)
        }
    }
}

fn unmap_ipv4(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

fn ip_tcp_multiaddr(ip: IpAddr, port: u16) -> Multiaddr {
    let ip_protocol = match ip {
        IpAddr::V4(v4) => Protocol::Ip4(v4),
        IpAddr::V6(v6) => Protocol::Ip6(v6),
    };
    Multiaddr::empty().with(ip_protocol).with(Protocol::Tcp(port))
}

/// Loopback service URL for a port. Handy for local clusters.
pub fn loopback_url(port: u16) -> String {
    format!("{}:{port}", Ipv4Addr::LOCALHOST)
}
