//! Host name resolution with per-engine memoization.
//!
//! Three strategies are tried in order: literal address syntax, a standard
//! forward lookup, and finally a connectionless UDP probe that lets the
//! operating system resolve the peer without any packet being sent. The
//! probe covers edge-case names the forward lookup mishandles, without
//! pulling in a full DNS client.

use crate::error::Error;
use std::collections::HashMap;
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket,
};
use tracing::trace;

/// Port the connect probe aims at. Nothing is ever sent to it.
const PROBE_PORT: u16 = 30000;

//------------ AddressResolver -----------------------------------------------

/// Resolves host strings to addresses, memoized per engine lifetime.
///
/// Cache entries are never invalidated within a run; [`clear`][Self::clear]
/// drops them all on engine shutdown.
#[derive(Debug, Default)]
pub(crate) struct AddressResolver {
    /// Previously resolved hosts.
    cache: HashMap<String, IpAddr>,
}

impl AddressResolver {
    /// Resolves a host string to an address.
    pub fn resolve(&mut self, host: &str) -> Result<IpAddr, Error> {
        if let Some(addr) = self.cache.get(host) {
            return Ok(*addr);
        }
        let addr = Self::resolve_uncached(host)?;
        trace!(%host, %addr, "resolved");
        self.cache.insert(host.to_string(), addr);
        Ok(addr)
    }

    /// Drops all cached entries.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Runs the resolution strategies in order, first success wins.
    fn resolve_uncached(host: &str) -> Result<IpAddr, Error> {
        // Bracketed IPv6 literal. A malformed bracketed address is a
        // configuration error, not something a lookup could fix.
        if let Some(stripped) = host.strip_prefix('[') {
            let inner = stripped
                .strip_suffix(']')
                .ok_or_else(|| Error::InvalidAddress(host.to_string()))?;
            let addr = inner
                .parse::<Ipv6Addr>()
                .map_err(|_| Error::InvalidAddress(host.to_string()))?;
            return Ok(IpAddr::V6(addr));
        }

        // IPv4 literal.
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Ok(IpAddr::V4(addr));
        }

        // Forward lookup.
        if let Ok(mut addrs) = (host, 0u16).to_socket_addrs() {
            if let Some(addr) = addrs.next() {
                return Ok(addr.ip());
            }
        }

        match Self::probe(host) {
            Some(addr) => Ok(addr),
            None => Err(Error::ResolveFailed(host.to_string())),
        }
    }

    /// Fallback strategy: connect an unbound UDP socket toward the host to
    /// force the OS to resolve a route, then read the peer address back.
    /// The socket never transmits and is dropped right away.
    fn probe(host: &str) -> Option<IpAddr> {
        let locals = [
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        ];
        for local in locals {
            let sock = match UdpSocket::bind(local) {
                Ok(sock) => sock,
                Err(_) => continue,
            };
            if sock.connect((host, PROBE_PORT)).is_err() {
                continue;
            }
            if let Ok(peer) = sock.peer_addr() {
                return Some(peer.ip());
            }
        }
        None
    }
}

//------------ Utility --------------------------------------------------------

/// Splits a `host:port` string on its last colon.
///
/// A non-numeric suffix is treated as part of the host. IPv6 literals must
/// be bracketed, otherwise their last group is taken for a port.
pub fn parse_host(host: &str) -> (&str, Option<u16>) {
    match host.rsplit_once(':') {
        Some((addr, port)) => match port.parse::<u16>() {
            Ok(port) => (addr, Some(port)),
            Err(_) => (host, None),
        },
        None => (host, None),
    }
}

//============ Tests =========================================================
