//! `host:port` address parsing.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::core::{AddressError, WILDCARD_HOST};

/// Parse `host:port` into a connectable socket address.
///
/// - An empty host means the IPv4 wildcard (`:4444`).
/// - IPv6 literals must be bracketed (`[::1]:4444`).
/// - Other hosts are resolved; IPv4 results are preferred.
pub fn parse_host_port(text: &str) -> Result<SocketAddr, AddressError> {
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| AddressError::MissingPort(text.to_string()))?;

    let port: u16 = port
        .parse()
        .map_err(|_| AddressError::InvalidPort(port.to_string()))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let host = if host.is_empty() { WILDCARD_HOST } else { host };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    resolve(host, port)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, AddressError> {
    let unknown = || AddressError::UnknownHost(host.to_string());
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| unknown())?
        .collect();

    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(unknown)
}
