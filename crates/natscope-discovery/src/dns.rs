//! Host name resolution

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Resolve `host` to its first IPv4 address
///
/// Dotted-decimal literals are returned without a lookup.
///
/// # Errors
///
/// Returns an I/O error if the lookup fails or yields no IPv4 address.
pub async fn resolve_ipv4(host: &str) -> io::Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no IPv4 address for {host}"),
            )
        })
}

/// Whether `ip` is assigned to one of this host's interfaces
///
/// Probes by binding a throwaway UDP socket to the address.
///
/// # Errors
///
/// Returns the bind error unless it means the address is not local.
pub fn is_local_address(ip: Ipv4Addr) -> io::Result<bool> {
    match std::net::UdpSocket::bind((IpAddr::V4(ip), 0)) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AddrNotAvailable => Ok(false),
        Err(e) => Err(e),
    }
}
