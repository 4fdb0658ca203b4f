//! Inbound and outbound socket helpers
//!
//! Domain names are resolved through tokio's blocking-pool resolver
//! (`lookup_host`); every resolved address is tried in order.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    time::Duration,
};

use log::trace;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};

use crate::{config::ServerAddr, relay::socks5::Address};

/// Keep-alive probe interval applied to every relayed TCP socket
pub const TCP_KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Enable keep-alive messages on a TCP socket
pub fn set_tcp_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period).with_interval(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

async fn connect_host(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in lookup_host((host, port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                trace!("connected {}:{} via {}", host, port, addr);
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::new(ErrorKind::NotFound, "no address resolved")))
}

/// Connect to a configured proxy server
pub async fn connect_server(addr: &ServerAddr) -> io::Result<TcpStream> {
    match *addr {
        ServerAddr::SocketAddr(ref saddr) => TcpStream::connect(saddr).await,
        ServerAddr::DomainName(ref host, port) => connect_host(host, port).await,
    }
}

/// Connect to a proxied target address
pub async fn connect_remote(addr: &Address) -> io::Result<TcpStream> {
    match *addr {
        Address::SocketAddress(ref saddr) => TcpStream::connect(saddr).await,
        Address::DomainNameAddress(ref host, port) => connect_host(host, port).await,
    }
}

/// Resolve an address to its first `SocketAddr`
pub async fn resolve_remote(addr: &Address) -> io::Result<SocketAddr> {
    match *addr {
        Address::SocketAddress(saddr) => Ok(saddr),
        Address::DomainNameAddress(ref host, port) => match lookup_host((host.as_str(), port)).await?.next() {
            Some(saddr) => Ok(saddr),
            None => Err(io::Error::new(ErrorKind::NotFound, "no address resolved")),
        },
    }
}

/// Bind a TCP listener on a configured listen address
pub async fn bind_tcp(addr: &ServerAddr) -> io::Result<TcpListener> {
    match *addr {
        ServerAddr::SocketAddr(ref saddr) => TcpListener::bind(saddr).await,
        ServerAddr::DomainName(ref host, port) => TcpListener::bind((host.as_str(), port)).await,
    }
}

/// Bind a UDP socket on a configured listen address
pub async fn bind_udp(addr: &ServerAddr) -> io::Result<UdpSocket> {
    match *addr {
        ServerAddr::SocketAddr(ref saddr) => UdpSocket::bind(saddr).await,
        ServerAddr::DomainName(ref host, port) => UdpSocket::bind((host.as_str(), port)).await,
    }
}
