//! Remote (server-side) services

use std::{io, sync::Arc, time::Duration};

use futures::{future, FutureExt};
use shadowtun::{relay::udprelay::MAXIMUM_UDP_PAYLOAD_SIZE, ServerAddr, ServerConfig};

use crate::net::BufferPool;

pub mod tcprelay;
pub mod udprelay;

/// Run TCP and UDP servers for every configured instance
///
/// Servers sharing one listen address become a single TCP listener whose
/// key candidates are tried in configuration order (cipher discovery).
/// Completes only if one of the listeners fails.
pub async fn run(servers: Vec<ServerConfig>, udp_timeout: Duration) -> io::Result<()> {
    if servers.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no server configured"));
    }

    let pool = Arc::new(BufferPool::new(MAXIMUM_UDP_PAYLOAD_SIZE));

    let mut groups: Vec<(ServerAddr, Vec<ServerConfig>)> = Vec::new();
    for svr in &servers {
        match groups.iter_mut().find(|(addr, _)| addr == svr.addr()) {
            Some((_, group)) => group.push(svr.clone()),
            None => groups.push((svr.addr().clone(), vec![svr.clone()])),
        }
    }

    let mut vfut = Vec::new();

    for (addr, group) in groups {
        vfut.push(tcprelay::run_tcp_server(addr, Arc::new(group)).boxed());
    }

    for svr in servers {
        vfut.push(udprelay::run_udp_server(Arc::new(svr), udp_timeout, pool.clone()).boxed());
    }

    let (res, ..) = future::select_all(vfut).await;
    res
}
