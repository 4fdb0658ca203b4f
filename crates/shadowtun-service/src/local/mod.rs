//! Local (client-side) services

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::{future, FutureExt};
use log::{debug, trace};
use shadowtun::{
    net::{self, TCP_KEEPALIVE_PERIOD},
    relay::{socks5::Address, tcprelay::utils::copy_bidirectional},
    ProxyClientStream, ServerConfig,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

use crate::{
    config::LocalConfig,
    net::BufferPool,
};

pub mod redir;
pub mod socks;
pub mod tunnel;
pub mod udp;

/// Run every service enabled in `config`, forwarding through `svr_cfg`
///
/// Completes only if one of the listeners fails.
pub async fn run(config: LocalConfig, svr_cfg: Arc<ServerConfig>, udp_timeout: Duration) -> io::Result<()> {
    if config.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "no local service enabled, set at least one of socks/tcptun/udptun/redir",
        ));
    }

    let mut vfut = Vec::new();

    if let Some(ref addr) = config.socks {
        vfut.push(socks::run_socks_local(addr.clone(), svr_cfg.clone()).boxed());
    }

    for tun in &config.tcp_tunnels {
        vfut.push(tunnel::run_tcp_tunnel(tun.local.clone(), tun.remote.clone(), svr_cfg.clone()).boxed());
    }

    if !config.udp_tunnels.is_empty() {
        let pool = Arc::new(BufferPool::new(shadowtun::relay::udprelay::MAXIMUM_UDP_PAYLOAD_SIZE));
        for tun in &config.udp_tunnels {
            vfut.push(
                udp::run_udp_tunnel(
                    tun.local.clone(),
                    tun.remote.clone(),
                    svr_cfg.clone(),
                    udp_timeout,
                    pool.clone(),
                )
                .boxed(),
            );
        }
    }

    if let Some(ref addr) = config.redir {
        vfut.push(redir::run_redir_local(addr.clone(), svr_cfg.clone()).boxed());
    }

    if let Some(ref addr) = config.redir6 {
        vfut.push(redir::run_redir_local(addr.clone(), svr_cfg.clone()).boxed());
    }

    let (res, ..) = future::select_all(vfut).await;
    res
}

/// Dial the remote peer for `target_addr` and relay `plain` through it
///
/// The encoded target rides in the first sealed chunk. If the client says
/// nothing for 500ms (server-talks-first protocols), the tunnel header is
/// flushed alone so the remote can start dialing.
pub(crate) async fn establish_tcp_tunnel(
    mut plain: TcpStream,
    peer_addr: SocketAddr,
    target_addr: &Address,
    svr_cfg: &ServerConfig,
) -> io::Result<()> {
    let mut shadow = ProxyClientStream::connect(svr_cfg, target_addr).await?;
    let _ = net::set_tcp_keepalive(shadow.get_ref(), TCP_KEEPALIVE_PERIOD);

    debug!(
        "established tcp tunnel {} <-> {} through server {}",
        peer_addr,
        target_addr,
        svr_cfg.addr()
    );

    {
        let mut buffer = [0u8; 8192];
        match time::timeout(Duration::from_millis(500), plain.read(&mut buffer)).await {
            Ok(Ok(0)) => {
                // EOF, nothing was ever sent
                return Ok(());
            }
            Ok(Ok(n)) => {
                shadow.write_all(&buffer[..n]).await?;
            }
            Ok(Err(err)) => return Err(err),
            Err(..) => {
                // header only, no data yet
                shadow.write(&[]).await?;

                trace!(
                    "tcp tunnel {} -> {} sent handshake without data",
                    peer_addr,
                    target_addr
                );
            }
        }
    }

    match copy_bidirectional(&mut plain, &mut shadow).await {
        Ok((rn, wn)) => {
            trace!(
                "tcp tunnel {} <-> {} closed, L2R {} bytes, R2L {} bytes",
                peer_addr,
                target_addr,
                rn,
                wn
            );
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::TimedOut => Ok(()),
        Err(err) => {
            trace!("tcp tunnel {} <-> {} closed with error: {}", peer_addr, target_addr, err);
            Err(err)
        }
    }
}
