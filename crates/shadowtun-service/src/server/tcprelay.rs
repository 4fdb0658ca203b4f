//! Shadowsocks TCP server
//!
//! Accepts encrypted connections, identifies the client's key, reads the
//! target address from the decrypted head of the stream, dials the target
//! and relays. Per-connection failures never stop the listener.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, trace};
use shadowtun::{
    discover_cipher,
    net::{self, TCP_KEEPALIVE_PERIOD},
    relay::tcprelay::utils::copy_bidirectional,
    ServerAddr, ServerConfig,
};
use tokio::{net::TcpStream, time};

/// Run a TCP server on `listen` with `candidates` as the accepted keys
pub async fn run_tcp_server(listen: ServerAddr, candidates: Arc<Vec<ServerConfig>>) -> io::Result<()> {
    let listener = net::bind_tcp(&listen).await?;

    info!(
        "shadowsocks TCP server listening on {} with {} key(s)",
        listener.local_addr()?,
        candidates.len()
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(s) => s,
            Err(err) => {
                error!("tcp server accept failed with error: {}", err);
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let candidates = candidates.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_server_client(stream, peer_addr, &candidates).await {
                debug!("tcp server stream {} aborted with error: {}", peer_addr, err);
            }
        });
    }
}

async fn handle_server_client(stream: TcpStream, peer_addr: SocketAddr, candidates: &[ServerConfig]) -> io::Result<()> {
    let _ = net::set_tcp_keepalive(&stream, TCP_KEEPALIVE_PERIOD);

    let mut shadow = discover_cipher(stream, candidates).await?;

    let target_addr = shadow.handshake().await?;

    trace!(
        "accepted tcp client {}, establishing tunnel to {}",
        peer_addr,
        target_addr
    );

    let mut remote = net::connect_remote(&target_addr).await?;
    let _ = net::set_tcp_keepalive(&remote, TCP_KEEPALIVE_PERIOD);

    debug!("established tcp tunnel {} <-> {}", peer_addr, target_addr);

    match copy_bidirectional(&mut shadow, &mut remote).await {
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
