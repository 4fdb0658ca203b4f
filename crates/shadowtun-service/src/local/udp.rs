//! Static UDP tunnel with a per-source NAT table
//!
//! One session per client source endpoint. Each session owns an encrypted
//! outbound socket to the remote peer, a single-slot mailbox feeding its
//! forward worker, and a receive worker whose read deadline is refreshed
//! before every read. UDP is lossy by contract: when the mailbox slot is
//! taken the datagram is dropped rather than queued.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::BytesMut;
use log::{debug, error, info, trace};
use shadowtun::{
    net,
    relay::{
        socks5::Address,
        udprelay::{decrypt_payload, encrypt_prefixed_payload},
    },
    ServerAddr, ServerConfig,
};
use tokio::{net::UdpSocket, sync::mpsc, time};

use crate::net::{bind_outbound_udp, BufferPool};

type NatMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// Run a UDP tunnel from `listen` to `target` through `svr_cfg`
pub async fn run_udp_tunnel(
    listen: ServerAddr,
    target: Address,
    svr_cfg: Arc<ServerConfig>,
    timeout: Duration,
    pool: Arc<BufferPool>,
) -> io::Result<()> {
    // the remote peer address is resolved once at startup
    let server_addr = net::resolve_remote(&Address::from(svr_cfg.addr())).await?;

    let inbound = Arc::new(net::bind_udp(&listen).await?);

    info!(
        "UDP tunnel {} <-> {} <-> {}",
        inbound.local_addr()?,
        svr_cfg.addr(),
        target
    );

    let mut tgt_buf = BytesMut::with_capacity(target.serialized_len());
    target.write_to_buf(&mut tgt_buf);
    let tgt = tgt_buf.freeze();

    let nat: NatMap = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let mut buf = pool.get();
        // target address prefix travels in front of every payload
        buf[..tgt.len()].copy_from_slice(&tgt);

        let (n, peer_addr) = match inbound.recv_from(&mut buf[tgt.len()..]).await {
            Ok(v) => v,
            Err(err) => {
                error!("udp tunnel recv_from failed with error: {}", err);
                pool.put(buf);
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        buf.truncate(tgt.len() + n);

        let mut guard = nat.lock().unwrap();
        let tx = match guard.get(&peer_addr) {
            Some(tx) => tx.clone(),
            None => {
                let outbound = match bind_outbound_udp(&server_addr) {
                    Ok(s) => Arc::new(s),
                    Err(err) => {
                        error!("failed to create outbound udp socket: {}", err);
                        drop(guard);
                        pool.put(buf);
                        continue;
                    }
                };

                // single-slot mailbox, excess datagrams are dropped
                let (tx, rx) = mpsc::channel(1);
                guard.insert(peer_addr, tx.clone());

                trace!("created udp session for {}", peer_addr);

                tokio::spawn(forward_worker(
                    rx,
                    outbound.clone(),
                    server_addr,
                    svr_cfg.clone(),
                    pool.clone(),
                ));
                tokio::spawn(receive_worker(
                    inbound.clone(),
                    outbound,
                    peer_addr,
                    svr_cfg.clone(),
                    timeout,
                    pool.clone(),
                    nat.clone(),
                ));

                tx
            }
        };
        drop(guard);

        // non-blocking send; a full slot drops the datagram
        if let Err(err) = tx.try_send(buf) {
            let buf = match err {
                mpsc::error::TrySendError::Full(b) => b,
                mpsc::error::TrySendError::Closed(b) => b,
            };
            pool.put(buf);
        }
    }
}

/// Seal `target || payload` mailbox buffers and send them to the remote peer
async fn forward_worker(
    mut rx: mpsc::Receiver<Vec<u8>>,
    outbound: Arc<UdpSocket>,
    server_addr: SocketAddr,
    svr_cfg: Arc<ServerConfig>,
    pool: Arc<BufferPool>,
) {
    let mut packet = BytesMut::new();

    while let Some(buf) = rx.recv().await {
        packet.clear();
        encrypt_prefixed_payload(svr_cfg.method(), svr_cfg.key(), &buf, &mut packet);

        if let Err(err) = outbound.send_to(&packet, server_addr).await {
            error!("udp tunnel write to {} failed with error: {}", server_addr, err);
        }

        pool.put(buf);
    }
}

/// Deliver replies from the remote peer back to the originating client
///
/// Terminates on idle timeout or error, tearing down the session: the map
/// entry is removed under the lock, which drops the mailbox sender and
/// stops the forward worker; the outbound socket closes with its last Arc.
async fn receive_worker(
    inbound: Arc<UdpSocket>,
    outbound: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    svr_cfg: Arc<ServerConfig>,
    timeout: Duration,
    pool: Arc<BufferPool>,
    nat: NatMap,
) {
    let mut buf = pool.get();

    loop {
        // deadline is refreshed ahead of each read
        let (n, _) = match time::timeout(timeout, outbound.recv_from(&mut buf)).await {
            Err(..) => {
                trace!("udp session for {} timed out", peer_addr);
                break;
            }
            Ok(Err(err)) => {
                debug!("udp session for {} read failed with error: {}", peer_addr, err);
                break;
            }
            Ok(Ok(v)) => v,
        };

        // strip the leading source address before delivering to the client
        let (payload_len, _src) = match decrypt_payload(svr_cfg.method(), svr_cfg.key(), &mut buf[..n]) {
            Ok(v) => v,
            Err(err) => {
                debug!("udp session for {} got invalid packet: {}", peer_addr, err);
                break;
            }
        };

        if let Err(err) = inbound.send_to(&buf[..payload_len], peer_addr).await {
            debug!("udp tunnel write to client {} failed with error: {}", peer_addr, err);
            break;
        }
    }

    pool.put(buf);
    nat.lock().unwrap().remove(&peer_addr);
}
